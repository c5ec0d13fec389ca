//! Container/codec collaborator interfaces.
//!
//! The pipeline never talks to a codec library directly. A [`MediaBackend`] opens a file and
//! hands back one [`Demux`] plus at most one [`VideoDecoder`] and one [`AudioDecoder`]; each of
//! those moves onto its own worker thread. Two backends ship with the crate: FFmpeg (feature
//! `ffmpeg`) and a deterministic synthetic test pattern.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::time::{Seconds, TimeBase};

pub mod convert;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod frame;
pub mod resample;
pub mod synthetic;

pub use convert::{software_converter, PixelConverter};
pub use frame::{
    AudioFormat, FramePixels, HardwareSurface, PixelFormat, PixelLayout, Plane, PlanarImage,
    RawAudioFrame, RawImage, RawVideoFrame, SampleFormat, VideoFrame,
};
pub use resample::{LinearResampler, Resampler};

/// Error type for opening media. Any of these aborts the open attempt.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("Cannot open container: {0}")]
    Container(String),
    #[error("No playable audio or video stream")]
    NoPlayableStream,
    #[error("No {kind} decoder for codec {codec}")]
    DecoderNotFound { kind: StreamKind, codec: String },
    #[error("Failed to open {kind} decoder: {reason}")]
    DecoderOpen { kind: StreamKind, reason: String },
    #[error("Hardware decoding unavailable: {0}")]
    HardwareUnavailable(String),
}

/// Error type for mid-stream demux and decode operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Read error: {0}")]
    Read(String),
    #[error("Seek failed: {0}")]
    Seek(String),
    #[error("Unsupported pixel format: {0}")]
    UnsupportedPixelFormat(PixelFormat),
    #[error("Unsupported audio format: {0}")]
    UnsupportedAudioFormat(String),
    #[error("Hardware frame transfer failed: {0}")]
    Transfer(String),
}

/// Track classification used for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Other,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
            StreamKind::Other => write!(f, "other"),
        }
    }
}

/// Requested decode path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMode {
    /// Prefer hardware, fall back to software when hardware init fails
    #[default]
    Auto,
    /// Hardware only; init failure is an open failure
    Hardware,
    /// Software only
    Software,
}

impl fmt::Display for DecodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeMode::Auto => write!(f, "auto"),
            DecodeMode::Hardware => write!(f, "hardware"),
            DecodeMode::Software => write!(f, "software"),
        }
    }
}

impl FromStr for DecodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DecodeMode::Auto),
            "hardware" | "hw" => Ok(DecodeMode::Hardware),
            "software" | "sw" => Ok(DecodeMode::Software),
            other => Err(format!("unknown decode mode '{}'", other)),
        }
    }
}

/// One compressed unit read from the container.
#[derive(Debug, Clone)]
pub struct CompressedUnit {
    pub stream_index: usize,
    pub data: Vec<u8>,
    /// Timestamps in the stream's time base
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub keyframe: bool,
}

/// Result of a container read.
#[derive(Debug)]
pub enum ReadOutcome {
    Unit(CompressedUnit),
    EndOfStream,
}

/// Video stream information
#[derive(Debug, Clone)]
pub struct VideoStreamInfo {
    pub index: usize,
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub time_base: TimeBase,
    /// Whether the opened decoder runs on a hardware device
    pub hardware: bool,
    /// The hardware device serialises its own calls across threads
    pub multithread_protected: bool,
}

/// Audio stream information
#[derive(Debug, Clone)]
pub struct AudioStreamInfo {
    pub index: usize,
    pub codec_name: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub time_base: TimeBase,
}

/// What an open produced, for the GUI and for stream routing.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub duration: Seconds,
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
}

impl MediaInfo {
    pub fn stream_kind(&self, index: usize) -> StreamKind {
        if self.video.as_ref().is_some_and(|v| v.index == index) {
            StreamKind::Video
        } else if self.audio.as_ref().is_some_and(|a| a.index == index) {
            StreamKind::Audio
        } else {
            StreamKind::Other
        }
    }
}

/// Owner of the container handle. Runs on the demux thread.
pub trait Demux: Send {
    /// Read the next compressed unit of any stream.
    fn read(&mut self) -> Result<ReadOutcome, DecodeError>;

    /// Seek to the nearest keyframe at or before `seconds`.
    fn seek(&mut self, seconds: Seconds) -> Result<(), DecodeError>;
}

/// Video codec instance. Runs on the video decode thread.
pub trait VideoDecoder: Send {
    /// Feed one compressed unit.
    fn send(&mut self, unit: &CompressedUnit) -> Result<(), DecodeError>;

    /// Signal end of input so buffered frames can be drained.
    fn send_eof(&mut self) -> Result<(), DecodeError>;

    /// Take the next decoded frame, `None` when the codec needs more input.
    fn receive(&mut self) -> Result<Option<RawVideoFrame>, DecodeError>;

    /// Drop all internal state; ready for input from a new position.
    fn flush(&mut self);

    /// Build the colorspace converter for a software frame format.
    fn converter(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn PixelConverter>, DecodeError> {
        software_converter(format, width, height)
    }
}

/// Audio codec instance. Runs on the audio decode thread.
pub trait AudioDecoder: Send {
    fn send(&mut self, unit: &CompressedUnit) -> Result<(), DecodeError>;

    fn send_eof(&mut self) -> Result<(), DecodeError>;

    fn receive(&mut self) -> Result<Option<RawAudioFrame>, DecodeError>;

    fn flush(&mut self);

    /// Build the resampler converting `input` to the fixed output format.
    fn resampler(&mut self, input: AudioFormat) -> Result<Box<dyn Resampler>, DecodeError> {
        Ok(Box::new(LinearResampler::new(input)?))
    }
}

/// Everything an open produced, ready to be moved onto worker threads.
pub struct OpenedMedia {
    pub info: MediaInfo,
    pub demux: Box<dyn Demux>,
    pub video: Option<Box<dyn VideoDecoder>>,
    pub audio: Option<Box<dyn AudioDecoder>>,
}

impl fmt::Debug for OpenedMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedMedia")
            .field("info", &self.info)
            .field("video", &self.video.is_some())
            .field("audio", &self.audio.is_some())
            .finish()
    }
}

/// Container/codec library entry point.
pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, path: &Path, mode: DecodeMode) -> Result<OpenedMedia, OpenError>;
}

/// Pick a video decoder according to `mode`.
///
/// Hardware init failure falls back to software in [`DecodeMode::Auto`] and becomes an open
/// failure in [`DecodeMode::Hardware`]. Returns the decoder and whether it is hardware backed.
pub fn select_video_decoder<D>(
    mode: DecodeMode,
    hardware: impl FnOnce() -> Result<D, OpenError>,
    software: impl FnOnce() -> Result<D, OpenError>,
) -> Result<(D, bool), OpenError> {
    match mode {
        DecodeMode::Software => software().map(|d| (d, false)),
        DecodeMode::Hardware => hardware().map(|d| (d, true)),
        DecodeMode::Auto => match hardware() {
            Ok(decoder) => Ok((decoder, true)),
            Err(err) => {
                tracing::info!("hardware decoding unavailable ({}), using software", err);
                software().map(|d| (d, false))
            }
        },
    }
}
