//! Deterministic test-pattern media backend.
//!
//! Produces a container with an optional video stream (90 kHz time base, keyframe every `gop`
//! frames), an optional sine-tone audio stream and an optional unrelated data stream. Packets
//! are interleaved by presentation time the way a muxer would write them. Used by the test
//! suite and the `--test-pattern` mode of the binary.

use std::collections::VecDeque;
use std::f64::consts::TAU;
use std::path::Path;

use crate::core::time::{Seconds, TimeBase};
use crate::media::frame::{
    AudioFormat, HardwareSurface, PixelFormat, PlanarImage, Plane, RawAudioFrame, RawImage,
    RawVideoFrame, SampleFormat,
};
use crate::media::{
    select_video_decoder, AudioDecoder, AudioStreamInfo, CompressedUnit, DecodeError, DecodeMode,
    Demux, MediaBackend, MediaInfo, OpenError, OpenedMedia, ReadOutcome, VideoDecoder,
    VideoStreamInfo,
};

/// Video time base of the synthetic container
pub const VIDEO_TIME_BASE: TimeBase = TimeBase::new(1, 90_000);

/// Video stream parameters
#[derive(Debug, Clone)]
pub struct SyntheticVideo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Frames per group of pictures; seeks land on multiples of this
    pub gop: u64,
    /// Whether a hardware decode path exists for this stream
    pub hardware: bool,
    /// Frames the decoder holds back until more input or end of stream arrives
    pub latency: usize,
    /// Frame index whose hardware download fails
    pub failed_download: Option<u64>,
    /// The hardware path reports a multithread-protected device
    pub multithread_protected: bool,
}

impl Default for SyntheticVideo {
    fn default() -> Self {
        Self {
            width: 64,
            height: 36,
            fps: 30.0,
            gop: 15,
            hardware: false,
            latency: 1,
            failed_download: None,
            multithread_protected: false,
        }
    }
}

/// Audio stream parameters. Decoded audio is planar f32.
#[derive(Debug, Clone)]
pub struct SyntheticAudio {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in each packet
    pub frame_samples: usize,
    pub tone_hz: f64,
    pub amplitude: f32,
}

impl Default for SyntheticAudio {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            frame_samples: 1024,
            tone_hz: 440.0,
            amplitude: 0.25,
        }
    }
}

/// Shape of the synthetic container.
#[derive(Debug, Clone)]
pub struct SyntheticOptions {
    pub duration: Seconds,
    pub video: Option<SyntheticVideo>,
    pub audio: Option<SyntheticAudio>,
    /// Add a data stream the player must ignore
    pub extra_stream: bool,
    /// Reads fail once the next packet's time reaches this point
    pub fail_read_at: Option<Seconds>,
    /// Make every open fail with this container error
    pub open_failure: Option<String>,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            duration: 2.0,
            video: Some(SyntheticVideo::default()),
            audio: Some(SyntheticAudio::default()),
            extra_stream: false,
            fail_read_at: None,
            open_failure: None,
        }
    }
}

impl SyntheticOptions {
    pub fn video_only(duration: Seconds) -> Self {
        Self {
            duration,
            audio: None,
            ..Self::default()
        }
    }

    pub fn audio_only(duration: Seconds) -> Self {
        Self {
            duration,
            video: None,
            ..Self::default()
        }
    }

    fn video_frames(&self) -> u64 {
        self.video
            .as_ref()
            .map(|v| (self.duration * v.fps).ceil().max(0.0) as u64)
            .unwrap_or(0)
    }

    fn audio_samples(&self) -> u64 {
        self.audio
            .as_ref()
            .map(|a| (self.duration * a.sample_rate as f64).round().max(0.0) as u64)
            .unwrap_or(0)
    }
}

/// Backend handing out synthetic containers regardless of the path.
#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    options: SyntheticOptions,
}

impl SyntheticBackend {
    pub fn new(options: SyntheticOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SyntheticOptions {
        &self.options
    }
}

impl MediaBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open(&self, path: &Path, mode: DecodeMode) -> Result<OpenedMedia, OpenError> {
        let opts = &self.options;
        if let Some(reason) = &opts.open_failure {
            return Err(OpenError::Container(reason.clone()));
        }
        if opts.video.is_none() && opts.audio.is_none() {
            return Err(OpenError::NoPlayableStream);
        }

        let mut next_index = 0;
        let mut take_index = || {
            let index = next_index;
            next_index += 1;
            index
        };
        let video_index = opts.video.as_ref().map(|_| take_index());
        let audio_index = opts.audio.as_ref().map(|_| take_index());
        let other_index = opts.extra_stream.then(&mut take_index);

        let mut video_info = None;
        let mut video_decoder: Option<Box<dyn VideoDecoder>> = None;
        if let (Some(params), Some(index)) = (&opts.video, video_index) {
            let (decoder, hardware) = select_video_decoder(
                mode,
                || {
                    if params.hardware {
                        Ok(SyntheticVideoDecoder::new(params.clone(), true))
                    } else {
                        Err(OpenError::HardwareUnavailable(
                            "synthetic stream has no hardware path".into(),
                        ))
                    }
                },
                || Ok(SyntheticVideoDecoder::new(params.clone(), false)),
            )?;
            video_info = Some(VideoStreamInfo {
                index,
                codec_name: "testsrc".into(),
                width: params.width,
                height: params.height,
                fps: params.fps,
                time_base: VIDEO_TIME_BASE,
                hardware,
                multithread_protected: hardware && params.multithread_protected,
            });
            video_decoder = Some(Box::new(decoder));
        }

        let mut audio_info = None;
        let mut audio_decoder: Option<Box<dyn AudioDecoder>> = None;
        if let (Some(params), Some(index)) = (&opts.audio, audio_index) {
            audio_info = Some(AudioStreamInfo {
                index,
                codec_name: "sine".into(),
                sample_rate: params.sample_rate,
                channels: params.channels,
                time_base: TimeBase::new(1, params.sample_rate as i32),
            });
            audio_decoder = Some(Box::new(SyntheticAudioDecoder::new(
                params.clone(),
                opts.audio_samples(),
            )));
        }

        tracing::debug!(
            "synthetic open: video={:?} audio={:?} other={:?} mode={}",
            video_index,
            audio_index,
            other_index,
            mode
        );

        Ok(OpenedMedia {
            info: MediaInfo {
                path: path.to_path_buf(),
                duration: opts.duration,
                video: video_info,
                audio: audio_info,
            },
            demux: Box::new(SyntheticDemux {
                opts: opts.clone(),
                video_index,
                audio_index,
                other_index,
                next_video: 0,
                next_audio: 0,
                next_other: 0,
            }),
            video: video_decoder,
            audio: audio_decoder,
        })
    }
}

fn video_ticks(index: u64, fps: f64) -> i64 {
    (index as f64 * 90_000.0 / fps).round() as i64
}

fn decode_counter(unit: &CompressedUnit) -> Result<u64, DecodeError> {
    let bytes: [u8; 8] = unit
        .data
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| DecodeError::Codec(format!("truncated packet ({} bytes)", unit.data.len())))?;
    Ok(u64::from_le_bytes(bytes))
}

/// Interleaving demuxer over the synthetic streams.
#[derive(Debug)]
pub struct SyntheticDemux {
    opts: SyntheticOptions,
    video_index: Option<usize>,
    audio_index: Option<usize>,
    other_index: Option<usize>,
    next_video: u64,
    /// Packet counter, not samples
    next_audio: u64,
    next_other: u64,
}

#[derive(Clone, Copy)]
enum Pick {
    Video,
    Audio,
    Other,
}

impl SyntheticDemux {
    fn next_pick(&self) -> Option<(Seconds, Pick)> {
        let mut best: Option<(Seconds, Pick)> = None;
        let mut consider = |time: Seconds, pick: Pick| {
            if best.map_or(true, |(t, _)| time < t) {
                best = Some((time, pick));
            }
        };

        if let Some(v) = &self.opts.video {
            if self.next_video < self.opts.video_frames() {
                consider(self.next_video as f64 / v.fps, Pick::Video);
            }
        }
        if let Some(a) = &self.opts.audio {
            let offset = self.next_audio * a.frame_samples as u64;
            if offset < self.opts.audio_samples() {
                consider(offset as f64 / a.sample_rate as f64, Pick::Audio);
            }
        }
        if self.other_index.is_some() && (self.next_other as f64) < self.opts.duration {
            consider(self.next_other as f64, Pick::Other);
        }
        best
    }
}

impl Demux for SyntheticDemux {
    fn read(&mut self) -> Result<ReadOutcome, DecodeError> {
        let Some((time, pick)) = self.next_pick() else {
            return Ok(ReadOutcome::EndOfStream);
        };
        if self.opts.fail_read_at.is_some_and(|at| time >= at) {
            return Err(DecodeError::Read(format!("I/O error at {:.3}s", time)));
        }

        let unit = match (pick, &self.opts.video, &self.opts.audio) {
            (Pick::Video, Some(v), _) => {
                let index = self.next_video;
                self.next_video += 1;
                let pts = video_ticks(index, v.fps);
                CompressedUnit {
                    stream_index: self.video_index.unwrap_or_default(),
                    data: index.to_le_bytes().to_vec(),
                    pts: Some(pts),
                    dts: Some(pts),
                    keyframe: index % v.gop.max(1) == 0,
                }
            }
            (Pick::Audio, _, Some(a)) => {
                let offset = self.next_audio * a.frame_samples as u64;
                self.next_audio += 1;
                CompressedUnit {
                    stream_index: self.audio_index.unwrap_or_default(),
                    data: offset.to_le_bytes().to_vec(),
                    pts: Some(offset as i64),
                    dts: Some(offset as i64),
                    keyframe: true,
                }
            }
            _ => {
                let second = self.next_other;
                self.next_other += 1;
                CompressedUnit {
                    stream_index: self.other_index.unwrap_or_default(),
                    data: vec![0xA5; 16],
                    pts: Some(second as i64 * 1000),
                    dts: None,
                    keyframe: true,
                }
            }
        };
        Ok(ReadOutcome::Unit(unit))
    }

    fn seek(&mut self, seconds: Seconds) -> Result<(), DecodeError> {
        let target = seconds.max(0.0);
        let anchor = match &self.opts.video {
            Some(v) => {
                let gop = v.gop.max(1);
                let frame = (target * v.fps).floor() as u64;
                self.next_video = frame / gop * gop;
                self.next_video as f64 / v.fps
            }
            None => target,
        };
        if let Some(a) = &self.opts.audio {
            self.next_audio = (anchor * a.sample_rate as f64 / a.frame_samples as f64).floor() as u64;
        }
        self.next_other = anchor.floor() as u64;
        tracing::trace!("synthetic seek {:.3}s -> keyframe at {:.3}s", target, anchor);
        Ok(())
    }
}

/// Test-pattern video decoder. Frame `n` has a flat luma of `16 + n % 200`.
#[derive(Debug)]
pub struct SyntheticVideoDecoder {
    params: SyntheticVideo,
    hardware: bool,
    pending: VecDeque<u64>,
    draining: bool,
}

impl SyntheticVideoDecoder {
    pub fn new(params: SyntheticVideo, hardware: bool) -> Self {
        Self {
            params,
            hardware,
            pending: VecDeque::new(),
            draining: false,
        }
    }

    /// Luma value painted into frame `index`.
    pub fn luma_for(index: u64) -> u8 {
        16 + (index % 200) as u8
    }

    fn build(&self, index: u64) -> RawVideoFrame {
        let (w, h) = (self.params.width, self.params.height);
        let luma = Self::luma_for(index);
        let image = if self.hardware {
            RawImage::Surface(Box::new(SyntheticSurface {
                width: w,
                height: h,
                luma,
                fail: self.params.failed_download == Some(index),
            }))
        } else {
            let (wu, hu) = (w as usize, h as usize);
            let (cw, ch) = (wu.div_ceil(2), hu.div_ceil(2));
            RawImage::Software(PlanarImage {
                format: PixelFormat::Yuv420p,
                width: w,
                height: h,
                planes: vec![
                    Plane::new(vec![luma; wu * hu], wu),
                    Plane::new(vec![128; cw * ch], cw),
                    Plane::new(vec![128; cw * ch], cw),
                ],
            })
        };
        RawVideoFrame {
            pts: Some(video_ticks(index, self.params.fps)),
            width: w,
            height: h,
            image,
        }
    }
}

impl VideoDecoder for SyntheticVideoDecoder {
    fn send(&mut self, unit: &CompressedUnit) -> Result<(), DecodeError> {
        if self.draining {
            return Err(DecodeError::Codec("packet sent after end of stream".into()));
        }
        let index = decode_counter(unit)?;
        self.pending.push_back(index);
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), DecodeError> {
        self.draining = true;
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<RawVideoFrame>, DecodeError> {
        if self.pending.len() > self.params.latency || (self.draining && !self.pending.is_empty()) {
            let index = self.pending.pop_front().unwrap_or_default();
            return Ok(Some(self.build(index)));
        }
        Ok(None)
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.draining = false;
    }
}

/// Hardware surface stand-in that downloads as NV12.
struct SyntheticSurface {
    width: u32,
    height: u32,
    luma: u8,
    fail: bool,
}

impl HardwareSurface for SyntheticSurface {
    fn download(&self) -> Result<PlanarImage, DecodeError> {
        if self.fail {
            return Err(DecodeError::Transfer("surface lost".into()));
        }
        let (w, h) = (self.width as usize, self.height as usize);
        let chroma_stride = w.div_ceil(2) * 2;
        Ok(PlanarImage {
            format: PixelFormat::Nv12,
            width: self.width,
            height: self.height,
            planes: vec![
                Plane::new(vec![self.luma; w * h], w),
                Plane::new(vec![128; chroma_stride * h.div_ceil(2)], chroma_stride),
            ],
        })
    }
}

/// Sine-tone audio decoder.
#[derive(Debug)]
pub struct SyntheticAudioDecoder {
    params: SyntheticAudio,
    total_samples: u64,
    pending: VecDeque<u64>,
}

impl SyntheticAudioDecoder {
    pub fn new(params: SyntheticAudio, total_samples: u64) -> Self {
        Self {
            params,
            total_samples,
            pending: VecDeque::new(),
        }
    }

    fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.params.sample_rate,
            channels: self.params.channels,
            sample_format: SampleFormat::F32,
            planar: true,
        }
    }
}

impl AudioDecoder for SyntheticAudioDecoder {
    fn send(&mut self, unit: &CompressedUnit) -> Result<(), DecodeError> {
        let offset = decode_counter(unit)?;
        self.pending.push_back(offset);
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), DecodeError> {
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<RawAudioFrame>, DecodeError> {
        while let Some(offset) = self.pending.pop_front() {
            if offset >= self.total_samples {
                continue;
            }
            let samples = (self.total_samples - offset).min(self.params.frame_samples as u64) as usize;
            let rate = self.params.sample_rate as f64;
            let plane: Vec<u8> = (0..samples)
                .flat_map(|i| {
                    let t = (offset + i as u64) as f64 / rate;
                    let v = self.params.amplitude * (TAU * self.params.tone_hz * t).sin() as f32;
                    v.to_le_bytes()
                })
                .collect();
            return Ok(Some(RawAudioFrame {
                pts: Some(offset as i64),
                format: self.format(),
                samples,
                planes: vec![plane; self.params.channels as usize],
            }));
        }
        Ok(None)
    }

    fn flush(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StreamKind;

    fn open(options: SyntheticOptions, mode: DecodeMode) -> Result<OpenedMedia, OpenError> {
        SyntheticBackend::new(options).open(Path::new("pattern.mp4"), mode)
    }

    fn read_all(demux: &mut dyn Demux) -> Vec<CompressedUnit> {
        let mut units = Vec::new();
        while let ReadOutcome::Unit(unit) = demux.read().unwrap() {
            units.push(unit);
        }
        units
    }

    #[test]
    fn test_packets_interleave_by_time() {
        let mut media = open(SyntheticOptions::default(), DecodeMode::Auto).unwrap();
        let info = media.info.clone();
        let units = read_all(media.demux.as_mut());

        let video = info.video.as_ref().unwrap();
        let audio = info.audio.as_ref().unwrap();
        let times: Vec<f64> = units
            .iter()
            .map(|u| match info.stream_kind(u.stream_index) {
                StreamKind::Video => video.time_base.to_seconds(u.pts.unwrap()),
                StreamKind::Audio => audio.time_base.to_seconds(u.pts.unwrap()),
                StreamKind::Other => unreachable!(),
            })
            .collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1] + 1e-9));

        let video_count = units.iter().filter(|u| u.stream_index == video.index).count();
        assert_eq!(video_count, 60);
        assert!(matches!(media.demux.read().unwrap(), ReadOutcome::EndOfStream));
    }

    #[test]
    fn test_seek_lands_on_preceding_keyframe() {
        let mut media = open(SyntheticOptions::video_only(4.0), DecodeMode::Software).unwrap();
        media.demux.seek(1.9).unwrap();
        let ReadOutcome::Unit(unit) = media.demux.read().unwrap() else {
            panic!("expected a unit after seek");
        };
        assert!(unit.keyframe);
        // frame 57 rounds down to keyframe 45
        assert_eq!(unit.pts, Some(video_ticks(45, 30.0)));
    }

    #[test]
    fn test_hardware_only_without_hardware_fails() {
        let result = open(SyntheticOptions::default(), DecodeMode::Hardware);
        assert!(matches!(result, Err(OpenError::HardwareUnavailable(_))));

        let media = open(SyntheticOptions::default(), DecodeMode::Auto).unwrap();
        assert!(!media.info.video.unwrap().hardware);
    }

    #[test]
    fn test_hardware_frames_download_as_nv12() {
        let mut options = SyntheticOptions::video_only(1.0);
        if let Some(v) = options.video.as_mut() {
            v.hardware = true;
            v.latency = 0;
        }
        let mut media = open(options, DecodeMode::Auto).unwrap();
        assert!(media.info.video.as_ref().unwrap().hardware);
        let ReadOutcome::Unit(unit) = media.demux.read().unwrap() else {
            panic!("expected a unit");
        };
        let decoder = media.video.as_mut().unwrap();
        decoder.send(&unit).unwrap();
        let frame = decoder.receive().unwrap().unwrap();
        let RawImage::Surface(surface) = frame.image else {
            panic!("expected a hardware surface");
        };
        let image = surface.download().unwrap();
        assert_eq!(image.format, PixelFormat::Nv12);
        image.validate().unwrap();
    }

    #[test]
    fn test_decoder_latency_and_drain() {
        let mut decoder = SyntheticVideoDecoder::new(SyntheticVideo::default(), false);
        let unit = |i: u64| CompressedUnit {
            stream_index: 0,
            data: i.to_le_bytes().to_vec(),
            pts: None,
            dts: None,
            keyframe: true,
        };
        decoder.send(&unit(0)).unwrap();
        assert!(decoder.receive().unwrap().is_none());
        decoder.send(&unit(1)).unwrap();
        assert_eq!(decoder.receive().unwrap().unwrap().pts, Some(0));
        assert!(decoder.receive().unwrap().is_none());

        decoder.send_eof().unwrap();
        assert_eq!(decoder.receive().unwrap().unwrap().pts, Some(3000));
        assert!(decoder.receive().unwrap().is_none());
        assert!(decoder.send(&unit(2)).is_err());

        decoder.flush();
        assert!(decoder.send(&unit(2)).is_ok());
    }

    #[test]
    fn test_read_failure_injected() {
        let options = SyntheticOptions {
            fail_read_at: Some(0.5),
            ..SyntheticOptions::video_only(2.0)
        };
        let mut media = open(options, DecodeMode::Software).unwrap();
        let mut count = 0;
        let err = loop {
            match media.demux.read() {
                Ok(ReadOutcome::Unit(_)) => count += 1,
                Ok(ReadOutcome::EndOfStream) => panic!("expected a read error"),
                Err(err) => break err,
            }
        };
        assert_eq!(count, 15);
        assert!(matches!(err, DecodeError::Read(_)));
    }

    #[test]
    fn test_audio_tail_is_truncated() {
        let params = SyntheticAudio::default();
        let mut decoder = SyntheticAudioDecoder::new(params, 1500);
        for offset in [0u64, 1024] {
            decoder
                .send(&CompressedUnit {
                    stream_index: 1,
                    data: offset.to_le_bytes().to_vec(),
                    pts: Some(offset as i64),
                    dts: None,
                    keyframe: true,
                })
                .unwrap();
        }
        assert_eq!(decoder.receive().unwrap().unwrap().samples, 1024);
        let tail = decoder.receive().unwrap().unwrap();
        assert_eq!(tail.samples, 476);
        assert_eq!(tail.planes.len(), 2);
        assert_eq!(tail.planes[0].len(), 476 * 4);
    }

    #[test]
    fn test_open_failure_and_extra_stream() {
        let failing = SyntheticOptions {
            open_failure: Some("moov atom not found".into()),
            ..SyntheticOptions::default()
        };
        assert!(matches!(
            open(failing, DecodeMode::Auto),
            Err(OpenError::Container(_))
        ));

        let options = SyntheticOptions {
            extra_stream: true,
            ..SyntheticOptions::default()
        };
        let mut media = open(options, DecodeMode::Auto).unwrap();
        let info = media.info.clone();
        let units = read_all(media.demux.as_mut());
        assert!(units
            .iter()
            .any(|u| info.stream_kind(u.stream_index) == StreamKind::Other));
    }
}
