//! Session clock state shared by the audio output sink and the render scheduler.
//!
//! Audio is the master clock. Its position is derived from bytes the device has actually
//! played, never from bytes merely written. Video follows it through a fixed offset
//! computed once both streams have produced their first timestamp.

use std::time::Instant;

use crate::audio::buffer::BYTES_PER_SECOND;
use crate::config::SyncConfig;
use crate::core::time::Seconds;

/// Clock and scheduling state of one playback session.
/// Reset on stop, seek and loop wrap.
#[derive(Debug, Clone)]
pub struct ClockState {
    audio_start: Option<Seconds>,
    video_start: Option<Seconds>,
    /// `video_start - audio_start`, fixed for the session once both are known
    av_offset: Option<Seconds>,
    audio_written: u64,
    audio_queued: usize,
    /// Wall-clock time the head frame becomes due
    pub frame_timer: Option<Instant>,
    pub last_frame_pts: Option<Seconds>,
    /// Delay applied after the previous frame
    pub last_delay: Seconds,
    /// Consecutive ticks with video behind the reference
    pub fast_count: u32,
    bootstrap_delay: Seconds,
}

impl ClockState {
    pub fn new(sync: &SyncConfig) -> Self {
        Self {
            audio_start: None,
            video_start: None,
            av_offset: None,
            audio_written: 0,
            audio_queued: 0,
            frame_timer: None,
            last_frame_pts: None,
            last_delay: sync.bootstrap_delay,
            fast_count: 0,
            bootstrap_delay: sync.bootstrap_delay,
        }
    }

    /// Forget every anchor and counter.
    pub fn reset(&mut self) {
        self.audio_start = None;
        self.video_start = None;
        self.av_offset = None;
        self.audio_written = 0;
        self.audio_queued = 0;
        self.frame_timer = None;
        self.last_frame_pts = None;
        self.last_delay = self.bootstrap_delay;
        self.fast_count = 0;
    }

    fn try_offset(&mut self) {
        if self.av_offset.is_some() {
            return;
        }
        if let (Some(video), Some(audio)) = (self.video_start, self.audio_start) {
            self.av_offset = Some(video - audio);
            tracing::debug!("a/v offset {:.3}s", video - audio);
        }
    }

    /// Record the pts of the first audio buffer since the last reset. Later calls are ignored.
    pub fn anchor_audio(&mut self, pts: Seconds) {
        if self.audio_start.is_none() {
            self.audio_start = Some(pts);
            self.try_offset();
        }
    }

    /// Record the pts of the first video frame since the last reset. Later calls are ignored.
    pub fn anchor_video(&mut self, pts: Seconds) {
        if self.video_start.is_none() {
            self.video_start = Some(pts);
            self.try_offset();
        }
    }

    pub fn audio_start(&self) -> Option<Seconds> {
        self.audio_start
    }

    pub fn video_start(&self) -> Option<Seconds> {
        self.video_start
    }

    pub fn av_offset(&self) -> Option<Seconds> {
        self.av_offset
    }

    /// Bytes handed to the device since the last reset
    pub fn add_audio_written(&mut self, bytes: usize) {
        self.audio_written += bytes as u64;
    }

    /// Latest device occupancy
    pub fn set_audio_queued(&mut self, bytes: usize) {
        self.audio_queued = bytes;
    }

    pub fn audio_written(&self) -> u64 {
        self.audio_written
    }

    /// Position of the audio the listener is hearing, once audio is anchored.
    pub fn audio_clock(&self) -> Option<Seconds> {
        let start = self.audio_start?;
        let played = self.audio_written.saturating_sub(self.audio_queued as u64);
        Some(start + played as f64 / BYTES_PER_SECOND as f64)
    }

    /// Audio clock mapped into the video timeline.
    pub fn reference_clock(&self) -> Option<Seconds> {
        self.audio_clock()
            .map(|clock| clock + self.av_offset.unwrap_or(0.0))
    }
}
