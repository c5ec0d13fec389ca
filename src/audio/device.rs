//! Audio output devices.
//!
//! The output sink talks to an [`AudioDevice`]: a byte queue consumed by the hardware at the
//! output rate. [`VirtualAudio`] implements one without hardware, consuming bytes either in real
//! time or only when its clock is advanced by hand.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::audio::buffer::{BYTES_PER_SECOND, CHANNELS, FRAME_BYTES, SAMPLE_RATE};

/// Error type for audio output
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("No audio output device available")]
    NoDevice,
    #[error("Unsupported output format: {0}")]
    UnsupportedFormat(String),
    #[error("Failed to build output stream: {0}")]
    BuildStream(String),
    #[error("Failed to start output stream: {0}")]
    PlayStream(String),
}

/// PCM layout handed to the device. The pipeline always produces [`PcmFormat::OUTPUT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    /// Interleaved S16LE stereo at 44.1 kHz
    pub const OUTPUT: PcmFormat = PcmFormat {
        sample_rate: SAMPLE_RATE,
        channels: CHANNELS,
    };
}

/// An open output stream. Owned by the control thread.
pub trait AudioDevice {
    /// Queue `bytes` for playback and return how many were accepted.
    fn write(&mut self, bytes: &[u8]) -> usize;

    /// Bytes accepted but not yet played.
    fn queued_bytes(&self) -> usize;

    /// Bytes the device can accept right now.
    fn free_bytes(&self) -> usize;

    /// Discard everything queued.
    fn clear(&mut self);

    fn pause(&mut self);

    fn resume(&mut self);
}

/// Factory for output streams.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, format: PcmFormat) -> Result<Box<dyn AudioDevice>, AudioError>;
}

/// How a virtual device consumes queued audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualClock {
    /// Bytes drain at the output rate of wall-clock time
    Realtime,
    /// Bytes drain only on [`VirtualAudio::advance`]
    Manual,
}

#[derive(Debug)]
struct VirtualState {
    queued: usize,
    played: u64,
    paused: bool,
    captured: Vec<u8>,
    last_update: Instant,
    /// Fractional bytes carried between realtime updates
    carry: f64,
    opened: u32,
}

impl VirtualState {
    fn consume(&mut self, bytes: usize) {
        let bytes = bytes.min(self.queued);
        self.queued -= bytes;
        self.played += bytes as u64;
    }

    fn catch_up(&mut self, clock: VirtualClock) {
        let now = Instant::now();
        if clock == VirtualClock::Realtime && !self.paused {
            let exact = now.duration_since(self.last_update).as_secs_f64() * BYTES_PER_SECOND as f64
                + self.carry;
            let whole = (exact as usize) / FRAME_BYTES * FRAME_BYTES;
            self.carry = exact - whole as f64;
            self.consume(whole);
        }
        self.last_update = now;
    }
}

/// Hardware-less audio backend. Clones share one device state, so tests keep a handle to
/// inspect and drive the device the player opened.
#[derive(Debug, Clone)]
pub struct VirtualAudio {
    clock: VirtualClock,
    /// Device buffer size in bytes
    capacity: usize,
    /// Largest single write the device accepts, to exercise partial writes
    max_write_chunk: Option<usize>,
    available: bool,
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualAudio {
    fn with_clock(clock: VirtualClock) -> Self {
        Self {
            clock,
            capacity: BYTES_PER_SECOND / 2,
            max_write_chunk: None,
            available: true,
            state: Arc::new(Mutex::new(VirtualState {
                queued: 0,
                played: 0,
                paused: false,
                captured: Vec::new(),
                last_update: Instant::now(),
                carry: 0.0,
                opened: 0,
            })),
        }
    }

    pub fn realtime() -> Self {
        Self::with_clock(VirtualClock::Realtime)
    }

    pub fn manual() -> Self {
        Self::with_clock(VirtualClock::Manual)
    }

    /// A backend whose open always fails, as on a machine without audio output.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::manual()
        }
    }

    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = bytes.max(FRAME_BYTES);
        self
    }

    pub fn with_max_write(mut self, bytes: usize) -> Self {
        self.max_write_chunk = Some(bytes.max(FRAME_BYTES));
        self
    }

    /// Play `duration` worth of queued audio (manual clock; ignored while paused).
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock();
        if state.paused {
            return;
        }
        let bytes = (duration.as_secs_f64() * BYTES_PER_SECOND as f64) as usize / FRAME_BYTES * FRAME_BYTES;
        state.consume(bytes);
    }

    pub fn queued_bytes(&self) -> usize {
        let mut state = self.state.lock();
        state.catch_up(self.clock);
        state.queued
    }

    pub fn played_bytes(&self) -> u64 {
        let mut state = self.state.lock();
        state.catch_up(self.clock);
        state.played
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Every byte ever accepted, in order.
    pub fn captured(&self) -> Vec<u8> {
        self.state.lock().captured.clone()
    }

    /// Number of streams opened so far
    pub fn opened(&self) -> u32 {
        self.state.lock().opened
    }
}

impl AudioBackend for VirtualAudio {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn open(&self, format: PcmFormat) -> Result<Box<dyn AudioDevice>, AudioError> {
        if !self.available {
            return Err(AudioError::NoDevice);
        }
        if format != PcmFormat::OUTPUT {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} Hz, {} channels",
                format.sample_rate, format.channels
            )));
        }
        {
            let mut state = self.state.lock();
            state.opened += 1;
            state.queued = 0;
            state.paused = false;
            state.last_update = Instant::now();
            state.carry = 0.0;
        }
        Ok(Box::new(VirtualDevice {
            audio: self.clone(),
        }))
    }
}

/// Stream opened from a [`VirtualAudio`]
#[derive(Debug)]
pub struct VirtualDevice {
    audio: VirtualAudio,
}

impl AudioDevice for VirtualDevice {
    fn write(&mut self, bytes: &[u8]) -> usize {
        let free = self.free_bytes();
        let limit = self.audio.max_write_chunk.unwrap_or(usize::MAX);
        let accepted = bytes.len().min(free).min(limit) / FRAME_BYTES * FRAME_BYTES;
        if accepted == 0 {
            return 0;
        }
        let mut state = self.audio.state.lock();
        state.queued += accepted;
        state.captured.extend_from_slice(&bytes[..accepted]);
        accepted
    }

    fn queued_bytes(&self) -> usize {
        self.audio.queued_bytes()
    }

    fn free_bytes(&self) -> usize {
        self.audio.capacity.saturating_sub(self.audio.queued_bytes())
    }

    fn clear(&mut self) {
        let mut state = self.audio.state.lock();
        state.queued = 0;
        state.carry = 0.0;
    }

    fn pause(&mut self) {
        let mut state = self.audio.state.lock();
        state.catch_up(self.audio.clock);
        state.paused = true;
    }

    fn resume(&mut self) {
        let mut state = self.audio.state.lock();
        state.catch_up(self.audio.clock);
        state.paused = false;
    }
}
