//! Hardware audio output through cpal.
//!
//! The control thread pushes S16LE bytes into a bounded ring; the cpal callback, running on
//! the real-time audio thread, drains it and fills any shortfall with silence. The callback
//! never allocates and holds the ring lock only for the copy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use parking_lot::Mutex;

use crate::audio::buffer::{BYTES_PER_SECOND, FRAME_BYTES};
use crate::audio::device::{AudioBackend, AudioDevice, AudioError, PcmFormat};

/// Default ring size: one second of output
const RING_BYTES: usize = BYTES_PER_SECOND;

/// Opens the host's default output device.
#[derive(Debug, Clone)]
pub struct CpalAudio {
    ring_bytes: usize,
}

impl CpalAudio {
    pub fn new() -> Self {
        Self {
            ring_bytes: RING_BYTES,
        }
    }

    pub fn with_ring_bytes(mut self, bytes: usize) -> Self {
        self.ring_bytes = (bytes / FRAME_BYTES * FRAME_BYTES).max(FRAME_BYTES);
        self
    }
}

impl Default for CpalAudio {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for CpalAudio {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn open(&self, format: PcmFormat) -> Result<Box<dyn AudioDevice>, AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let ring = Arc::new(Mutex::new(VecDeque::with_capacity(self.ring_bytes)));
        let paused = Arc::new(AtomicBool::new(false));

        let callback_ring = Arc::clone(&ring);
        let callback_paused = Arc::clone(&paused);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if callback_paused.load(Ordering::Relaxed) {
                        data.fill(0.0);
                        return;
                    }
                    let mut ring = callback_ring.lock();
                    for sample in data.iter_mut() {
                        *sample = match (ring.pop_front(), ring.pop_front()) {
                            (Some(lo), Some(hi)) => {
                                i16::from_le_bytes([lo, hi]) as f32 / i16::MAX as f32
                            }
                            // underrun
                            _ => 0.0,
                        };
                    }
                },
                |err| tracing::warn!("audio stream error: {}", err),
                None,
            )
            .map_err(|err| match err {
                cpal::BuildStreamError::StreamConfigNotSupported => AudioError::UnsupportedFormat(
                    format!("{} Hz, {} channels", format.sample_rate, format.channels),
                ),
                other => AudioError::BuildStream(other.to_string()),
            })?;
        stream
            .play()
            .map_err(|err| AudioError::PlayStream(err.to_string()))?;

        tracing::info!(
            "audio output opened: {} ({} Hz, {} ch)",
            device.name().unwrap_or_else(|_| "unknown".into()),
            format.sample_rate,
            format.channels
        );

        Ok(Box::new(CpalDevice {
            stream,
            ring,
            paused,
            capacity: self.ring_bytes,
        }))
    }
}

/// Stream opened from [`CpalAudio`]
pub struct CpalDevice {
    stream: Stream,
    ring: Arc<Mutex<VecDeque<u8>>>,
    paused: Arc<AtomicBool>,
    capacity: usize,
}

impl AudioDevice for CpalDevice {
    fn write(&mut self, bytes: &[u8]) -> usize {
        let mut ring = self.ring.lock();
        let free = self.capacity.saturating_sub(ring.len());
        let accepted = bytes.len().min(free) / FRAME_BYTES * FRAME_BYTES;
        ring.extend(&bytes[..accepted]);
        accepted
    }

    fn queued_bytes(&self) -> usize {
        self.ring.lock().len()
    }

    fn free_bytes(&self) -> usize {
        self.capacity.saturating_sub(self.queued_bytes())
    }

    fn clear(&mut self) {
        self.ring.lock().clear();
    }

    fn pause(&mut self) {
        self.paused.store(true, Ordering::Relaxed);
        if let Err(err) = self.stream.pause() {
            tracing::warn!("failed to pause audio stream: {}", err);
        }
    }

    fn resume(&mut self) {
        self.paused.store(false, Ordering::Relaxed);
        if let Err(err) = self.stream.play() {
            tracing::warn!("failed to resume audio stream: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_default_device() {
        // no output device in CI is fine
        if let Ok(mut device) = CpalAudio::new().with_ring_bytes(4_000).open(PcmFormat::OUTPUT) {
            assert_eq!(device.write(&[0; 4_002]), 4_000);
            device.clear();
            assert_eq!(device.queued_bytes(), 0);
        }
    }
}
