//! Decoded audio buffers in the fixed output format.
//! Interleaved PCM S16LE, stereo, 44.1 kHz

use crate::core::time::Seconds;
pub use crate::media::resample::{
    OUTPUT_BYTES_PER_SECOND as BYTES_PER_SECOND, OUTPUT_CHANNELS as CHANNELS,
    OUTPUT_FRAME_BYTES as FRAME_BYTES, OUTPUT_SAMPLE_RATE as SAMPLE_RATE,
};

/// Full output volume
pub const MAX_VOLUME: u8 = 100;

/// Resampled PCM ready for the audio device
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub data: Vec<u8>,
    /// Timestamp of the first sample in seconds
    pub pts: Seconds,
    /// Set once the output volume has been applied
    pub volume_applied: bool,
    /// Bytes already accepted by the device
    pub offset: usize,
}

impl PcmBuffer {
    /// Create a fresh buffer
    pub fn new(data: Vec<u8>, pts: Seconds) -> Self {
        Self {
            data,
            pts,
            volume_applied: false,
            offset: 0,
        }
    }

    /// Duration of the whole buffer in seconds
    pub fn duration(&self) -> Seconds {
        self.data.len() as f64 / BYTES_PER_SECOND as f64
    }

    /// Timestamp just past the last sample
    pub fn end_pts(&self) -> Seconds {
        self.pts + self.duration()
    }

    /// Bytes not yet written
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset.min(self.data.len())..]
    }

    pub fn is_consumed(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Mark `bytes` as accepted by the device
    pub fn advance(&mut self, bytes: usize) {
        self.offset = (self.offset + bytes).min(self.data.len());
    }

    /// Scale every sample by `volume / 100`. Applies at most once per buffer.
    pub fn apply_volume(&mut self, volume: u8) {
        if self.volume_applied {
            return;
        }
        self.volume_applied = true;
        let volume = volume.min(MAX_VOLUME) as i32;
        if volume == MAX_VOLUME as i32 {
            return;
        }
        for sample in self.data.chunks_exact_mut(2) {
            let value = i16::from_le_bytes([sample[0], sample[1]]) as i32;
            let scaled = (value * volume / MAX_VOLUME as i32) as i16;
            sample.copy_from_slice(&scaled.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> PcmBuffer {
        PcmBuffer::new(samples.iter().flat_map(|s| s.to_le_bytes()).collect(), 1.0)
    }

    fn samples(buffer: &PcmBuffer) -> Vec<i16> {
        buffer
            .data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_volume_applied_once() {
        let mut buffer = pcm(&[1000, -1000, 32767, -32768]);
        buffer.apply_volume(50);
        buffer.apply_volume(50);
        assert_eq!(samples(&buffer), vec![500, -500, 16383, -16384]);
        assert!(buffer.volume_applied);
    }

    #[test]
    fn test_mute_and_full_volume() {
        let mut muted = pcm(&[1234, -4321]);
        muted.apply_volume(0);
        assert_eq!(samples(&muted), vec![0, 0]);

        let mut full = pcm(&[1234, -4321]);
        full.apply_volume(100);
        assert_eq!(samples(&full), vec![1234, -4321]);
    }

    #[test]
    fn test_partial_write_cursor() {
        let mut buffer = PcmBuffer::new(vec![0; 16], 0.5);
        buffer.advance(6);
        assert_eq!(buffer.remaining().len(), 10);
        buffer.advance(100);
        assert!(buffer.is_consumed());
        assert!(buffer.remaining().is_empty());
    }

    #[test]
    fn test_duration() {
        let buffer = PcmBuffer::new(vec![0; BYTES_PER_SECOND / 2], 2.0);
        assert!((buffer.duration() - 0.5).abs() < 1e-9);
        assert!((buffer.end_pts() - 2.5).abs() < 1e-9);
    }
}
