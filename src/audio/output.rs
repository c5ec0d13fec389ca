//! Audio output sink: moves PCM buffers from the audio queue into the device.
//!
//! Driven by the control thread's audio tick. Never blocks: it writes whatever fits and keeps
//! any unwritten remainder for the next tick.

use std::sync::Arc;

use crate::audio::buffer::{PcmBuffer, BYTES_PER_SECOND, FRAME_BYTES};
use crate::audio::device::AudioDevice;
use crate::pipeline::{AudioItem, BoundedQueue, Discontinuity, QueueItem};
use crate::playback::clock::ClockState;
use crate::playback::metrics::{Metric, MetricsSink};

/// Feeds one audio device for the duration of a session.
pub struct AudioOutput {
    device: Box<dyn AudioDevice>,
    queue: Arc<BoundedQueue<AudioItem>>,
    /// Device occupancy to keep topped up, in bytes
    target_bytes: usize,
    pending: Option<PcmBuffer>,
    /// Items are dropped until the seek marker with this serial
    awaiting_seek: Option<u64>,
    parked: bool,
    finished: bool,
    paused: bool,
}

impl AudioOutput {
    pub fn new(
        device: Box<dyn AudioDevice>,
        queue: Arc<BoundedQueue<AudioItem>>,
        target_ms: u64,
    ) -> Self {
        let target_bytes = (BYTES_PER_SECOND as u64 * target_ms / 1000) as usize;
        Self {
            device,
            queue,
            target_bytes: (target_bytes / FRAME_BYTES * FRAME_BYTES).max(FRAME_BYTES),
            pending: None,
            awaiting_seek: None,
            parked: false,
            finished: false,
            paused: false,
        }
    }

    /// Reached a loop rewind marker and waits for [`AudioOutput::resume_after_rewind`].
    pub fn is_parked(&self) -> bool {
        self.parked
    }

    /// Reached the end-of-stream marker and the device has played everything.
    pub fn is_finished(&self) -> bool {
        self.finished && self.device.queued_bytes() == 0
    }

    pub fn resume_after_rewind(&mut self) {
        self.parked = false;
    }

    /// Discard device contents and everything queued before the seek tagged `serial`.
    pub fn begin_seek(&mut self, serial: u64) {
        self.device.clear();
        self.pending = None;
        self.awaiting_seek = Some(serial);
        self.parked = false;
        self.finished = false;
    }

    pub fn pause(&mut self) {
        self.paused = true;
        self.device.pause();
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.device.resume();
    }

    /// Refresh the played-bytes view of the clock from the device.
    pub fn sync_clock(&self, clock: &mut ClockState) {
        clock.set_audio_queued(self.device.queued_bytes());
    }

    /// Take the next buffer to write, consuming markers on the way.
    fn next_buffer(&mut self) -> Option<PcmBuffer> {
        loop {
            let item = self.queue.try_dequeue()?;
            match (item, self.awaiting_seek) {
                (QueueItem::Flush(Discontinuity::Seek { serial, .. }), Some(awaited)) => {
                    if serial == awaited {
                        self.awaiting_seek = None;
                    }
                }
                (_, Some(_)) => {}
                (QueueItem::Data(buffer), None) => return Some(buffer),
                (QueueItem::Flush(Discontinuity::Seek { serial, .. }), None) => {
                    tracing::trace!("ignoring stale seek marker {}", serial);
                }
                (QueueItem::Flush(Discontinuity::Rewind), None) => {
                    tracing::debug!("audio reached loop point");
                    self.parked = true;
                    self.finished = false;
                    return None;
                }
                (QueueItem::End, None) => {
                    tracing::debug!("audio reached end of stream");
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// One audio tick: top the device up to the target occupancy.
    pub fn tick(&mut self, clock: &mut ClockState, volume: u8, metrics: &dyn MetricsSink) {
        if self.paused || self.parked {
            self.sync_clock(clock);
            return;
        }

        loop {
            let queued = self.device.queued_bytes();
            if queued >= self.target_bytes {
                break;
            }
            let room = self
                .device
                .free_bytes()
                .min(self.target_bytes - queued)
                / FRAME_BYTES
                * FRAME_BYTES;
            if room == 0 {
                break;
            }

            if self.pending.is_none() {
                self.pending = self.next_buffer();
            }
            let Some(buffer) = self.pending.as_mut() else {
                break;
            };

            if buffer.offset == 0 {
                clock.anchor_audio(buffer.pts);
            }
            buffer.apply_volume(volume);

            let remaining = buffer.remaining();
            let chunk = &remaining[..remaining.len().min(room)];
            let requested = chunk.len();
            let written = self.device.write(chunk);
            buffer.advance(written);
            clock.add_audio_written(written);
            if written > 0 {
                metrics.record(Metric::AudioWritten(written));
            }

            if buffer.is_consumed() {
                self.pending = None;
            } else if written < requested {
                // device is full; retry the remainder next tick
                break;
            }
        }

        self.sync_clock(clock);
    }
}
