//! A/V sync and render scheduling.
//!
//! The scheduler runs on every render tick but only acts once the previously computed due
//! time has passed. Each decision reacts to the current drift against the audio reference and
//! feeds its delay forward into the next one, so small errors are corrected smoothly and large
//! ones through bounded frame drops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SyncConfig;
use crate::core::time::Seconds;
use crate::media::VideoFrame;
use crate::pipeline::{BoundedQueue, Discontinuity, FrameItem, QueueItem};
use crate::playback::clock::ClockState;
use crate::playback::metrics::{Metric, MetricsSink};

/// Inputs of one scheduling decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncInput {
    pub pts: Seconds,
    pub last_pts: Seconds,
    pub last_delay: Seconds,
    /// `pts - reference`, or `None` while there is no audio reference
    pub diff: Option<Seconds>,
    pub fast_count: u32,
}

/// Outcome of one scheduling decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncDecision {
    /// Time until the next frame is due
    pub delay: Seconds,
    pub fast_count: u32,
    /// Discard queued frames that are still behind the reference
    pub catch_up: bool,
}

/// Compute the display delay for the frame at `input.pts`.
pub fn decide(config: &SyncConfig, input: SyncInput) -> SyncDecision {
    let mut delay = input.pts - input.last_pts;
    if delay <= 0.0 || delay > config.max_frame_delay {
        delay = input.last_delay;
    }
    let base = delay;
    let threshold = delay.clamp(config.min_threshold, config.max_threshold);

    let mut fast_count = input.fast_count;
    let mut catch_up = false;
    if let Some(diff) = input.diff.filter(|d| d.abs() < config.no_sync_threshold) {
        if diff <= -threshold {
            delay = (delay + diff).max(0.0);
            fast_count += 1;
            if fast_count >= config.catch_up_ticks && diff < -config.catch_up_lag {
                catch_up = true;
                fast_count = 0;
            }
        } else if diff >= threshold {
            fast_count = 0;
            delay = if base > config.long_delay {
                delay + diff
            } else {
                (2.0 * delay).min(delay + diff)
            };
        } else {
            fast_count = 0;
        }
    }

    SyncDecision {
        delay: delay.clamp(config.min_delay, config.max_delay),
        fast_count,
        catch_up,
    }
}

enum Head {
    Frame(Seconds),
    Seek(u64),
    Rewind,
    End,
}

fn classify(item: &FrameItem) -> Head {
    match item {
        QueueItem::Data(frame) => Head::Frame(frame.pts),
        QueueItem::Flush(Discontinuity::Seek { serial, .. }) => Head::Seek(*serial),
        QueueItem::Flush(Discontinuity::Rewind) => Head::Rewind,
        QueueItem::End => Head::End,
    }
}

/// Consumer of the frame queue.
pub struct RenderScheduler {
    queue: Arc<BoundedQueue<FrameItem>>,
    config: SyncConfig,
    awaiting_seek: Option<u64>,
    parked: bool,
    finished: bool,
}

impl RenderScheduler {
    pub fn new(queue: Arc<BoundedQueue<FrameItem>>, config: SyncConfig) -> Self {
        Self {
            queue,
            config,
            awaiting_seek: None,
            parked: false,
            finished: false,
        }
    }

    /// Drop frames until the seek marker tagged `serial` arrives.
    pub fn begin_seek(&mut self, serial: u64) {
        self.awaiting_seek = Some(serial);
        self.parked = false;
        self.finished = false;
    }

    pub fn is_parked(&self) -> bool {
        self.parked
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn resume_after_rewind(&mut self) {
        self.parked = false;
    }

    /// Consume markers at the head of the queue and return the pts of the head frame.
    fn head_frame(&mut self) -> Option<Seconds> {
        loop {
            let head = self.queue.peek_with(classify)?;
            match head {
                Head::Frame(pts) if self.awaiting_seek.is_none() => return Some(pts),
                Head::Frame(pts) => {
                    self.queue.try_dequeue();
                    tracing::trace!("dropping frame at {:.3}s from before the seek", pts);
                }
                Head::Seek(serial) => {
                    self.queue.try_dequeue();
                    if self.awaiting_seek == Some(serial) {
                        tracing::debug!("video resumed after seek {}", serial);
                        self.awaiting_seek = None;
                    }
                }
                Head::Rewind => {
                    self.queue.try_dequeue();
                    if self.awaiting_seek.is_none() {
                        tracing::debug!("video reached loop point");
                        self.parked = true;
                        self.finished = false;
                        return None;
                    }
                }
                Head::End => {
                    self.queue.try_dequeue();
                    if self.awaiting_seek.is_none() {
                        tracing::debug!("video reached end of stream");
                        self.finished = true;
                        return None;
                    }
                }
            }
        }
    }

    /// One render tick. Returns the frame to present, if one is due.
    pub fn tick(
        &mut self,
        now: Instant,
        clock: &mut ClockState,
        metrics: &dyn MetricsSink,
    ) -> Option<VideoFrame> {
        if self.parked || self.finished {
            return None;
        }
        if clock.frame_timer.is_some_and(|due| now < due) {
            return None;
        }

        let pts = self.head_frame()?;
        if clock.last_frame_pts.is_none() {
            clock.anchor_video(pts);
            clock.frame_timer = Some(now);
            clock.last_frame_pts = Some(pts);
        }

        let reference = clock.reference_clock();
        let decision = decide(
            &self.config,
            SyncInput {
                pts,
                last_pts: clock.last_frame_pts.unwrap_or(pts),
                last_delay: clock.last_delay,
                diff: reference.map(|r| pts - r),
                fast_count: clock.fast_count,
            },
        );

        // the decode stage may have cleared the queue since the peek
        let Some(QueueItem::Data(mut frame)) = self.queue.pop_front_if(QueueItem::is_data) else {
            return None;
        };

        if let (true, Some(reference)) = (decision.catch_up, reference) {
            let mut dropped = 0;
            while dropped < self.config.max_drop_frames {
                let late = self.queue.pop_front_if(|item| {
                    item.as_data().is_some_and(|f| f.pts < reference)
                });
                let Some(QueueItem::Data(newer)) = late else {
                    break;
                };
                frame = newer;
                dropped += 1;
                metrics.record(Metric::FrameDropped);
            }
            if dropped > 0 {
                tracing::debug!(
                    "video {:.3}s behind, dropped {} frames",
                    reference - pts,
                    dropped
                );
            }
        }

        clock.last_frame_pts = Some(frame.pts);
        clock.last_delay = decision.delay;
        clock.fast_count = decision.fast_count;
        clock.frame_timer = Some(now + Duration::from_secs_f64(decision.delay));
        Some(frame)
    }
}
