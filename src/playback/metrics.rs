//! Pipeline performance counters.
//!
//! Stages report timings and frame events to an injected [`MetricsSink`]. The default
//! [`WindowedMetrics`] averages over a window of presented frames, logs a summary at the end of
//! each window and starts over.

use std::time::Duration;

use parking_lot::Mutex;

/// Presented frames per statistics window
pub const DEFAULT_WINDOW: u64 = 100;

/// One measurement reported by a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Metric {
    /// Codec send + receive time for one compressed unit
    Decode(Duration),
    /// Hardware surface download
    Transfer(Duration),
    /// Colorspace conversion or resampling
    Convert(Duration),
    /// Upload + present of one frame
    Present(Duration),
    FramePresented,
    FrameDropped,
    /// Bytes accepted by the audio device
    AudioWritten(usize),
}

/// Receiver of pipeline measurements. Must be cheap; called from every stage.
pub trait MetricsSink: Send + Sync {
    fn record(&self, metric: Metric);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _metric: Metric) {}
}

/// Averages collected over one window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub frames_presented: u64,
    pub frames_dropped: u64,
    pub decode_avg: Duration,
    pub transfer_avg: Duration,
    pub convert_avg: Duration,
    pub present_avg: Duration,
    pub audio_bytes: u64,
}

#[derive(Debug, Default)]
struct Accumulator {
    presented: u64,
    dropped: u64,
    decode: (Duration, u32),
    transfer: (Duration, u32),
    convert: (Duration, u32),
    present: (Duration, u32),
    audio_bytes: u64,
}

fn average((total, count): (Duration, u32)) -> Duration {
    if count == 0 {
        Duration::ZERO
    } else {
        total / count
    }
}

fn add(slot: &mut (Duration, u32), value: Duration) {
    slot.0 += value;
    slot.1 += 1;
}

impl Accumulator {
    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_presented: self.presented,
            frames_dropped: self.dropped,
            decode_avg: average(self.decode),
            transfer_avg: average(self.transfer),
            convert_avg: average(self.convert),
            present_avg: average(self.present),
            audio_bytes: self.audio_bytes,
        }
    }
}

/// Metrics sink averaging over a fixed number of presented frames.
#[derive(Debug)]
pub struct WindowedMetrics {
    window: u64,
    state: Mutex<Accumulator>,
    last: Mutex<Option<MetricsSnapshot>>,
}

impl WindowedMetrics {
    pub fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            state: Mutex::new(Accumulator::default()),
            last: Mutex::new(None),
        }
    }

    /// Counters of the window in progress.
    pub fn current(&self) -> MetricsSnapshot {
        self.state.lock().snapshot()
    }

    /// Summary of the most recently completed window, cleared on read.
    pub fn take_completed(&self) -> Option<MetricsSnapshot> {
        self.last.lock().take()
    }
}

impl Default for WindowedMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl MetricsSink for WindowedMetrics {
    fn record(&self, metric: Metric) {
        let completed = {
            let mut state = self.state.lock();
            match metric {
                Metric::Decode(d) => add(&mut state.decode, d),
                Metric::Transfer(d) => add(&mut state.transfer, d),
                Metric::Convert(d) => add(&mut state.convert, d),
                Metric::Present(d) => add(&mut state.present, d),
                Metric::FrameDropped => state.dropped += 1,
                Metric::AudioWritten(bytes) => state.audio_bytes += bytes as u64,
                Metric::FramePresented => state.presented += 1,
            }
            if state.presented >= self.window {
                let snapshot = state.snapshot();
                *state = Accumulator::default();
                Some(snapshot)
            } else {
                None
            }
        };

        if let Some(snapshot) = completed {
            tracing::debug!(
                "frames={} dropped={} decode={:.2}ms transfer={:.2}ms convert={:.2}ms present={:.2}ms",
                snapshot.frames_presented,
                snapshot.frames_dropped,
                snapshot.decode_avg.as_secs_f64() * 1000.0,
                snapshot.transfer_avg.as_secs_f64() * 1000.0,
                snapshot.convert_avg.as_secs_f64() * 1000.0,
                snapshot.present_avg.as_secs_f64() * 1000.0,
            );
            *self.last.lock() = Some(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_completes_and_resets() {
        let metrics = WindowedMetrics::new(2);
        metrics.record(Metric::Decode(Duration::from_millis(4)));
        metrics.record(Metric::Decode(Duration::from_millis(2)));
        metrics.record(Metric::FrameDropped);
        metrics.record(Metric::FramePresented);
        assert!(metrics.take_completed().is_none());
        assert_eq!(metrics.current().decode_avg, Duration::from_millis(3));

        metrics.record(Metric::FramePresented);
        let done = metrics.take_completed().unwrap();
        assert_eq!(done.frames_presented, 2);
        assert_eq!(done.frames_dropped, 1);
        assert_eq!(done.transfer_avg, Duration::ZERO);

        assert_eq!(metrics.current(), MetricsSnapshot::default());
        assert!(metrics.take_completed().is_none());
    }
}
