//! Audio decode stage: compressed units in, output-format PCM buffers out.

use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::Sender;

use crate::audio::buffer::PcmBuffer;
use crate::core::time::{pts_to_seconds, Seconds, TimeBase};
use crate::media::{AudioDecoder, CompressedUnit, DecodeError, RawAudioFrame, Resampler};
use crate::pipeline::{
    AudioItem, BoundedQueue, Discontinuity, PacketItem, QueueItem, SessionControl, WorkerNotice,
    AUDIO_THREAD,
};
use crate::playback::metrics::{Metric, MetricsSink};

/// Runs on the audio decode thread until shutdown or a fatal error.
pub struct AudioStage {
    decoder: Box<dyn AudioDecoder>,
    resampler: Option<Box<dyn Resampler>>,
    time_base: TimeBase,
    input: Arc<BoundedQueue<PacketItem>>,
    output: Arc<BoundedQueue<AudioItem>>,
    control: Arc<SessionControl>,
    metrics: Arc<dyn MetricsSink>,
    notices: Sender<WorkerNotice>,
    skip_until: Option<Seconds>,
}

impl AudioStage {
    pub fn new(
        decoder: Box<dyn AudioDecoder>,
        time_base: TimeBase,
        input: Arc<BoundedQueue<PacketItem>>,
        output: Arc<BoundedQueue<AudioItem>>,
        control: Arc<SessionControl>,
        metrics: Arc<dyn MetricsSink>,
        notices: Sender<WorkerNotice>,
    ) -> Self {
        Self {
            decoder,
            resampler: None,
            time_base,
            input,
            output,
            control,
            metrics,
            notices,
            skip_until: None,
        }
    }

    pub fn run(mut self) {
        tracing::debug!("audio decode started (time base {})", self.time_base);
        let control = Arc::clone(&self.control);
        while let Some(item) = self.input.dequeue(|| !control.is_running()) {
            if let Err(error) = self.handle(item) {
                tracing::error!("audio decode failed: {}", error);
                let _ = self.notices.send(WorkerNotice {
                    stage: AUDIO_THREAD,
                    error,
                });
                break;
            }
        }
        tracing::debug!("audio decode exiting");
    }

    fn handle(&mut self, item: PacketItem) -> Result<(), DecodeError> {
        match item {
            QueueItem::Data(unit) => self.decode(&unit),
            QueueItem::Flush(Discontinuity::Seek { target, serial }) => {
                self.decoder.flush();
                self.reset_resampler();
                let dropped = self.output.clear();
                self.skip_until = Some(target);
                tracing::debug!(
                    "audio flush for seek to {:.3}s (serial {}), {} buffers dropped",
                    target,
                    serial,
                    dropped
                );
                self.forward(QueueItem::Flush(Discontinuity::Seek { target, serial }));
                Ok(())
            }
            QueueItem::Flush(Discontinuity::Rewind) => {
                self.drain()?;
                self.decoder.flush();
                self.reset_resampler();
                self.skip_until = None;
                self.forward(QueueItem::Flush(Discontinuity::Rewind));
                Ok(())
            }
            QueueItem::End => {
                self.drain()?;
                self.decoder.flush();
                self.reset_resampler();
                self.forward(QueueItem::End);
                Ok(())
            }
        }
    }

    fn reset_resampler(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    fn decode(&mut self, unit: &CompressedUnit) -> Result<(), DecodeError> {
        let start = Instant::now();
        self.decoder.send(unit)?;
        self.metrics.record(Metric::Decode(start.elapsed()));
        self.receive_all()
    }

    fn drain(&mut self) -> Result<(), DecodeError> {
        self.decoder.send_eof()?;
        self.receive_all()
    }

    fn receive_all(&mut self) -> Result<(), DecodeError> {
        while let Some(frame) = self.decoder.receive()? {
            self.process(frame)?;
        }
        Ok(())
    }

    fn process(&mut self, frame: RawAudioFrame) -> Result<(), DecodeError> {
        let pts = pts_to_seconds(frame.pts, self.time_base);

        let stale = self
            .resampler
            .as_ref()
            .map_or(true, |r| r.input_format() != frame.format);
        if stale {
            tracing::debug!(
                "creating resampler for {} Hz, {} channels, {:?}",
                frame.format.sample_rate,
                frame.format.channels,
                frame.format.sample_format
            );
            self.resampler = Some(self.decoder.resampler(frame.format)?);
        }
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };

        let start = Instant::now();
        let data = resampler.convert(&frame)?;
        self.metrics.record(Metric::Convert(start.elapsed()));
        if data.is_empty() {
            return Ok(());
        }

        let buffer = PcmBuffer::new(data, pts);
        if let Some(target) = self.skip_until {
            if buffer.end_pts() <= target {
                tracing::trace!("skipping audio at {:.3}s before seek target", pts);
                return Ok(());
            }
            self.skip_until = None;
        }

        if self
            .output
            .enqueue(QueueItem::Data(buffer), || self.control.is_cancelled())
            .is_err()
        {
            tracing::trace!("audio at {:.3}s discarded", pts);
        }
        Ok(())
    }

    fn forward(&self, marker: AudioItem) {
        let control = &self.control;
        if self.output.enqueue(marker, || !control.is_running()).is_err() {
            tracing::trace!("marker dropped at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::synthetic::{SyntheticAudio, SyntheticAudioDecoder};
    use crate::playback::metrics::NoopMetrics;
    use crossbeam::channel;
    use std::thread;
    use std::time::Duration;

    fn unit(offset: u64) -> PacketItem {
        QueueItem::Data(CompressedUnit {
            stream_index: 1,
            data: offset.to_le_bytes().to_vec(),
            pts: Some(offset as i64),
            dts: None,
            keyframe: true,
        })
    }

    #[test]
    fn test_seek_discards_audio_before_target_and_resamples() {
        let input = Arc::new(BoundedQueue::new(64));
        let output = Arc::new(BoundedQueue::new(64));
        let control = Arc::new(SessionControl::new(false));
        let (tx, _rx) = channel::unbounded();
        let stage = AudioStage::new(
            Box::new(SyntheticAudioDecoder::new(SyntheticAudio::default(), 480_000)),
            TimeBase::new(1, 48_000),
            Arc::clone(&input),
            Arc::clone(&output),
            Arc::clone(&control),
            Arc::new(NoopMetrics),
            tx,
        );
        let handle = thread::spawn(move || stage.run());

        input
            .try_enqueue(QueueItem::Flush(Discontinuity::Seek {
                target: 0.1,
                serial: 3,
            }))
            .unwrap();
        // 10 packets of 1024 samples at 48 kHz: 0 .. 0.213s
        for i in 0..10u64 {
            input.try_enqueue(unit(i * 1024)).unwrap();
        }
        input.try_enqueue(QueueItem::End).unwrap();

        let mut items = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !matches!(items.last(), Some(QueueItem::End)) && Instant::now() < deadline {
            match output.try_dequeue() {
                Some(item) => items.push(item),
                None => thread::sleep(Duration::from_millis(1)),
            }
        }

        assert!(matches!(
            items.first(),
            Some(QueueItem::Flush(Discontinuity::Seek { serial: 3, .. }))
        ));
        let buffers: Vec<&PcmBuffer> = items.iter().filter_map(|i| i.as_data()).collect();
        // packets ending at or before 0.1s (0, 1024, 2048, 3072) are dropped
        assert_eq!(buffers.len(), 6);
        assert!(buffers.iter().all(|b| b.end_pts() > 0.1 && !b.volume_applied));
        assert!(buffers.iter().all(|b| b.data.len() % 4 == 0));

        control.shutdown();
        input.wake_all();
        handle.join().unwrap();
    }
}
