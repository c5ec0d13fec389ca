//! Demux stage: reads the container and routes compressed units to the decode stages.
//!
//! Seeks, loop rewinds and end of stream are signaled downstream as queue markers.

use std::sync::Arc;

use crossbeam::channel::Sender;

use crate::media::{CompressedUnit, Demux, MediaInfo, ReadOutcome, StreamKind};
use crate::pipeline::{
    BoundedQueue, Discontinuity, PacketItem, QueueItem, SeekRequest, SessionControl,
    SessionQueues, WorkerNotice, DEMUX_THREAD, WAIT_TICK,
};

/// Runs on the demux thread until shutdown or a fatal read error.
pub struct DemuxStage {
    demux: Box<dyn Demux>,
    info: MediaInfo,
    video: Option<Arc<BoundedQueue<PacketItem>>>,
    audio: Option<Arc<BoundedQueue<PacketItem>>>,
    control: Arc<SessionControl>,
    notices: Sender<WorkerNotice>,
    /// Units routed since the last rewind; an empty pass ends instead of looping
    units_this_pass: u64,
}

impl DemuxStage {
    pub fn new(
        demux: Box<dyn Demux>,
        info: MediaInfo,
        queues: &SessionQueues,
        control: Arc<SessionControl>,
        notices: Sender<WorkerNotice>,
    ) -> Self {
        let video = info
            .video
            .as_ref()
            .map(|_| Arc::clone(&queues.video_packets));
        let audio = info
            .audio
            .as_ref()
            .map(|_| Arc::clone(&queues.audio_packets));
        Self {
            demux,
            info,
            video,
            audio,
            control,
            notices,
            units_this_pass: 0,
        }
    }

    pub fn run(mut self) {
        tracing::debug!("demux started for {}", self.info.path.display());
        while self.control.is_running() {
            if let Some(request) = self.control.take_seek_request() {
                self.seek(request);
                continue;
            }
            match self.demux.read() {
                Ok(ReadOutcome::Unit(unit)) => self.route(unit),
                Ok(ReadOutcome::EndOfStream) => self.end_of_stream(),
                Err(error) => {
                    tracing::error!("demux read failed: {}", error);
                    let _ = self.notices.send(WorkerNotice {
                        stage: DEMUX_THREAD,
                        error,
                    });
                    break;
                }
            }
        }
        tracing::debug!("demux exiting");
    }

    fn queues(&self) -> impl Iterator<Item = &Arc<BoundedQueue<PacketItem>>> {
        self.video.iter().chain(self.audio.iter())
    }

    fn route(&mut self, unit: CompressedUnit) {
        let queue = match self.info.stream_kind(unit.stream_index) {
            StreamKind::Video => self.video.as_ref(),
            StreamKind::Audio => self.audio.as_ref(),
            StreamKind::Other => None,
        };
        let Some(queue) = queue else {
            tracing::trace!("discarding unit of stream {}", unit.stream_index);
            return;
        };
        self.units_this_pass += 1;
        let control = &self.control;
        if queue
            .enqueue(QueueItem::Data(unit), || control.is_cancelled())
            .is_err()
        {
            tracing::trace!("unit discarded during seek or shutdown");
        }
    }

    fn seek(&mut self, request: SeekRequest) {
        tracing::debug!(
            "demux seek to {:.3}s (serial {})",
            request.target,
            request.serial
        );
        if let Err(err) = self.demux.seek(request.target) {
            tracing::warn!("seek to {:.3}s failed: {}", request.target, err);
        }
        let marker = Discontinuity::Seek {
            target: request.target,
            serial: request.serial,
        };
        for queue in self.queues() {
            queue.clear();
            if queue.try_enqueue(QueueItem::Flush(marker)).is_err() {
                tracing::warn!("no room for seek marker {}", request.serial);
            }
        }
        self.units_this_pass = 0;
        self.control.complete_seek(request.serial);
    }

    /// Rewind to the start and tell the decoders a new pass begins.
    /// Returns false if the container could not rewind.
    fn rewind(&mut self) -> bool {
        if let Err(err) = self.demux.seek(0.0) {
            tracing::warn!("rewind failed, ending playback: {}", err);
            return false;
        }
        tracing::debug!("end of stream, looping");
        self.units_this_pass = 0;
        let control = &self.control;
        for queue in self.queues() {
            let _ = queue.enqueue(QueueItem::Flush(Discontinuity::Rewind), || {
                control.is_cancelled()
            });
        }
        true
    }

    fn end_of_stream(&mut self) {
        if self.control.loop_enabled() && self.units_this_pass > 0 && self.rewind() {
            return;
        }

        tracing::debug!("end of stream");
        let control = &self.control;
        for queue in self.queues() {
            let _ = queue.enqueue(QueueItem::End, || control.is_cancelled());
        }

        // Idle until something can restart reading
        loop {
            if !self.control.is_running() || self.control.is_seeking() {
                return;
            }
            if self.control.loop_enabled() && self.units_this_pass > 0 {
                self.rewind();
                return;
            }
            self.control.wait_idle(WAIT_TICK);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::media::synthetic::{SyntheticBackend, SyntheticOptions};
    use crate::media::{DecodeMode, MediaBackend};
    use crossbeam::channel;
    use std::path::Path;
    use std::thread;
    use std::time::{Duration, Instant};

    struct Harness {
        queues: SessionQueues,
        control: Arc<SessionControl>,
        notices: channel::Receiver<WorkerNotice>,
        handle: thread::JoinHandle<()>,
    }

    fn spawn(options: SyntheticOptions, loop_enabled: bool) -> Harness {
        let media = SyntheticBackend::new(options)
            .open(Path::new("demux.test"), DecodeMode::Software)
            .unwrap();
        let queues = SessionQueues::new(&QueueConfig {
            video_packets: 256,
            audio_packets: 256,
            ..QueueConfig::default()
        });
        let control = Arc::new(SessionControl::new(loop_enabled));
        let (tx, rx) = channel::unbounded();
        let stage = DemuxStage::new(media.demux, media.info, &queues, Arc::clone(&control), tx);
        let handle = thread::spawn(move || stage.run());
        Harness {
            queues,
            control,
            notices: rx,
            handle,
        }
    }

    fn take_until(
        queue: &BoundedQueue<PacketItem>,
        stop: impl Fn(&PacketItem) -> bool,
    ) -> Vec<PacketItem> {
        let mut items = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            match queue.try_dequeue() {
                Some(item) => {
                    let done = stop(&item);
                    items.push(item);
                    if done {
                        break;
                    }
                }
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        items
    }

    fn finish(h: Harness) {
        h.control.shutdown();
        h.queues.wake_all();
        h.handle.join().unwrap();
    }

    #[test]
    fn test_routes_streams_and_ends() {
        let options = SyntheticOptions {
            duration: 1.0,
            extra_stream: true,
            ..SyntheticOptions::default()
        };
        let h = spawn(options, false);
        let video = take_until(&h.queues.video_packets, |i| matches!(i, QueueItem::End));
        let audio = take_until(&h.queues.audio_packets, |i| matches!(i, QueueItem::End));

        assert_eq!(video.iter().filter(|i| i.is_data()).count(), 30);
        assert!(audio.iter().filter_map(|i| i.as_data()).all(|u| u.stream_index == 1));
        assert!(matches!(video.last(), Some(QueueItem::End)));
        assert!(matches!(audio.last(), Some(QueueItem::End)));
        finish(h);
    }

    #[test]
    fn test_loop_injects_rewind() {
        let h = spawn(SyntheticOptions::video_only(0.5), true);
        let first = take_until(&h.queues.video_packets, |i| {
            matches!(i, QueueItem::Flush(Discontinuity::Rewind))
        });
        assert_eq!(first.iter().filter(|i| i.is_data()).count(), 15);
        let second = take_until(&h.queues.video_packets, |i| i.is_data());
        assert_eq!(second.last().and_then(|i| i.as_data()).map(|u| u.pts), Some(Some(0)));
        finish(h);
    }

    #[test]
    fn test_seek_clears_and_injects_marker() {
        let h = spawn(SyntheticOptions::video_only(10.0), false);
        thread::sleep(Duration::from_millis(20));
        let serial = h.control.request_seek(5.0);
        h.queues.wake_all();

        let items = take_until(&h.queues.video_packets, |i| {
            matches!(i, QueueItem::Flush(Discontinuity::Seek { serial: s, .. }) if *s == serial)
        });
        assert!(matches!(items.last(), Some(QueueItem::Flush(_))));
        let next = take_until(&h.queues.video_packets, |i| i.is_data());
        let unit = next.last().and_then(|i| i.as_data()).unwrap();
        assert!(unit.keyframe);
        assert_eq!(unit.pts, Some(450_000));
        assert!(!h.control.is_seeking());
        finish(h);
    }

    #[test]
    fn test_read_error_is_fatal() {
        let options = SyntheticOptions {
            fail_read_at: Some(0.2),
            ..SyntheticOptions::video_only(1.0)
        };
        let h = spawn(options, true);
        let notice = h.notices.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(notice.stage, DEMUX_THREAD);
        h.handle.join().unwrap();
    }
}
