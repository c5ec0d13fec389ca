//! Video decode stage: compressed units in, presentable frames out.

use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::Sender;

use crate::core::time::{pts_to_seconds, Seconds, TimeBase};
use crate::media::{
    CompressedUnit, DecodeError, FramePixels, PixelConverter, PixelFormat, PlanarImage, RawImage,
    RawVideoFrame, VideoDecoder, VideoFrame,
};
use crate::pipeline::{
    BoundedQueue, Discontinuity, FrameItem, PacketItem, QueueItem, SessionControl, WorkerNotice,
    VIDEO_THREAD,
};
use crate::playback::metrics::{Metric, MetricsSink};
use crate::render::GpuLock;

/// Frames this close below a seek target still count as reaching it
const PTS_EPSILON: Seconds = 1e-6;

/// Runs on the video decode thread until shutdown or a fatal error.
pub struct VideoStage {
    decoder: Box<dyn VideoDecoder>,
    time_base: TimeBase,
    input: Arc<BoundedQueue<PacketItem>>,
    output: Arc<BoundedQueue<FrameItem>>,
    control: Arc<SessionControl>,
    gpu: GpuLock,
    metrics: Arc<dyn MetricsSink>,
    notices: Sender<WorkerNotice>,
    converter: Option<Box<dyn PixelConverter>>,
    /// Frames before this time are discarded (set by a seek)
    skip_until: Option<Seconds>,
}

impl VideoStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        decoder: Box<dyn VideoDecoder>,
        time_base: TimeBase,
        input: Arc<BoundedQueue<PacketItem>>,
        output: Arc<BoundedQueue<FrameItem>>,
        control: Arc<SessionControl>,
        gpu: GpuLock,
        metrics: Arc<dyn MetricsSink>,
        notices: Sender<WorkerNotice>,
    ) -> Self {
        Self {
            decoder,
            time_base,
            input,
            output,
            control,
            gpu,
            metrics,
            notices,
            converter: None,
            skip_until: None,
        }
    }

    pub fn run(mut self) {
        tracing::debug!(
            "video decode started (time base {}, device multithread protected: {})",
            self.time_base,
            self.gpu.multithread_protected()
        );
        let control = Arc::clone(&self.control);
        while let Some(item) = self.input.dequeue(|| !control.is_running()) {
            if let Err(error) = self.handle(item) {
                tracing::error!("video decode failed: {}", error);
                let _ = self.notices.send(WorkerNotice {
                    stage: VIDEO_THREAD,
                    error,
                });
                break;
            }
        }
        tracing::debug!("video decode exiting");
    }

    fn handle(&mut self, item: PacketItem) -> Result<(), DecodeError> {
        match item {
            QueueItem::Data(unit) => self.decode(&unit),
            QueueItem::Flush(Discontinuity::Seek { target, serial }) => {
                self.decoder.flush();
                let dropped = self.output.clear();
                self.skip_until = Some(target);
                tracing::debug!(
                    "video flush for seek to {:.3}s (serial {}), {} frames dropped",
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
                self.skip_until = None;
                self.forward(QueueItem::Flush(Discontinuity::Rewind));
                Ok(())
            }
            QueueItem::End => {
                self.drain()?;
                self.decoder.flush();
                self.forward(QueueItem::End);
                Ok(())
            }
        }
    }

    fn decode(&mut self, unit: &CompressedUnit) -> Result<(), DecodeError> {
        let start = Instant::now();
        self.decoder.send(unit)?;
        self.metrics.record(Metric::Decode(start.elapsed()));
        self.receive_all()
    }

    /// Feed end of input and emit every frame the codec still holds.
    fn drain(&mut self) -> Result<(), DecodeError> {
        self.decoder.send_eof()?;
        self.receive_all()
    }

    fn receive_all(&mut self) -> Result<(), DecodeError> {
        loop {
            let start = Instant::now();
            let Some(raw) = self.decoder.receive()? else {
                return Ok(());
            };
            self.metrics.record(Metric::Decode(start.elapsed()));
            self.process(raw)?;
        }
    }

    fn process(&mut self, raw: RawVideoFrame) -> Result<(), DecodeError> {
        let pts = pts_to_seconds(raw.pts, self.time_base);
        if let Some(target) = self.skip_until {
            if pts + PTS_EPSILON < target {
                tracing::trace!("skipping frame at {:.3}s before seek target", pts);
                return Ok(());
            }
            self.skip_until = None;
        }

        let frame = match raw.image {
            RawImage::Surface(surface) => {
                let start = Instant::now();
                let downloaded = {
                    let _guard = self.gpu.lock();
                    surface.download()
                };
                self.metrics.record(Metric::Transfer(start.elapsed()));
                match downloaded {
                    Ok(image) if image.format == PixelFormat::Nv12 => biplanar(image, pts)?,
                    Ok(image) => self.convert(image, pts)?,
                    Err(err) => {
                        tracing::warn!("dropping frame at {:.3}s: {}", pts, err);
                        return Ok(());
                    }
                }
            }
            RawImage::Software(image) => self.convert(image, pts)?,
        };

        if self
            .output
            .enqueue(QueueItem::Data(frame), || self.control.is_cancelled())
            .is_err()
        {
            tracing::trace!("frame at {:.3}s discarded", pts);
        }
        Ok(())
    }

    fn convert(&mut self, image: PlanarImage, pts: Seconds) -> Result<VideoFrame, DecodeError> {
        let (width, height) = (image.width, image.height);
        if image.format == PixelFormat::Bgra {
            image.validate()?;
            let plane = image
                .planes
                .into_iter()
                .next()
                .ok_or_else(|| DecodeError::Codec("bgra frame without planes".into()))?;
            return Ok(VideoFrame {
                pts,
                width,
                height,
                pixels: FramePixels::Bgra(plane),
            });
        }

        let stale = self
            .converter
            .as_ref()
            .map_or(true, |c| !c.matches(image.format, width, height));
        if stale {
            tracing::debug!("creating converter for {} {}x{}", image.format, width, height);
            self.converter = Some(self.decoder.converter(image.format, width, height)?);
        }
        let Some(converter) = self.converter.as_mut() else {
            return Err(DecodeError::UnsupportedPixelFormat(image.format));
        };

        let start = Instant::now();
        let plane = converter.convert(&image)?;
        self.metrics.record(Metric::Convert(start.elapsed()));
        Ok(VideoFrame {
            pts,
            width,
            height,
            pixels: FramePixels::Bgra(plane),
        })
    }

    fn forward(&self, marker: FrameItem) {
        let control = &self.control;
        if self.output.enqueue(marker, || !control.is_running()).is_err() {
            tracing::trace!("marker dropped at shutdown");
        }
    }
}

/// Wrap a downloaded NV12 image as a biplanar frame.
fn biplanar(image: PlanarImage, pts: Seconds) -> Result<VideoFrame, DecodeError> {
    image.validate()?;
    let (width, height) = (image.width, image.height);
    let mut planes = image.planes.into_iter();
    match (planes.next(), planes.next()) {
        (Some(luma), Some(chroma)) => Ok(VideoFrame {
            pts,
            width,
            height,
            pixels: FramePixels::Nv12 { luma, chroma },
        }),
        _ => Err(DecodeError::Transfer("nv12 surface without chroma plane".into())),
    }
}
