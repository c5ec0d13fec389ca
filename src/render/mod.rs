//! Presentation sink.
//!
//! A [`PresentationBackend`] uploads a decoded frame and shows it. The frame's layout tag picks
//! the path: biplanar NV12 frames are converted to RGB by a shader, packed BGRA frames are
//! sampled directly. Every present and every hardware-surface download runs under the shared
//! [`GpuLock`].

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::core::time::Seconds;
use crate::media::{PixelLayout, VideoFrame};

pub mod shader;
#[cfg(feature = "gpu")]
pub mod wgpu_presenter;

#[cfg(feature = "gpu")]
pub use wgpu_presenter::WgpuPresenter;

/// Error type for presentation
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("wgpu error: {0}")]
    Wgpu(String),
    #[error("Surface error: {0}")]
    Surface(String),
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Mutual exclusion for device access shared by the decode and render paths.
#[derive(Debug, Clone, Default)]
pub struct GpuLock {
    inner: Arc<Mutex<()>>,
    multithread_protected: Arc<std::sync::atomic::AtomicBool>,
}

impl GpuLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Marks the device as requiring internal locking on every call.
    pub fn set_multithread_protected(&self, enabled: bool) {
        self.multithread_protected
            .store(enabled, std::sync::atomic::Ordering::Release);
    }

    pub fn multithread_protected(&self) -> bool {
        self.multithread_protected
            .load(std::sync::atomic::Ordering::Acquire)
    }
}

/// Capability interface of the output surface. Lives on the control thread.
pub trait PresentationBackend {
    fn name(&self) -> &'static str;

    /// Upload and present `frame`. The caller holds the GPU lock.
    fn present(&mut self, frame: &VideoFrame) -> Result<(), RenderError>;

    /// The output surface changed size.
    fn resize(&mut self, _width: u32, _height: u32) {}
}

/// What a headless presenter saw
#[derive(Debug, Clone, PartialEq)]
pub struct PresentRecord {
    pub pts: Seconds,
    pub layout: PixelLayout,
    pub width: u32,
    pub height: u32,
    /// Whether the GPU lock was held during the present
    pub locked: bool,
}

pub type PresentLog = Arc<Mutex<Vec<PresentRecord>>>;

/// Presenter without a surface, for headless playback and tests.
#[derive(Debug, Default)]
pub struct NullPresenter {
    log: Option<PresentLog>,
    gpu: Option<GpuLock>,
    presented: u64,
}

impl NullPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presenter recording every frame into the returned log.
    pub fn recording(gpu: GpuLock) -> (Self, PresentLog) {
        let log = PresentLog::default();
        let presenter = Self {
            log: Some(Arc::clone(&log)),
            gpu: Some(gpu),
            presented: 0,
        };
        (presenter, log)
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl PresentationBackend for NullPresenter {
    fn name(&self) -> &'static str {
        "null"
    }

    fn present(&mut self, frame: &VideoFrame) -> Result<(), RenderError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(RenderError::InvalidFrame(format!(
                "{}x{} frame",
                frame.width, frame.height
            )));
        }
        self.presented += 1;
        if let Some(log) = &self.log {
            log.lock().push(PresentRecord {
                pts: frame.pts,
                layout: frame.layout(),
                width: frame.width,
                height: frame.height,
                locked: self.gpu.as_ref().is_some_and(GpuLock::is_locked),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FramePixels, Plane};

    fn frame(pts: Seconds) -> VideoFrame {
        VideoFrame {
            pts,
            width: 2,
            height: 1,
            pixels: FramePixels::Bgra(Plane::new(vec![0; 8], 8)),
        }
    }

    #[test]
    fn test_gpu_lock_shared_between_clones() {
        let lock = GpuLock::new();
        let other = lock.clone();
        {
            let _guard = lock.lock();
            assert!(other.is_locked());
        }
        assert!(!other.is_locked());

        other.set_multithread_protected(true);
        assert!(lock.multithread_protected());
    }

    #[test]
    fn test_recording_presenter() {
        let gpu = GpuLock::new();
        let (mut presenter, log) = NullPresenter::recording(gpu.clone());
        {
            let _guard = gpu.lock();
            presenter.present(&frame(0.5)).unwrap();
        }
        presenter.present(&frame(0.6)).unwrap();

        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert!(log[0].locked);
        assert!(!log[1].locked);
        assert_eq!(log[0].layout, PixelLayout::Packed);
        assert_eq!(presenter.presented(), 2);
    }

    #[test]
    fn test_empty_frame_rejected() {
        let mut presenter = NullPresenter::new();
        let mut empty = frame(0.0);
        empty.width = 0;
        assert!(presenter.present(&empty).is_err());
    }
}
