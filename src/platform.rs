//! Backend selection at startup.

use std::sync::Arc;

use crate::audio::device::{AudioBackend, VirtualAudio};
use crate::media::synthetic::{SyntheticBackend, SyntheticOptions};
use crate::media::{MediaBackend, OpenError};

/// Which media backend to open files with
#[derive(Debug, Clone)]
pub enum MediaChoice {
    /// FFmpeg when compiled in
    Native,
    /// Generated test pattern; ignores the path
    TestPattern(SyntheticOptions),
}

/// Pick the media backend.
pub fn media_backend(choice: MediaChoice) -> Result<Arc<dyn MediaBackend>, OpenError> {
    match choice {
        MediaChoice::TestPattern(options) => Ok(Arc::new(SyntheticBackend::new(options))),
        MediaChoice::Native => native_media_backend(),
    }
}

#[cfg(feature = "ffmpeg")]
fn native_media_backend() -> Result<Arc<dyn MediaBackend>, OpenError> {
    Ok(Arc::new(crate::media::ffmpeg::FfmpegBackend::new()?))
}

#[cfg(not(feature = "ffmpeg"))]
fn native_media_backend() -> Result<Arc<dyn MediaBackend>, OpenError> {
    Err(OpenError::Container(
        "built without the `ffmpeg` feature; use the test pattern".into(),
    ))
}

/// Pick the audio backend: the host device when compiled in, otherwise a realtime virtual
/// device so playback still advances at the correct rate.
pub fn audio_backend(muted: bool) -> Arc<dyn AudioBackend> {
    if muted {
        return Arc::new(VirtualAudio::realtime());
    }
    host_audio_backend()
}

#[cfg(feature = "audio-out")]
fn host_audio_backend() -> Arc<dyn AudioBackend> {
    Arc::new(crate::audio::cpal_device::CpalAudio::new())
}

#[cfg(not(feature = "audio-out"))]
fn host_audio_backend() -> Arc<dyn AudioBackend> {
    tracing::debug!("built without `audio-out`; using virtual audio output");
    Arc::new(VirtualAudio::realtime())
}

/// Names of the presentation backends compiled into this build, preferred first.
pub fn available_renderers() -> Vec<&'static str> {
    let mut renderers = Vec::new();
    if cfg!(feature = "gpu") {
        renderers.push("wgpu");
    }
    renderers.push("null");
    renderers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_renderer_always_available() {
        let renderers = available_renderers();
        assert_eq!(renderers.last(), Some(&"null"));
        assert_eq!(renderers.contains(&"wgpu"), cfg!(feature = "gpu"));
    }

    #[test]
    fn test_test_pattern_backend() {
        let backend = media_backend(MediaChoice::TestPattern(SyntheticOptions::default())).unwrap();
        assert_eq!(backend.name(), "synthetic");
    }

    #[test]
    fn test_muted_audio_is_virtual() {
        assert_eq!(audio_backend(true).name(), "virtual");
    }
}
