//! Audio output: PCM buffers, device backends and the sink feeding them.

pub mod buffer;
#[cfg(feature = "audio-out")]
pub mod cpal_device;
pub mod device;
pub mod output;

pub use buffer::PcmBuffer;
#[cfg(feature = "audio-out")]
pub use cpal_device::CpalAudio;
pub use device::{AudioBackend, AudioDevice, AudioError, PcmFormat, VirtualAudio};
pub use output::AudioOutput;
