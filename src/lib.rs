//! floatplay: core of a floating video-loop player.
//!
//! A demux thread and two decode threads feed bounded queues; the control thread presents
//! video frames against an audio clock derived from played bytes. See [`playback::Player`].

pub mod audio;
pub mod config;
pub mod core;
pub mod media;
pub mod pipeline;
pub mod platform;
pub mod playback;
pub mod render;

pub use config::PlayerConfig;
pub use media::DecodeMode;
pub use playback::{Player, PlayerControl, PlayerError, PlayerEvent};
