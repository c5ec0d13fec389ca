//! Notifications emitted by the player.

use crate::core::time::Seconds;

/// Event delivered to the GUI over the player's event channel
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// A file was opened successfully
    FileLoaded,
    DurationChanged(Seconds),
    PositionChanged(Seconds),
    /// `true` when playing, `false` when paused or stopped
    PlaybackStateChanged(bool),
    /// Playback reached the end with looping off
    EndOfFile,
    /// Human-readable failure description
    ErrorOccurred(String),
}
