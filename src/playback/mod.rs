//! Playback control: the player, its clock and presentation scheduling.

pub mod clock;
pub mod engine;
pub mod events;
pub mod metrics;
pub mod scheduler;
pub mod state;

pub use clock::ClockState;
pub use engine::{Player, PlayerControl, PlayerError};
pub use events::PlayerEvent;
pub use metrics::{Metric, MetricsSink, MetricsSnapshot, NoopMetrics, WindowedMetrics};
pub use scheduler::RenderScheduler;
pub use state::PlaybackState;
