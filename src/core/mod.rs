//! Core types shared by every pipeline stage.
//!
//! All presentation times are `f64` seconds; stream-native tick counts are converted at
//! the decode boundary through [`TimeBase`].

pub mod time;

pub use time::{format_time, pts_to_seconds, Seconds, TimeBase};
