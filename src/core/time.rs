//! Media time helpers.
//!
//! Presentation timestamps travel through the pipeline as `f64` seconds. Containers express
//! timestamps as integer ticks of a per-stream rational time base; this module converts
//! between the two without overflowing on long streams.

use std::fmt;

/// Media time in seconds, relative to stream start.
pub type Seconds = f64;

/// Time constants for conversions
pub mod constants {
    pub const MICROS_PER_SECOND: i64 = 1_000_000;
    pub const MILLIS_PER_SECOND: f64 = 1_000.0;
}

/// Rational time base of a stream: one tick lasts `num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Microsecond time base, the container-level base used for seeking.
    pub const MICROSECONDS: TimeBase = TimeBase::new(1, 1_000_000);

    /// Convert a tick count in this time base to seconds.
    #[inline]
    pub fn to_seconds(self, ticks: i64) -> Seconds {
        if self.den == 0 {
            return 0.0;
        }
        // i128 keeps 90kHz timestamps of multi-hour streams exact
        let scaled = ticks as i128 * self.num as i128;
        scaled as f64 / self.den as f64
    }

    /// Convert seconds to the nearest earlier tick in this time base.
    #[inline]
    pub fn from_seconds(self, seconds: Seconds) -> i64 {
        if self.num == 0 {
            return 0;
        }
        (seconds * self.den as f64 / self.num as f64).floor() as i64
    }

    /// Duration of a single tick in seconds.
    pub fn tick(self) -> Seconds {
        self.to_seconds(1)
    }
}

impl fmt::Display for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Presentation time of a frame: `pts × time_base`, or 0 when the codec left it unset.
#[inline]
pub fn pts_to_seconds(pts: Option<i64>, time_base: TimeBase) -> Seconds {
    pts.map(|ticks| time_base.to_seconds(ticks)).unwrap_or(0.0)
}

/// Convert milliseconds to seconds
#[inline]
pub fn from_millis(millis: u64) -> Seconds {
    millis as f64 / constants::MILLIS_PER_SECOND
}

/// Convert seconds to whole milliseconds (rounded)
#[inline]
pub fn to_millis(seconds: Seconds) -> i64 {
    (seconds * constants::MILLIS_PER_SECOND).round() as i64
}

/// Format time as HH:MM:SS.mmm (hours omitted when zero).
pub fn format_time(seconds: Seconds) -> String {
    let negative = seconds < 0.0;
    let total_millis = to_millis(seconds.abs());
    let hours = total_millis / 3_600_000;
    let minutes = (total_millis / 60_000) % 60;
    let secs = (total_millis / 1_000) % 60;
    let millis = total_millis % 1_000;
    let sign = if negative { "-" } else { "" };

    if hours > 0 {
        format!("{}{:02}:{:02}:{:02}.{:03}", sign, hours, minutes, secs, millis)
    } else {
        format!("{}{:02}:{:02}.{:03}", sign, minutes, secs, millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpeg_ts_time_base() {
        let tb = TimeBase::new(1, 90_000);
        assert!((tb.to_seconds(90_000) - 1.0).abs() < 1e-12);
        assert!((tb.to_seconds(3_003) - 0.033366).abs() < 1e-6);
        assert_eq!(tb.from_seconds(2.0), 180_000);
    }

    #[test]
    fn test_from_seconds_is_backward_biased() {
        let tb = TimeBase::new(1, 30);
        // 5.02s sits between ticks 150 and 151
        assert_eq!(tb.from_seconds(5.02), 150);
    }

    #[test]
    fn test_unset_pts_is_zero() {
        assert_eq!(pts_to_seconds(None, TimeBase::new(1, 1000)), 0.0);
        assert_eq!(pts_to_seconds(Some(1500), TimeBase::new(1, 1000)), 1.5);
    }

    #[test]
    fn test_degenerate_time_base() {
        let tb = TimeBase::new(0, 0);
        assert_eq!(tb.to_seconds(1234), 0.0);
        assert_eq!(tb.from_seconds(3.0), 0);
    }

    #[test]
    fn test_large_timestamps() {
        // ten hours at 90kHz
        let tb = TimeBase::new(1, 90_000);
        let ticks = 10 * 3600 * 90_000i64;
        assert!((tb.to_seconds(ticks) - 36_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(3661.5), "01:01:01.500");
        assert_eq!(format_time(65.25), "01:05.250");
        assert_eq!(format_time(-1.0), "-00:01.000");
    }

    #[test]
    fn test_millis_conversion() {
        assert_eq!(from_millis(8), 0.008);
        assert_eq!(to_millis(0.0333), 33);
    }
}
