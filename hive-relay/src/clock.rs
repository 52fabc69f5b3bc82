//! Hub time. The hub's local clock is ground truth for drift and silence gaps;
//! timestamps on the wire and in the stores are naive ISO-8601 in hub-local time.

use chrono::{DateTime, Local, NaiveDateTime};
use std::sync::Arc;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Accepts `2024-01-01T00:00:00[.ffffff]`, the same with a space separator, or
/// RFC 3339 with an offset (converted to hub-local time).
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Local).naive_local());
    }
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

/// Signed seconds from `earlier` to `later`, millisecond resolution.
pub fn seconds_between(later: NaiveDateTime, earlier: NaiveDateTime) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
pub use testing::{ts, ManualClock};

#[cfg(test)]
mod testing {
    use super::*;
    use parking_lot::Mutex;

    pub fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).unwrap()
    }

    /// Clock whose time only moves when a test says so.
    pub struct ManualClock(Mutex<NaiveDateTime>);

    impl ManualClock {
        pub fn starting_at(raw: &str) -> Arc<Self> {
            Arc::new(Self(Mutex::new(ts(raw))))
        }

        pub fn set(&self, raw: &str) {
            *self.0.lock() = ts(raw);
        }

        pub fn advance_secs(&self, secs: i64) {
            let mut now = self.0.lock();
            *now += chrono::Duration::seconds(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> NaiveDateTime {
            *self.0.lock()
        }
    }
}
