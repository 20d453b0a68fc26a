//! Timestamp codec and clock sources.
//!
//! TWAMP timestamps use the NTP 64-bit fixed-point format: the upper 32 bits are
//! seconds since 1900-01-01 00:00 UTC and the lower 32 bits are the fraction of a
//! second in units of 2^-32 s.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// 64-bit fixed-point NTP timestamp as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Builds a timestamp from its seconds and fraction halves.
    #[must_use]
    pub const fn new(seconds: u32, fraction: u32) -> Self {
        Timestamp(((seconds as u64) << 32) | fraction as u64)
    }

    /// Seconds part (since 1900 for absolute timestamps).
    #[must_use]
    pub const fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Fractional part in units of 2^-32 s.
    #[must_use]
    pub const fn fraction(self) -> u32 {
        self.0 as u32
    }

    /// Converts a UTC date to NTP format, ignoring anything before the NTP epoch era.
    #[must_use]
    pub fn from_datetime(date: DateTime<Utc>) -> Self {
        let secs = (date.timestamp() + NTP_UNIX_OFFSET) as u32;
        let fraction = ((date.timestamp_subsec_nanos() as u64) << 32) / NANOS_PER_SEC;
        Timestamp::new(secs, fraction as u32)
    }

    /// Converts back to a UTC date, assuming NTP era 0.
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = self.seconds() as i64 - NTP_UNIX_OFFSET;
        let nanos = ((self.fraction() as u64 * NANOS_PER_SEC) >> 32) as u32;
        DateTime::from_timestamp(secs, nanos)
    }

    /// Encodes a relative duration (e.g. the Request-Session Timeout) in the
    /// same fixed-point format.
    #[must_use]
    pub fn from_duration(duration: Duration) -> Self {
        let secs = duration.as_secs().min(u32::MAX as u64) as u32;
        let fraction = ((duration.subsec_nanos() as u64) << 32) / NANOS_PER_SEC;
        Timestamp::new(secs, fraction as u32)
    }

    /// Decodes a relative fixed-point value into a duration.
    #[must_use]
    pub fn to_duration(self) -> Duration {
        let nanos = (self.fraction() as u64 * NANOS_PER_SEC) >> 32;
        Duration::new(self.seconds() as u64, nanos as u32)
    }

    /// This timestamp moved forward by `duration`, wrapping at the era boundary.
    #[must_use]
    pub fn after(self, duration: Duration) -> Self {
        Timestamp(self.0.wrapping_add(Timestamp::from_duration(duration).0))
    }

    /// Big-endian wire form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Decodes the wire form. Every 8-byte value is a valid timestamp.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Timestamp(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.9fZ")),
            None => write!(f, "{:#018x}", self.0),
        }
    }
}

/// Signed interval `b - a`.
///
/// The subtraction wraps in 64 bits, so two timestamps straddling an NTP era
/// rollover still produce the short interval between them.
#[must_use]
pub fn duration_between(a: Timestamp, b: Timestamp) -> TimeDelta {
    let diff = b.0.wrapping_sub(a.0) as i64;
    let nanos = ((diff as i128) * NANOS_PER_SEC as i128) >> 32;
    TimeDelta::nanoseconds(nanos as i64)
}

/// Source of local timestamps.
pub trait Clock: Send + Sync {
    /// Current time as an NTP timestamp.
    fn now(&self) -> Timestamp;
}

/// Wall-clock source that never goes backwards.
///
/// If the system clock is stepped back, the last returned value is repeated until
/// real time catches up, so timestamps taken through one clock are non-decreasing.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let now = Timestamp::from_datetime(Utc::now()).0;
        let prev = self.last.fetch_max(now, Ordering::AcqRel);
        Timestamp(prev.max(now))
    }
}
