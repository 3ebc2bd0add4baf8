use std::fmt;

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Wall-clock instant in unix seconds.
pub type Timestamp = i64;

/// Anything earlier than this means SNTP has not delivered a real time yet.
pub const CLOCK_SYNC_EPOCH: Timestamp = 1_700_000_000;

/// Calendar date packed as `YYYYMMDD`, the same key the provider data and the
/// persisted cache use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ymd(u32);

impl Ymd {
    pub fn new(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self::from_date)
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.year().max(0) as u32 * 10_000 + date.month() * 100 + date.day())
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn year(self) -> i32 {
        (self.0 / 10_000) as i32
    }

    pub fn month(self) -> u32 {
        (self.0 / 100) % 100
    }

    pub fn day(self) -> u32 {
        self.0 % 100
    }

    pub fn to_date(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year(), self.month(), self.day())
    }

    /// Shifts by whole calendar days. Works on the naive local date, so a DST
    /// change between the two days never moves the result.
    pub fn add_days(self, delta: i64) -> Option<Self> {
        let date = self.to_date()?;
        let shifted = if delta >= 0 {
            date.checked_add_days(Days::new(delta as u64))?
        } else {
            date.checked_sub_days(Days::new(delta.unsigned_abs()))?
        };
        Some(Self::from_date(shifted))
    }

    /// `dd.mm.yyyy`, the way dates are shown to chat users.
    pub fn format_dmy(self) -> String {
        format!("{:02}.{:02}.{:04}", self.day(), self.month(), self.year())
    }
}

impl fmt::Display for Ymd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year(), self.month(), self.day())
    }
}

pub fn local_datetime(tz: &Tz, now: Timestamp) -> Option<DateTime<Tz>> {
    tz.timestamp_opt(now, 0).single()
}

pub fn local_date(tz: &Tz, now: Timestamp) -> Option<NaiveDate> {
    local_datetime(tz, now).map(|dt| dt.date_naive())
}

pub fn local_today(tz: &Tz, now: Timestamp) -> Option<Ymd> {
    local_date(tz, now).map(Ymd::from_date)
}

/// Converts a cached `(date, minute-of-day)` pair into an instant in `tz`.
/// Ambiguous local times resolve to the earlier instant; times that fall into
/// a DST gap yield `None`.
pub fn epoch_at(tz: &Tz, day: Ymd, minute_of_day: u16) -> Option<Timestamp> {
    let naive = day.to_date()?.and_hms_opt(
        u32::from(minute_of_day / 60),
        u32::from(minute_of_day % 60),
        0,
    )?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

pub fn format_timestamp(tz: &Tz, ts: Option<Timestamp>) -> String {
    match ts.and_then(|ts| local_datetime(tz, ts)) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

/// True once `now_ms` has reached `deadline_ms` on a wrapping millisecond
/// counter. Compares through the signed difference so a wrapped counter still
/// orders correctly within ±24 days.
pub fn deadline_reached(now_ms: u32, deadline_ms: u32) -> bool {
    (now_ms.wrapping_sub(deadline_ms) as i32) >= 0
}

pub fn elapsed_ms(now_ms: u32, since_ms: u32) -> u32 {
    now_ms.wrapping_sub(since_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Istanbul;

    #[test]
    fn ymd_day_arithmetic_crosses_month_and_year() {
        let d = Ymd::new(2025, 12, 31).unwrap();
        assert_eq!(d.add_days(1), Ymd::new(2026, 1, 1));
        assert_eq!(Ymd::new(2026, 3, 1).unwrap().add_days(-1), Ymd::new(2026, 2, 28));
        assert_eq!(d.raw(), 20251231);
        assert_eq!(d.format_dmy(), "31.12.2025");
        assert_eq!(d.to_string(), "2025-12-31");
    }

    #[test]
    fn epoch_at_uses_local_offset() {
        let day = Ymd::new(2026, 3, 12).unwrap();
        let ts = epoch_at(&Istanbul, day, 18 * 60).unwrap();
        // Istanbul is UTC+3 all year.
        let expected = chrono::Utc
            .with_ymd_and_hms(2026, 3, 12, 15, 0, 0)
            .unwrap()
            .timestamp();
        assert_eq!(ts, expected);
        assert_eq!(format_timestamp(&Istanbul, Some(ts)), "2026-03-12 18:00:00");
        assert_eq!(format_timestamp(&Istanbul, None), "-");
    }

    #[test]
    fn deadline_survives_counter_wraparound() {
        let deadline = u32::MAX - 10;
        assert!(!deadline_reached(u32::MAX - 20, deadline));
        assert!(deadline_reached(u32::MAX - 10, deadline));
        // Counter wrapped past zero: still after the deadline.
        assert!(deadline_reached(5, deadline));
        assert_eq!(elapsed_ms(5, deadline), 16);
    }
}
