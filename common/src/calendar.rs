use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{epoch_at, Timestamp, Ymd};
use crate::hijri::HijriDate;
use crate::types::{Window, WindowOffsets};

pub const CACHE_CAPACITY: usize = 45;
pub const MIN_VALID_RECORDS: usize = 10;
pub const RELIGIOUS_TEXT_CAPACITY: usize = 32;

pub type ReligiousText = heapless::String<RELIGIOUS_TEXT_CAPACITY>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("refresh produced {count} valid records, need at least {MIN_VALID_RECORDS}")]
    InsufficientData { count: usize },
}

/// One provider day: the two prayer-time thresholds the windows are built from
/// and the religious calendar date used for special-day matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRecord {
    pub date: Ymd,
    #[serde(rename = "dawn")]
    pub dawn_minute: u16,
    #[serde(rename = "dusk")]
    pub dusk_minute: u16,
    #[serde(rename = "religious")]
    pub religious_date: ReligiousText,
}

impl DayRecord {
    pub fn new(date: Ymd, dawn_minute: u16, dusk_minute: u16, religious_date: &str) -> Self {
        Self {
            date,
            dawn_minute: dawn_minute.min(1_439),
            dusk_minute: dusk_minute.min(1_439),
            religious_date: truncate_text(religious_date),
        }
    }

    pub fn dawn_at(&self, tz: &Tz) -> Option<Timestamp> {
        epoch_at(tz, self.date, self.dawn_minute)
    }

    pub fn dusk_at(&self, tz: &Tz) -> Option<Timestamp> {
        epoch_at(tz, self.date, self.dusk_minute)
    }

    pub fn hijri(&self) -> Option<HijriDate> {
        HijriDate::parse(&self.religious_date)
    }
}

/// Cuts at a char boundary once the fixed capacity is reached.
fn truncate_text(text: &str) -> ReligiousText {
    let mut out = ReligiousText::new();
    for ch in text.trim().chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// Bounded, date-sorted store of provider days. Dates are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalendarCache {
    days: heapless::Vec<DayRecord, CACHE_CAPACITY>,
}

impl CalendarCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a cache from already-persisted records without the minimum-size
    /// check a refresh goes through.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = DayRecord>,
    {
        Self {
            days: stage(records),
        }
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn records(&self) -> &[DayRecord] {
        &self.days
    }

    pub fn first_date(&self) -> Option<Ymd> {
        self.days.first().map(|r| r.date)
    }

    pub fn last_date(&self) -> Option<Ymd> {
        self.days.last().map(|r| r.date)
    }

    pub fn lookup(&self, date: Ymd) -> Option<&DayRecord> {
        self.days
            .binary_search_by_key(&date, |r| r.date)
            .ok()
            .map(|idx| &self.days[idx])
    }

    pub fn contains(&self, date: Ymd) -> bool {
        self.lookup(date).is_some()
    }

    /// Sorts, drops duplicate dates (first occurrence wins), truncates to
    /// capacity, then swaps the new set in. Too few records leave the current
    /// cache untouched.
    pub fn replace_all<I>(&mut self, records: I) -> Result<usize, CacheError>
    where
        I: IntoIterator<Item = DayRecord>,
    {
        let staged = stage(records);
        if staged.len() < MIN_VALID_RECORDS {
            return Err(CacheError::InsufficientData {
                count: staged.len(),
            });
        }
        self.days = staged;
        Ok(self.days.len())
    }

    /// `[dusk(evening) + on offset, dawn(morning) - off offset)`. `None` when
    /// either day is missing or the result would be empty.
    pub fn night_window(
        &self,
        tz: &Tz,
        evening: Ymd,
        morning: Ymd,
        offsets: WindowOffsets,
    ) -> Option<Window> {
        let dusk = self.lookup(evening)?.dusk_at(tz)?;
        let dawn = self.lookup(morning)?.dawn_at(tz)?;
        Window::new(
            dusk + offsets.on_after_dusk_secs,
            dawn - offsets.off_before_dawn_secs,
        )
    }
}

fn stage<I>(records: I) -> heapless::Vec<DayRecord, CACHE_CAPACITY>
where
    I: IntoIterator<Item = DayRecord>,
{
    let mut all: Vec<DayRecord> = records.into_iter().collect();
    all.sort_by_key(|r| r.date);
    all.dedup_by_key(|r| r.date);

    let mut days = heapless::Vec::new();
    for record in all {
        if days.push(record).is_err() {
            break;
        }
    }
    days
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// `count` consecutive days starting at `start`, dawn 05:00, dusk 18:00.
    pub fn days_from(start: Ymd, count: usize) -> Vec<DayRecord> {
        (0..count as i64)
            .map(|i| {
                DayRecord::new(
                    start.add_days(i).unwrap(),
                    5 * 60,
                    18 * 60,
                    "1 Muharrem 1447",
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::days_from;
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Istanbul;
    use pretty_assertions::assert_eq;

    fn ymd(y: i32, m: u32, d: u32) -> Ymd {
        Ymd::new(y, m, d).unwrap()
    }

    #[test]
    fn replace_all_sorts_and_dedups() {
        let mut records = days_from(ymd(2026, 3, 1), 12);
        records.reverse();
        let mut dup = records[0].clone();
        dup.dusk_minute = 1;
        records.push(dup);

        let mut cache = CalendarCache::new();
        assert_eq!(cache.replace_all(records), Ok(12));
        assert_eq!(cache.first_date(), Some(ymd(2026, 3, 1)));
        assert_eq!(cache.last_date(), Some(ymd(2026, 3, 12)));
        // First occurrence wins.
        assert_eq!(cache.lookup(ymd(2026, 3, 12)).unwrap().dusk_minute, 18 * 60);
        assert!(cache
            .records()
            .windows(2)
            .all(|pair| pair[0].date < pair[1].date));
    }

    #[test]
    fn replace_all_truncates_at_capacity() {
        let mut cache = CalendarCache::new();
        assert_eq!(
            cache.replace_all(days_from(ymd(2026, 1, 1), 60)),
            Ok(CACHE_CAPACITY)
        );
        assert!(cache.contains(ymd(2026, 2, 14)));
        assert!(!cache.contains(ymd(2026, 2, 15)));
    }

    #[test]
    fn short_refresh_keeps_previous_cache() {
        let mut cache = CalendarCache::new();
        cache.replace_all(days_from(ymd(2026, 3, 1), 20)).unwrap();
        let before = cache.clone();

        assert_eq!(
            cache.replace_all(days_from(ymd(2026, 5, 1), 9)),
            Err(CacheError::InsufficientData { count: 9 })
        );
        assert_eq!(cache, before);
    }

    #[test]
    fn religious_text_is_truncated_on_char_boundary() {
        let long = "12 Şşşşşşşşşşşşşşşşşşşşşşşşşşşşşş 1447";
        let record = DayRecord::new(ymd(2026, 1, 1), 300, 1_080, long);
        assert!(record.religious_date.len() <= RELIGIOUS_TEXT_CAPACITY);
        assert!(record.religious_date.starts_with("12 Ş"));
    }

    #[test]
    fn night_window_applies_offsets() {
        let cache = CalendarCache::from_records(days_from(ymd(2026, 3, 12), 2));
        let offsets = WindowOffsets {
            on_after_dusk_secs: 60,
            off_before_dawn_secs: 60,
        };
        let window = cache
            .night_window(&Istanbul, ymd(2026, 3, 12), ymd(2026, 3, 13), offsets)
            .unwrap();

        let on = Istanbul.with_ymd_and_hms(2026, 3, 12, 18, 1, 0).unwrap();
        let off = Istanbul.with_ymd_and_hms(2026, 3, 13, 4, 59, 0).unwrap();
        assert_eq!(window.on, on.timestamp());
        assert_eq!(window.off, off.timestamp());

        assert_eq!(
            cache.night_window(&Istanbul, ymd(2026, 3, 13), ymd(2026, 3, 14), offsets),
            None
        );
    }
}
