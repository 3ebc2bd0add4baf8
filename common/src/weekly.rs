use chrono::{Datelike, Days, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::calendar::CalendarCache;
use crate::clock::{local_date, Timestamp, Ymd};
use crate::types::{Window, WindowOffsets};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub fn index(self) -> usize {
        match self {
            Self::Mon => 0,
            Self::Tue => 1,
            Self::Wed => 2,
            Self::Thu => 3,
            Self::Fri => 4,
            Self::Sat => 5,
            Self::Sun => 6,
        }
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }

    /// Days to step back from `today` to land on the most recent `self`
    /// (zero when today already is `self`).
    pub fn days_since(self, today: Weekday) -> u64 {
        let today = Self::from_chrono(today).index();
        ((today + 7 - self.index()) % 7) as u64
    }
}

/// Recurring night window from the anchor weekday's dusk to the next
/// morning's dawn.
#[derive(Debug, Clone)]
pub struct WeeklyWindowResolver {
    anchor: DayOfWeek,
    offsets: WindowOffsets,
}

impl WeeklyWindowResolver {
    pub fn new(anchor: DayOfWeek, offsets: WindowOffsets) -> Self {
        Self { anchor, offsets }
    }

    /// The anchor date is found with calendar arithmetic on the local date,
    /// so a DST shift between `now` and the anchor cannot land it on the
    /// wrong day. When this week's window has already closed the next week's
    /// anchor is tried once.
    pub fn resolve(&self, now: Timestamp, cache: &CalendarCache, tz: &Tz) -> Option<Window> {
        let today = local_date(tz, now)?;
        let back = self.anchor.days_since(today.weekday());
        let anchor = Ymd::from_date(today.checked_sub_days(Days::new(back))?);

        let window = self.window_from(anchor, cache, tz)?;
        if now < window.off {
            return Some(window);
        }
        self.window_from(anchor.add_days(7)?, cache, tz)
    }

    fn window_from(&self, anchor: Ymd, cache: &CalendarCache, tz: &Tz) -> Option<Window> {
        cache.night_window(tz, anchor, anchor.add_days(1)?, self.offsets)
    }
}
