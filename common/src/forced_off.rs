use chrono_tz::Tz;

use crate::calendar::CalendarCache;
use crate::clock::{local_today, Timestamp};
use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedOffEvent {
    Idle,
    /// The scheduled instant was reached; the relay must be forced off now.
    Fired { scheduled: Timestamp },
    /// Stored instant was far in the past (clock jump, fresh boot); recomputed.
    Stale { scheduled: Timestamp },
    /// Tolerance elapsed before a tick observed the instant; recomputed.
    Missed { scheduled: Timestamp },
}

/// Daily mandatory relay-off shortly before dawn. Fires at most once per
/// scheduled instant.
#[derive(Debug, Clone)]
pub struct ForcedOffScheduler {
    off_before_dawn_secs: i64,
    stale_secs: i64,
    tolerance_secs: i64,
    recompute_lead_secs: i64,
    next_fire: Option<Timestamp>,
    last_fired: Option<Timestamp>,
}

impl ForcedOffScheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            off_before_dawn_secs: config.off_before_dawn_secs,
            stale_secs: config.forced_off_stale_secs,
            tolerance_secs: config.forced_off_tolerance_secs,
            recompute_lead_secs: config.forced_off_recompute_lead_secs,
            next_fire: None,
            last_fired: None,
        }
    }

    pub fn next_fire(&self) -> Option<Timestamp> {
        self.next_fire
    }

    pub fn last_fired(&self) -> Option<Timestamp> {
        self.last_fired
    }

    pub fn set_next_fire(&mut self, next: Option<Timestamp>) {
        self.next_fire = next;
    }

    /// Today's `dawn - offset` while it is still ahead, tomorrow's otherwise.
    /// Needs today's record to decide.
    pub fn compute_next(&self, now: Timestamp, cache: &CalendarCache, tz: &Tz) -> Option<Timestamp> {
        let today = local_today(tz, now)?;
        let today_off = cache.lookup(today)?.dawn_at(tz)? - self.off_before_dawn_secs;
        if now < today_off {
            return Some(today_off);
        }
        let tomorrow = today.add_days(1)?;
        Some(cache.lookup(tomorrow)?.dawn_at(tz)? - self.off_before_dawn_secs)
    }

    pub fn recompute(&mut self, now: Timestamp, cache: &CalendarCache, tz: &Tz) {
        self.next_fire = self.compute_next(now, cache, tz);
    }

    pub fn ensure_scheduled(&mut self, now: Timestamp, cache: &CalendarCache, tz: &Tz) {
        if self.next_fire.is_none() {
            self.recompute(now, cache, tz);
        }
    }

    pub fn tick(&mut self, now: Timestamp, cache: &CalendarCache, tz: &Tz) -> ForcedOffEvent {
        let Some(scheduled) = self.next_fire else {
            return ForcedOffEvent::Idle;
        };

        if scheduled < now - self.stale_secs {
            self.recompute(now, cache, tz);
            return ForcedOffEvent::Stale { scheduled };
        }
        if now > scheduled + self.tolerance_secs {
            self.recompute(now, cache, tz);
            return ForcedOffEvent::Missed { scheduled };
        }
        if now >= scheduled && self.last_fired != Some(scheduled) {
            self.last_fired = Some(scheduled);
            self.recompute(now + self.recompute_lead_secs, cache, tz);
            return ForcedOffEvent::Fired { scheduled };
        }

        ForcedOffEvent::Idle
    }
}
