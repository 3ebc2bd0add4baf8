use serde::Serialize;

use crate::clock::Timestamp;

/// Half-open `[on, off)` interval during which the relay should be on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub on: Timestamp,
    pub off: Timestamp,
}

impl Window {
    /// Rejects empty or inverted intervals.
    pub fn new(on: Timestamp, off: Timestamp) -> Option<Self> {
        (off > on).then_some(Self { on, off })
    }

    pub fn contains(&self, now: Timestamp) -> bool {
        now >= self.on && now < self.off
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.off
    }
}

/// Seconds added after dusk and removed before dawn when a night window is
/// derived from cached prayer times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOffsets {
    pub on_after_dusk_secs: i64,
    pub off_before_dawn_secs: i64,
}

/// The two automatic windows the decision engine merges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveWindows {
    pub weekly: Option<Window>,
    pub special: Option<Window>,
}

impl ActiveWindows {
    pub fn scheduled_on(&self, now: Timestamp) -> bool {
        self.iter().any(|w| w.contains(now))
    }

    /// Latest `off` among the windows that contain `now`.
    pub fn active_until(&self, now: Timestamp) -> Option<Timestamp> {
        self.iter().filter(|w| w.contains(now)).map(|w| w.off).max()
    }

    fn iter(&self) -> impl Iterator<Item = &Window> {
        self.weekly.iter().chain(self.special.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefreshPhase {
    Idle,
    Pending,
    InProgress,
}

impl RefreshPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    #[serde(rename = "relayOn")]
    pub relay_on: bool,
    #[serde(rename = "manualOnLatch")]
    pub manual_on_latch: bool,
    #[serde(rename = "manualOffUntil")]
    pub manual_off_until: Option<Timestamp>,
    #[serde(rename = "blockOnUntil")]
    pub block_on_until: Option<Timestamp>,
    #[serde(rename = "weeklyWindow")]
    pub weekly_window: Option<Window>,
    #[serde(rename = "specialDay")]
    pub special_day: Option<SpecialDayStatus>,
    #[serde(rename = "forcedOffNext")]
    pub forced_off_next: Option<Timestamp>,
    #[serde(rename = "forcedOffLastFired")]
    pub forced_off_last_fired: Option<Timestamp>,
    #[serde(rename = "cachedDays")]
    pub cached_days: usize,
    #[serde(rename = "lastRefresh")]
    pub last_refresh: Option<String>,
    #[serde(rename = "refreshPhase")]
    pub refresh_phase: RefreshPhase,
    #[serde(rename = "adminCount")]
    pub admin_count: usize,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpecialDayStatus {
    pub name: String,
    #[serde(rename = "religiousDate")]
    pub religious_date: String,
    pub on: Timestamp,
    pub off: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_half_open() {
        let w = Window::new(100, 200).unwrap();
        assert!(!w.contains(99));
        assert!(w.contains(100));
        assert!(w.contains(199));
        assert!(!w.contains(200));
        assert!(w.is_expired(200));
        assert!(Window::new(200, 200).is_none());
    }

    #[test]
    fn active_until_picks_latest_containing_window() {
        let windows = ActiveWindows {
            weekly: Window::new(100, 300),
            special: Window::new(150, 400),
        };
        assert_eq!(windows.active_until(120), Some(300));
        assert_eq!(windows.active_until(200), Some(400));
        assert_eq!(windows.active_until(350), Some(400));
        assert_eq!(windows.active_until(500), None);
        assert!(!windows.scheduled_on(50));
    }
}
