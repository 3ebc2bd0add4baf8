use chrono_tz::Tz;
use serde::Serialize;

use crate::calendar::{CalendarCache, DayRecord};
use crate::clock::{Timestamp, Ymd};
use crate::config::SpecialDaysConfig;
use crate::types::{Window, WindowOffsets};

/// Month whose every day gets its own window when the whole-month rule is on.
pub const FASTING_MONTH: &str = "Ramazan";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialDayDefinition {
    pub id: &'static str,
    pub hijri_day: u8,
    pub hijri_month: &'static str,
    pub name: &'static str,
    pub enabled: bool,
}

const fn def(
    id: &'static str,
    hijri_day: u8,
    hijri_month: &'static str,
    name: &'static str,
) -> SpecialDayDefinition {
    SpecialDayDefinition {
        id,
        hijri_day,
        hijri_month,
        name,
        enabled: true,
    }
}

pub const DEFAULT_SPECIAL_DAYS: [SpecialDayDefinition; 15] = [
    def("uc_aylar", 1, "Receb", "Üç Ayların Başlangıcı"),
    def("regaib_2", 2, "Receb", "Regaib Kandili (2 Receb)"),
    def("regaib_5", 5, "Receb", "Regaib Kandili (5 Receb)"),
    def("mirac", 26, "Receb", "Miraç Kandili"),
    def("berat", 14, "Şaban", "Berat Kandili"),
    def("kadir", 26, "Ramazan", "Kadir Gecesi"),
    def("ramazan_bayrami_1", 1, "Şevval", "Ramazan Bayramı 1. Gün"),
    def("ramazan_bayrami_2", 2, "Şevval", "Ramazan Bayramı 2. Gün"),
    def("ramazan_bayrami_3", 3, "Şevval", "Ramazan Bayramı 3. Gün"),
    def("kurban_arefe", 9, "Zilhicce", "Kurban Bayramı Arefe Günü"),
    def("kurban_bayrami_1", 10, "Zilhicce", "Kurban Bayramı 1. Gün"),
    def("kurban_bayrami_2", 11, "Zilhicce", "Kurban Bayramı 2. Gün"),
    def("kurban_bayrami_3", 12, "Zilhicce", "Kurban Bayramı 3. Gün"),
    def("kurban_bayrami_4", 13, "Zilhicce", "Kurban Bayramı 4. Gün"),
    def("mevlid", 11, "Rebiülevvel", "Mevlid Kandili"),
];

/// A resolved night window tied to a special day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecialWindow {
    pub name: String,
    #[serde(rename = "religiousDate")]
    pub religious_date: String,
    #[serde(rename = "eventDate")]
    pub event_date: Ymd,
    pub window: Window,
    pub enabled: bool,
}

impl SpecialWindow {
    pub fn is_active(&self, now: Timestamp) -> bool {
        self.window.contains(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingState {
    Active,
    Upcoming,
}

impl ListingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "AKTIF",
            Self::Upcoming => "YAKLASAN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedSpecialDay {
    pub state: ListingState,
    #[serde(flatten)]
    pub special: SpecialWindow,
}

impl ListedSpecialDay {
    pub fn line(&self) -> String {
        let marker = if self.special.enabled { "✅" } else { "🚫" };
        let icon = match self.state {
            ListingState::Active => "🟢",
            ListingState::Upcoming => "🟡",
        };
        format!(
            "{marker} {icon} {} - {} Miladi: {}",
            self.state.as_str(),
            self.special.name,
            self.special.event_date.format_dmy()
        )
    }
}

/// Matches the definition table and the fasting-month rule against the cache
/// and picks the window that currently matters.
#[derive(Debug, Clone)]
pub struct SpecialDayResolver {
    definitions: Vec<SpecialDayDefinition>,
    whole_fasting_month: bool,
    offsets: WindowOffsets,
}

impl SpecialDayResolver {
    pub fn new(config: &SpecialDaysConfig, offsets: WindowOffsets) -> Self {
        let definitions = DEFAULT_SPECIAL_DAYS
            .iter()
            .map(|d| SpecialDayDefinition {
                enabled: !config.disabled.iter().any(|id| id == d.id),
                ..*d
            })
            .collect();
        Self {
            definitions,
            whole_fasting_month: config.whole_ramadan,
            offsets,
        }
    }

    pub fn definitions(&self) -> &[SpecialDayDefinition] {
        &self.definitions
    }

    /// Window for the first cached day matching `definition`:
    /// `[dusk(event - 1) + on offset, dawn(event) - off offset)`.
    pub fn window_for(
        &self,
        definition: &SpecialDayDefinition,
        cache: &CalendarCache,
        tz: &Tz,
    ) -> Option<SpecialWindow> {
        let record = cache.records().iter().find(|r| {
            r.hijri()
                .is_some_and(|h| h.matches(definition.hijri_day, definition.hijri_month))
        })?;
        self.event_window(record, definition.name.to_string(), definition.enabled, cache, tz)
    }

    fn event_window(
        &self,
        record: &DayRecord,
        name: String,
        enabled: bool,
        cache: &CalendarCache,
        tz: &Tz,
    ) -> Option<SpecialWindow> {
        let eve = record.date.add_days(-1)?;
        let window = cache.night_window(tz, eve, record.date, self.offsets)?;
        Some(SpecialWindow {
            name,
            religious_date: record.religious_date.to_string(),
            event_date: record.date,
            window,
            enabled,
        })
    }

    fn fasting_month_windows<'a>(
        &'a self,
        cache: &'a CalendarCache,
        tz: &'a Tz,
    ) -> impl Iterator<Item = SpecialWindow> + 'a {
        cache
            .records()
            .iter()
            .filter(move |_| self.whole_fasting_month)
            .filter_map(move |record| {
                let hijri = record.hijri()?;
                if !hijri.is_month(FASTING_MONTH) {
                    return None;
                }
                let name = format!("{FASTING_MONTH} Günü {}", hijri.day);
                self.event_window(record, name, true, cache, tz)
            })
    }

    /// Every resolvable window, including ones from disabled definitions.
    pub fn candidates(&self, cache: &CalendarCache, tz: &Tz) -> Vec<SpecialWindow> {
        self.definitions
            .iter()
            .filter_map(|d| self.window_for(d, cache, tz))
            .chain(self.fasting_month_windows(cache, tz))
            .collect()
    }

    /// Active windows win over future ones regardless of start time; within
    /// each group the earliest `on` wins. Expired windows and disabled
    /// definitions are never selected.
    pub fn select(&self, now: Timestamp, cache: &CalendarCache, tz: &Tz) -> Option<SpecialWindow> {
        let enabled: Vec<SpecialWindow> = self
            .candidates(cache, tz)
            .into_iter()
            .filter(|c| c.enabled)
            .collect();

        let active = enabled
            .iter()
            .filter(|c| c.is_active(now))
            .min_by_key(|c| c.window.on);
        let chosen = match active {
            Some(active) => active,
            None => enabled
                .iter()
                .filter(|c| c.window.on > now)
                .min_by_key(|c| c.window.on)?,
        };
        Some(chosen.clone())
    }

    /// Active and upcoming windows for display, nearest first. Disabled
    /// definitions are listed so users can see what is switched off.
    pub fn listing(&self, now: Timestamp, cache: &CalendarCache, tz: &Tz) -> Vec<ListedSpecialDay> {
        let mut listed: Vec<ListedSpecialDay> = self
            .candidates(cache, tz)
            .into_iter()
            .filter_map(|special| {
                let state = if special.is_active(now) {
                    ListingState::Active
                } else if special.window.on > now {
                    ListingState::Upcoming
                } else {
                    return None;
                };
                Some(ListedSpecialDay { state, special })
            })
            .collect();

        listed.sort_by_key(|l| (l.state, l.special.event_date, l.special.window.on));
        listed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::fixtures::days_from;
    use chrono::TimeZone;
    use chrono_tz::Europe::Istanbul;
    use pretty_assertions::assert_eq;

    const OFFSETS: WindowOffsets = WindowOffsets {
        on_after_dusk_secs: 60,
        off_before_dawn_secs: 60,
    };

    fn at(m: u32, d: u32, h: u32, min: u32) -> Timestamp {
        Istanbul
            .with_ymd_and_hms(2026, m, d, h, min, 0)
            .unwrap()
            .timestamp()
    }

    fn ymd(m: u32, d: u32) -> Ymd {
        Ymd::new(2026, m, d).unwrap()
    }

    /// 2026-03-01 .. 2026-03-30 labelled `N Ramazan 1447` for the first 19
    /// days and `N Şevval 1447` afterwards.
    fn fasting_cache() -> CalendarCache {
        let mut records = days_from(ymd(3, 1), 30);
        for (i, record) in records.iter_mut().enumerate() {
            let text = if i < 19 {
                format!("{} Ramazan 1447", i + 12)
            } else {
                format!("{} Şevval 1447", i - 18)
            };
            *record = DayRecord::new(record.date, record.dawn_minute, record.dusk_minute, &text);
        }
        CalendarCache::from_records(records)
    }

    fn resolver(disabled: &[&str], whole_ramadan: bool) -> SpecialDayResolver {
        SpecialDayResolver::new(
            &SpecialDaysConfig {
                disabled: disabled.iter().map(|s| s.to_string()).collect(),
                whole_ramadan,
            },
            OFFSETS,
        )
    }

    #[test]
    fn definition_window_spans_eve_to_dawn() {
        let cache = fasting_cache();
        let resolver = resolver(&[], false);
        let kadir = resolver
            .definitions()
            .iter()
            .find(|d| d.id == "kadir")
            .unwrap();

        // 26 Ramazan lands on 2026-03-15.
        let special = resolver.window_for(kadir, &cache, &Istanbul).unwrap();
        assert_eq!(special.event_date, ymd(3, 15));
        assert_eq!(special.religious_date, "26 Ramazan 1447");
        assert_eq!(special.window.on, at(3, 14, 18, 1));
        assert_eq!(special.window.off, at(3, 15, 4, 59));
    }

    #[test]
    fn event_on_first_cached_day_has_no_window() {
        let cache = fasting_cache();
        let resolver = resolver(&[], true);
        let names: Vec<String> = resolver
            .candidates(&cache, &Istanbul)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert!(!names.contains(&"Ramazan Günü 12".to_string()));
        assert!(names.contains(&"Ramazan Günü 13".to_string()));
        assert!(names.contains(&"Ramazan Bayramı 1. Gün".to_string()));
    }

    #[test]
    fn active_window_beats_earlier_future_candidate() {
        let cache = fasting_cache();
        let resolver = resolver(&[], true);

        // Inside the night before 26 Ramazan; Kadir and "Ramazan Günü 26"
        // share the window, Kadir comes first in the table.
        let selected = resolver
            .select(at(3, 14, 23, 0), &cache, &Istanbul)
            .unwrap();
        assert!(selected.is_active(at(3, 14, 23, 0)));
        assert_eq!(selected.name, "Kadir Gecesi");

        // During the day the nearest future window is the following night.
        let selected = resolver
            .select(at(3, 15, 12, 0), &cache, &Istanbul)
            .unwrap();
        assert_eq!(selected.name, "Ramazan Günü 27");
        assert_eq!(selected.window.on, at(3, 15, 18, 1));
    }

    #[test]
    fn disabled_definitions_are_never_selected() {
        let cache = fasting_cache();
        let resolver = resolver(&["kadir"], false);

        let selected = resolver
            .select(at(3, 14, 23, 0), &cache, &Istanbul)
            .unwrap();
        // Nothing enabled is active, so the next enabled event is picked.
        assert_eq!(selected.name, "Ramazan Bayramı 1. Gün");
        assert_eq!(selected.event_date, ymd(3, 20));
    }

    #[test]
    fn disabled_match_never_displaces_active_window() {
        let cache = fasting_cache();
        let resolver = resolver(&["kadir"], true);
        let now = at(3, 14, 23, 0);

        // Kadir leads the table and its window opens no later than the
        // fasting-month night, but it is switched off.
        let kadir = resolver
            .candidates(&cache, &Istanbul)
            .into_iter()
            .find(|c| c.name == "Kadir Gecesi")
            .unwrap();
        let selected = resolver.select(now, &cache, &Istanbul).unwrap();
        assert!(kadir.window.on <= selected.window.on);
        assert!(selected.is_active(now));
        assert!(selected.enabled);
        assert_eq!(selected.name, "Ramazan Günü 26");

        let lines: Vec<String> = resolver
            .listing(now, &cache, &Istanbul)
            .iter()
            .map(ListedSpecialDay::line)
            .collect();
        assert!(lines.contains(&"🚫 🟢 AKTIF - Kadir Gecesi Miladi: 15.03.2026".to_string()));
        assert!(lines.contains(&"✅ 🟢 AKTIF - Ramazan Günü 26 Miladi: 15.03.2026".to_string()));
    }

    #[test]
    fn listing_skips_past_and_marks_disabled() {
        let cache = fasting_cache();
        let resolver = resolver(&["ramazan_bayrami_2"], false);

        let listed = resolver.listing(at(3, 14, 23, 0), &cache, &Istanbul);
        let lines: Vec<String> = listed.iter().map(ListedSpecialDay::line).collect();
        assert_eq!(
            lines,
            vec![
                "✅ 🟢 AKTIF - Kadir Gecesi Miladi: 15.03.2026".to_string(),
                "✅ 🟡 YAKLASAN - Ramazan Bayramı 1. Gün Miladi: 20.03.2026".to_string(),
                "🚫 🟡 YAKLASAN - Ramazan Bayramı 2. Gün Miladi: 21.03.2026".to_string(),
                "✅ 🟡 YAKLASAN - Ramazan Bayramı 3. Gün Miladi: 22.03.2026".to_string(),
            ]
        );

        let later = resolver.listing(at(3, 25, 12, 0), &cache, &Istanbul);
        assert!(later.is_empty());
    }
}
