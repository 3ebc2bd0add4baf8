//! Decoding of the prayer-times provider payload.
//!
//! The provider answers `GET {base}/vakitler/{district}` with a JSON array of
//! days. Only the fields the controller needs are read; each day carries its
//! Gregorian date in one of three spellings.

use serde::Deserialize;
use thiserror::Error;

use crate::calendar::DayRecord;
use crate::clock::Ymd;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed with status {code}")]
    FetchFailed { code: u16 },
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider payload could not be parsed: {0}")]
    ParseFailed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderDay {
    #[serde(rename = "MiladiTarihUzunIso8601", default)]
    pub long_gregorian_date: Option<String>,
    #[serde(rename = "MiladiTarihKisa", default)]
    pub short_gregorian_date: Option<String>,
    #[serde(rename = "MiladiTarihKisaIso8601", default)]
    pub short_gregorian_iso: Option<String>,
    #[serde(rename = "Imsak", default)]
    pub dawn: Option<String>,
    #[serde(rename = "Aksam", default)]
    pub dusk: Option<String>,
    #[serde(rename = "HicriTarihUzun", default)]
    pub long_religious_date: Option<String>,
}

impl ProviderDay {
    /// `None` when the date or either prayer time is unusable.
    pub fn to_record(&self) -> Option<DayRecord> {
        let date_text = [
            &self.long_gregorian_date,
            &self.short_gregorian_date,
            &self.short_gregorian_iso,
        ]
        .into_iter()
        .filter_map(|field| field.as_deref())
        .map(str::trim)
        .find(|text| !text.is_empty())?;

        let date = parse_gregorian_date(date_text)?;
        let dawn = parse_hhmm(self.dawn.as_deref()?)?;
        let dusk = parse_hhmm(self.dusk.as_deref()?)?;
        let religious = self.long_religious_date.as_deref().unwrap_or_default();
        Some(DayRecord::new(date, dawn, dusk, religious))
    }
}

/// Accepts `YYYY-MM-DD` (optionally followed by a time part) or `DD.MM.YYYY`.
pub fn parse_gregorian_date(text: &str) -> Option<Ymd> {
    let text = text.trim();
    let bytes = text.as_bytes();

    if bytes.len() >= 10 && bytes[4] == b'-' && bytes[7] == b'-' {
        let year = text.get(0..4)?.parse().ok()?;
        let month = text.get(5..7)?.parse().ok()?;
        let day = text.get(8..10)?.parse().ok()?;
        return Ymd::new(year, month, day);
    }

    if bytes.len() >= 10 && bytes[2] == b'.' && bytes[5] == b'.' {
        let day = text.get(0..2)?.parse().ok()?;
        let month = text.get(3..5)?.parse().ok()?;
        let year = text.get(6..10)?.parse().ok()?;
        return Ymd::new(year, month, day);
    }

    None
}

/// `HH:MM` to minute of day.
pub fn parse_hhmm(text: &str) -> Option<u16> {
    let (hour, minute) = text.trim().split_once(':')?;
    let hour: u16 = hour.trim().parse().ok()?;
    let minute: u16 = minute.trim().get(..2).unwrap_or(minute).parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some(hour * 60 + minute)
}

/// Parses the whole payload, silently dropping unusable days. Validation of
/// the resulting count is left to the cache.
pub fn parse_payload(payload: &[u8]) -> Result<Vec<DayRecord>, ProviderError> {
    let days: Vec<ProviderDay> = serde_json::from_slice(payload)?;
    Ok(days.iter().filter_map(ProviderDay::to_record).collect())
}

pub fn calendar_url(base_url: &str, district_id: u32) -> String {
    format!("{}/vakitler/{district_id}", base_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_both_date_spellings() {
        assert_eq!(parse_gregorian_date("2026-03-12T00:00:00.0000000+03:00"), Ymd::new(2026, 3, 12));
        assert_eq!(parse_gregorian_date("12.03.2026"), Ymd::new(2026, 3, 12));
        assert_eq!(parse_gregorian_date("2026-02-30"), None);
        assert_eq!(parse_gregorian_date("12 Mart 2026"), None);
    }

    #[test]
    fn parses_clock_times() {
        assert_eq!(parse_hhmm("05:07"), Some(307));
        assert_eq!(parse_hhmm(" 18:45 "), Some(1_125));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("0545"), None);
    }

    #[test]
    fn payload_drops_unusable_days() {
        let payload = br#"[
            {"MiladiTarihUzunIso8601":"2026-03-12T00:00:00.0000000+03:00","Imsak":"05:31","Aksam":"19:05","HicriTarihUzun":"23 Ramazan 1447"},
            {"MiladiTarihUzunIso8601":null,"MiladiTarihKisa":"13.03.2026","Imsak":"05:29","Aksam":"19:06","HicriTarihUzun":"24 Ramazan 1447"},
            {"MiladiTarihKisa":"14.03.2026","Imsak":"","Aksam":"19:07"},
            {"Imsak":"05:26","Aksam":"19:08"}
        ]"#;

        let records = parse_payload(payload).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].date, Ymd::new(2026, 3, 12).unwrap());
        assert_eq!(records[0].dawn_minute, 5 * 60 + 31);
        assert_eq!(records[0].dusk_minute, 19 * 60 + 5);
        assert_eq!(records[1].religious_date.as_str(), "24 Ramazan 1447");
    }

    #[test]
    fn rejects_non_array_payload() {
        assert!(matches!(
            parse_payload(b"{\"error\":\"nope\"}"),
            Err(ProviderError::ParseFailed(_))
        ));
    }

    #[test]
    fn builds_district_url() {
        assert_eq!(
            calendar_url("https://ezanvakti.emushaf.net/", 9206),
            "https://ezanvakti.emushaf.net/vakitler/9206"
        );
    }
}
