//! Parsing of the long-form religious calendar date the provider attaches to
//! every day, e.g. `"26 Ramazan 1447"`.
//!
//! Month names arrive with Turkish diacritics and a handful of alternate
//! spellings. Both the cached text and the static special-day table go through
//! [`normalize_month`] before they are compared.

/// Folded before lowercasing; `İ`.to_lowercase() would otherwise produce a
/// combining dot.
const DIACRITICS: &[(char, char)] = &[
    ('Ç', 'C'),
    ('ç', 'c'),
    ('Ğ', 'G'),
    ('ğ', 'g'),
    ('İ', 'I'),
    ('ı', 'i'),
    ('Ö', 'O'),
    ('ö', 'o'),
    ('Ş', 'S'),
    ('ş', 's'),
    ('Ü', 'U'),
    ('ü', 'u'),
    ('Â', 'A'),
    ('â', 'a'),
    ('Î', 'I'),
    ('î', 'i'),
    ('Û', 'U'),
    ('û', 'u'),
];

const MONTH_ALIASES: &[(&str, &str)] = &[
    ("recep", "receb"),
    ("rebiyulevvel", "rebiulevvel"),
    ("rebiyulahir", "rebiulahir"),
    ("rebiulsani", "rebiulahir"),
    ("cemaziyelevvel", "cemaziyelevvel"),
    ("cemaziyulevvel", "cemaziyelevvel"),
    ("cemaziyelahir", "cemaziyelahir"),
    ("cemaziyulahir", "cemaziyelahir"),
    ("zilkade", "zilkade"),
    ("zilkaade", "zilkade"),
    ("zulhicce", "zilhicce"),
    ("zilhicce", "zilhicce"),
];

pub fn normalize_month(name: &str) -> String {
    // "Rebiül Evvel" and "Rebiülevvel" are the same month.
    let folded = name
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .map(fold_diacritic)
        .collect::<String>()
        .to_lowercase();

    MONTH_ALIASES
        .iter()
        .find(|(alias, _)| *alias == folded)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or(folded)
}

fn fold_diacritic(ch: char) -> char {
    DIACRITICS
        .iter()
        .find(|(from, _)| *from == ch)
        .map(|(_, to)| *to)
        .unwrap_or(ch)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HijriDate {
    pub day: u8,
    /// Normalized month key.
    pub month: String,
    /// Zero when the year field is missing or unparsable.
    pub year: u16,
}

impl HijriDate {
    /// Day is the text before the first space, year the text after the last
    /// space, month everything in between.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let first = text.find(' ')?;
        let last = text.rfind(' ')?;
        if last <= first {
            return None;
        }

        let day: u8 = text[..first].parse().ok()?;
        if !(1..=30).contains(&day) {
            return None;
        }

        let month = text[first + 1..last].trim();
        if month.is_empty() {
            return None;
        }

        let year = text[last + 1..].trim().parse::<u16>().unwrap_or(0);

        Some(Self {
            day,
            month: normalize_month(month),
            year,
        })
    }

    pub fn is_month(&self, month: &str) -> bool {
        self.month == normalize_month(month)
    }

    pub fn matches(&self, day: u8, month: &str) -> bool {
        self.day == day && self.is_month(month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalizes_diacritics_and_aliases() {
        assert_eq!(normalize_month("Şaban"), "saban");
        assert_eq!(normalize_month("ŞEVVAL"), "sevval");
        assert_eq!(normalize_month("Recep"), "receb");
        assert_eq!(normalize_month(" Rebiyülevvel "), "rebiulevvel");
        assert_eq!(normalize_month("Rebiül Evvel"), "rebiulevvel");
        assert_eq!(normalize_month("İkinci"), "ikinci");
        assert_eq!(normalize_month("Zilhicce"), "zilhicce");
    }

    #[test]
    fn parses_three_field_text() {
        let parsed = HijriDate::parse("26 Ramazan 1447").unwrap();
        assert_eq!(
            parsed,
            HijriDate {
                day: 26,
                month: "ramazan".to_string(),
                year: 1447
            }
        );
        assert!(parsed.matches(26, "RAMAZAN"));
        assert!(!parsed.matches(27, "Ramazan"));
    }

    #[test]
    fn multi_word_month_keeps_middle_field() {
        let parsed = HijriDate::parse("3 Rebiül Evvel 1447").unwrap();
        assert_eq!(parsed.day, 3);
        assert_eq!(parsed.month, "rebiulevvel");
        assert!(parsed.matches(3, "Rebiülevvel"));

        let later = HijriDate::parse("11 Rebiyül Ahir 1447").unwrap();
        assert!(later.is_month("Rebiülahir"));
        assert!(HijriDate::parse("2 Cemaziyel Evvel 1447")
            .unwrap()
            .is_month("Cemaziyelevvel"));
    }

    #[test]
    fn rejects_malformed_text() {
        assert_eq!(HijriDate::parse("31 Receb 1447"), None);
        assert_eq!(HijriDate::parse("0 Receb 1447"), None);
        assert_eq!(HijriDate::parse("Receb"), None);
        assert_eq!(HijriDate::parse("12 1447"), None);
        assert_eq!(HijriDate::parse("x Receb 1447"), None);
        assert_eq!(HijriDate::parse(""), None);
    }

    #[test]
    fn unparsable_year_becomes_zero() {
        let parsed = HijriDate::parse("14 Şaban ????").unwrap();
        assert_eq!(parsed.year, 0);
        assert!(parsed.is_month("saban"));
    }
}
