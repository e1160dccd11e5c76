use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref TRAILING_SERIAL: Regex = Regex::new(r"\s*\(\d+\)\s*$").unwrap();
    static ref GMT_OFFSET_PAREN: Regex = Regex::new(r"\s*\(GMT[+-]\d{1,2}:\d{2}\)\s*").unwrap();
    static ref GMT_OFFSET: Regex = Regex::new(r"\s+GMT[+-]\d+\b").unwrap();
    static ref ZONE_PAREN: Regex =
        Regex::new(r"\s*\((?:EST|PST|CST|MST|EDT|PDT|CDT|MDT|UTC|GMT|GDT|BST|IST)\)").unwrap();
    static ref ZONE_ABBREV: Regex =
        Regex::new(r"\s+(?:EST|PST|CST|MST|EDT|PDT|CDT|MDT|UTC|GMT|GDT|BST|IST)\b").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// A header date. OCR damage that no pattern can read is kept verbatim
/// rather than guessed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Timestamp {
    Parsed { value: NaiveDateTime },
    Unparsed { raw: String },
}

impl Timestamp {
    pub fn parsed(&self) -> Option<NaiveDateTime> {
        match self {
            Timestamp::Parsed { value } => Some(*value),
            Timestamp::Unparsed { .. } => None,
        }
    }

    pub fn is_unparsed(&self) -> bool {
        matches!(self, Timestamp::Unparsed { .. })
    }

    /// The timestamp's contribution to a fingerprint. Every unparsed value
    /// maps to the same token so OCR variants of one garbled date still match.
    pub fn fingerprint_token(&self) -> String {
        match self {
            Timestamp::Parsed { value } => value.format("%Y-%m-%dT%H:%M:%S").to_string(),
            Timestamp::Unparsed { .. } => "unparsed".to_string(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Parsed { value } => write!(f, "{}", value.format("%Y-%m-%d %H:%M:%S")),
            Timestamp::Unparsed { raw } => write!(f, "unparsed({raw})"),
        }
    }
}

pub struct TimestampParser {
    formats: Vec<String>,
}

impl TimestampParser {
    pub fn new(formats: Vec<String>) -> Self {
        Self { formats }
    }

    /// Removes timezone labels and exporter serial numbers that none of the
    /// patterns account for.
    pub fn clean(raw: &str) -> String {
        let cleaned = TRAILING_SERIAL.replace(raw, "");
        let cleaned = GMT_OFFSET_PAREN.replace_all(&cleaned, " ");
        let cleaned = GMT_OFFSET.replace_all(&cleaned, " ");
        let cleaned = ZONE_PAREN.replace_all(&cleaned, " ");
        let cleaned = ZONE_ABBREV.replace_all(&cleaned, " ");
        let cleaned = WHITESPACE.replace_all(&cleaned, " ");
        cleaned.trim().trim_end_matches(',').trim().to_string()
    }

    pub fn parse(&self, raw: &str) -> Timestamp {
        let cleaned = Self::clean(raw);
        if !cleaned.is_empty() {
            for format in &self.formats {
                if let Some(value) = parse_with(&cleaned, format) {
                    if (1950..=2100).contains(&value.year()) {
                        return Timestamp::Parsed { value };
                    }
                }
            }
        }

        Timestamp::Unparsed {
            raw: raw.trim().to_string(),
        }
    }
}

fn parse_with(text: &str, format: &str) -> Option<NaiveDateTime> {
    if format.contains("%z") {
        return DateTime::parse_from_str(text, format)
            .ok()
            .map(|dt| dt.naive_local());
    }

    let has_time = ["%H", "%I", "%M", "%T", "%R"]
        .iter()
        .any(|spec| format.contains(spec));
    if has_time {
        NaiveDateTime::parse_from_str(text, format).ok()
    } else {
        NaiveDate::parse_from_str(text, format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_date_formats;

    fn parser() -> TimestampParser {
        TimestampParser::new(default_date_formats())
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_us_slash_format() {
        assert_eq!(
            parser().parse("6/15/2018 1:47:13 PM").parsed(),
            Some(at(2018, 6, 15, 13, 47, 13))
        );
    }

    #[test]
    fn test_two_digit_year_is_not_read_as_four() {
        assert_eq!(
            parser().parse("07/25/18 02:29:14 PM (554246954)").parsed(),
            Some(at(2018, 7, 25, 14, 29, 14))
        );
    }

    #[test]
    fn test_long_form_with_zone() {
        assert_eq!(
            parser().parse("Monday, June 3, 2019 8:31 AM EST").parsed(),
            Some(at(2019, 6, 3, 8, 31, 0))
        );
    }

    #[test]
    fn test_rfc_with_offset_keeps_local_time() {
        assert_eq!(
            parser().parse("Sun, 22 Jul 2018 22:01:54 +0200").parsed(),
            Some(at(2018, 7, 22, 22, 1, 54))
        );
    }

    #[test]
    fn test_date_only_is_midnight() {
        assert_eq!(
            parser().parse("2015-01-01").parsed(),
            Some(at(2015, 1, 1, 0, 0, 0))
        );
        assert_eq!(
            parser().parse("January 23, 2009").parsed(),
            Some(at(2009, 1, 23, 0, 0, 0))
        );
    }

    #[test]
    fn test_garbled_value_is_unparsed() {
        let ts = parser().parse("Tu3sd@y, Ja#uary ?? 2O1?");
        assert!(ts.is_unparsed());
        assert_eq!(ts.fingerprint_token(), "unparsed");
        assert_eq!(
            ts,
            Timestamp::Unparsed {
                raw: "Tu3sd@y, Ja#uary ?? 2O1?".to_string()
            }
        );
    }

    #[test]
    fn test_clean_strips_zone_noise() {
        assert_eq!(
            TimestampParser::clean("Fri, 1 Jul 2016 07:01:36 -0400 (EDT)"),
            "Fri, 1 Jul 2016 07:01:36 -0400"
        );
        assert_eq!(
            TimestampParser::clean("3/7/2011 2:04 PM (GMT-05:00)"),
            "3/7/2011 2:04 PM"
        );
    }

    #[test]
    fn test_fingerprint_token_format() {
        let ts = Timestamp::Parsed {
            value: at(2015, 1, 1, 9, 5, 0),
        };
        assert_eq!(ts.fingerprint_token(), "2015-01-01T09:05:00");
    }
}
