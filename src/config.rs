use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::PipelineError;

/// Largest accepted proximity window, about a century.
pub const MAX_PROXIMITY_WINDOW_HOURS: i64 = 24 * 365 * 100;

/// Every tunable the pipeline reads. Loaded from YAML; any missing section
/// falls back to the values in the `Default` impls below.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection: DetectionConfig,
    pub normalization: NormalizationConfig,
    pub extraction: ExtractionConfig,
    pub dedup: DedupConfig,
    pub threading: ThreadingConfig,
    /// Size of the per-document worker pool; `None` uses the global rayon pool.
    pub workers: Option<usize>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Number of non-blank lines searched for a header block.
    pub header_scan_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    /// OCR-damaged domain -> real domain, applied to every address.
    pub domain_corrections: BTreeMap<String, String>,
    /// Whole garbled address -> real address. Keys are matched lowercased.
    pub address_corrections: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// The archive's known identities. Used as implicit recipients of
    /// message-block documents.
    pub principal_addresses: Vec<String>,
    /// strftime patterns tried in order; the first full match wins.
    pub date_formats: Vec<String>,
    /// Lowercased OCR'd display name -> corrected name.
    pub name_corrections: BTreeMap<String, String>,
    /// Lowercased display name -> address, seeding alias resolution.
    pub sender_aliases: BTreeMap<String, String>,
    /// A standalone line starting with one of these ends the body.
    pub page_marker_prefixes: Vec<String>,
    pub split_message_blocks: bool,
    /// Read `From: multiple senders` transcripts as one record per message.
    pub split_group_chats: bool,
    pub extract_quoted: bool,
    pub strip_quoted: bool,
    pub resolve_aliases: bool,
    /// Lowercased names of people whose correspondence is flagged.
    pub associate_names: Vec<String>,
    /// Sender fragments that mark a record as bulk mail.
    pub bulk_senders: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Number of normalized body characters folded into the fingerprint.
    pub fingerprint_prefix_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadingConfig {
    pub proximity_window_hours: i64,
    /// Principals receive nearly everything, so overlapping on them alone
    /// would merge unrelated threads.
    pub ignore_principals_in_overlap: bool,
    /// Only link through shared participants when the subjects also agree
    /// (equal, or one of them empty).
    pub participants_require_subject: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            header_scan_lines: 15,
        }
    }
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        let domain_corrections = [
            ("gmail.corn", "gmail.com"),
            ("gmail.cam", "gmail.com"),
            ("gmail.cpm", "gmail.com"),
            ("gmai1.com", "gmail.com"),
            ("grnail.com", "gmail.com"),
            ("grnail.corn", "gmail.com"),
            ("qmail.com", "gmail.com"),
            ("yahoo.corn", "yahoo.com"),
            ("aol.corn", "aol.com"),
        ];
        let address_corrections = [
            ("jeevacationagmail.com", "jeevacation@gmail.com"),
            ("jeeyacation@gmail.com", "jeevacation@gmail.com"),
            ("ieevacation@gmail.com", "jeevacation@gmail.com"),
            ("leevacation@gmail.com", "jeevacation@gmail.com"),
            ("eevacation@gmail.com", "jeevacation@gmail.com"),
            ("jeetunes@gmail.com", "jeeitunes@gmail.com"),
            ("jeeltunes@gmail.com", "jeeitunes@gmail.com"),
        ];

        Self {
            domain_corrections: domain_corrections
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            address_corrections: address_corrections
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            principal_addresses: vec![
                "jeevacation@gmail.com".to_string(),
                "jeeitunes@gmail.com".to_string(),
            ],
            date_formats: default_date_formats(),
            name_corrections: [
                ("darren lndyke", "Darren Indyke"),
                ("lesley groffl", "Lesley Groff"),
                ("tesley groff", "Lesley Groff"),
                ("alan m. dershowil", "Alan Dershowitz"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            sender_aliases: [
                ("jeffrey epstein", "jeevacation@gmail.com"),
                ("jeffrey e.", "jeevacation@gmail.com"),
                ("jeevacation", "jeevacation@gmail.com"),
                ("jeeitunes", "jeeitunes@gmail.com"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            page_marker_prefixes: vec!["HOUSE_OVERSIGHT".to_string(), "HOUSE OVERSIGHT".to_string()],
            split_message_blocks: false,
            split_group_chats: false,
            extract_quoted: false,
            strip_quoted: true,
            resolve_aliases: true,
            associate_names: [
                "ghislaine maxwell",
                "lesley groff",
                "leslie groff",
                "darren indyke",
                "richard kahn",
                "rich kahn",
                "jean luc brunel",
                "jean-luc brunel",
                "sarah kellen",
                "sarah kensington",
                "nadia marcinkova",
                "adriana ross",
                "adriana mucinska",
                "halidah sedgwick",
                "alan dershowitz",
                "alan m. dershowitz",
            ]
            .iter()
            .map(|name| name.to_string())
            .collect(),
            bulk_senders: vec!["asmallworld@".to_string()],
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fingerprint_prefix_len: 200,
        }
    }
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            proximity_window_hours: 24 * 7,
            ignore_principals_in_overlap: true,
            participants_require_subject: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Layouts seen in the archive's `Sent:`, `Date:` and `Time:` values, after
/// timezone noise has been stripped.
pub fn default_date_formats() -> Vec<String> {
    [
        "%m/%d/%Y %I:%M:%S %p",
        "%m/%d/%Y %I:%M:%S%p",
        "%m/%d/%Y %I:%M %p",
        "%m/%d/%y %I:%M:%S %p",
        "%m/%d/%y %I:%M %p",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%A, %B %d, %Y %I:%M %p",
        "%A, %B %d, %Y %I:%M:%S %p",
        "%A, %B %d, %Y %I:%M%p",
        "%a, %b %d, %Y at %I:%M %p",
        "%a, %b %d, %Y at %I:%M:%S %p",
        "%A, %B %d, %Y at %I:%M %p",
        "%A, %B %d, %Y at %I:%M:%S %p",
        "%B %d, %Y at %I:%M:%S %p",
        "%B %d, %Y at %I:%M %p",
        "%a, %d %b %Y %H:%M:%S %z",
        "%a, %d %b %Y %H:%M:%S",
        "%a, %b %d, %Y %I:%M %p",
        "%A, %B %d %Y %I:%M %p",
        "%A, %B %d %Y %I:%M:%S %p",
        "%b %d, %Y %I:%M %p",
        "%b %d, %Y, %I:%M:%S %p",
        "%b %d, %Y %H:%M:%S",
        "%a %m/%d/%Y %I:%M %p",
        "%a %m/%d/%Y %I:%M:%S %p",
        "%B %d, %Y, %I:%M:%S %p",
        "%B %d, %Y %I:%M:%S %p",
        "%B %d, %Y %I:%M %p",
        "%A, %d %B %Y %H:%M",
        "%A, %d %B %Y %H:%M:%S",
        "%A, %b %d, %Y, %I:%M %p",
        "%d %B %Y %H:%M",
        "%d/%m/%Y %I:%M %p",
        "%d/%m/%Y %H:%M",
        "%d/%m/%Y %H:%M:%S",
        "%B %d, %Y",
        "%Y-%m-%d",
        "%m/%d/%Y",
        "%m/%d/%y",
        "%d/%m/%Y",
    ]
    .iter()
    .map(|f| f.to_string())
    .collect()
}

impl PipelineConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: PipelineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {path}"))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.detection.header_scan_lines == 0 {
            return Err(PipelineError::InvalidConfig(
                "detection.header_scan_lines must be at least 1".to_string(),
            ));
        }
        if self.dedup.fingerprint_prefix_len == 0 {
            return Err(PipelineError::InvalidConfig(
                "dedup.fingerprint_prefix_len must be at least 1".to_string(),
            ));
        }
        if self.threading.proximity_window_hours < 0 {
            return Err(PipelineError::InvalidConfig(
                "threading.proximity_window_hours must not be negative".to_string(),
            ));
        }
        if self.threading.proximity_window_hours > MAX_PROXIMITY_WINDOW_HOURS {
            return Err(PipelineError::InvalidConfig(format!(
                "threading.proximity_window_hours must be at most {MAX_PROXIMITY_WINDOW_HOURS}"
            )));
        }
        if self.extraction.date_formats.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "extraction.date_formats must list at least one pattern".to_string(),
            ));
        }
        if self.workers == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "workers must be at least 1 when set".to_string(),
            ));
        }

        // A correction whose output is itself rewritten would not be stable
        // under a second pass.
        for (name, table) in [
            ("normalization.domain_corrections", &self.normalization.domain_corrections),
            ("normalization.address_corrections", &self.normalization.address_corrections),
        ] {
            for (from, to) in table {
                if from != to && table.get(to).map_or(false, |next| next != to) {
                    return Err(PipelineError::InvalidConfig(format!(
                        "{name}: '{from}' maps to '{to}', which is itself corrected"
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn is_principal(&self, identity: &str) -> bool {
        self.extraction
            .principal_addresses
            .iter()
            .any(|p| p.eq_ignore_ascii_case(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dedup.fingerprint_prefix_len, 200);
        assert_eq!(config.threading.proximity_window_hours, 168);
        assert_eq!(config.extraction.principal_addresses.len(), 2);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "dedup:\n  fingerprint_prefix_len: 64\nworkers: 4\n";
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.dedup.fingerprint_prefix_len, 64);
        assert_eq!(config.workers, Some(4));
        assert_eq!(config.detection.header_scan_lines, 15);
        assert!(config.extraction.strip_quoted);
    }

    #[test]
    fn test_rejects_chained_corrections() {
        let mut config = PipelineConfig::default();
        config
            .normalization
            .domain_corrections
            .insert("gmail.com".to_string(), "example.com".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_prefix() {
        let mut config = PipelineConfig::default();
        config.dedup.fingerprint_prefix_len = 0;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_window() {
        let mut config = PipelineConfig::default();
        config.threading.proximity_window_hours = i64::MAX;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));

        config.threading.proximity_window_hours = MAX_PROXIMITY_WINDOW_HOURS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oversized_window_in_yaml_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailsift.yaml");
        std::fs::write(&path, "threading:\n  proximity_window_hours: 9223372036854775807\n").unwrap();
        assert!(PipelineConfig::from_file(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailsift.yaml");
        let path = path.to_str().unwrap();

        let mut config = PipelineConfig::default();
        config.threading.proximity_window_hours = 48;
        config.to_file(path).unwrap();

        let loaded = PipelineConfig::from_file(path).unwrap();
        assert_eq!(loaded.threading.proximity_window_hours, 48);
        assert_eq!(
            loaded.normalization.domain_corrections,
            config.normalization.domain_corrections
        );
    }

    #[test]
    fn test_is_principal_ignores_case() {
        let config = PipelineConfig::default();
        assert!(config.is_principal("JeeVacation@Gmail.com"));
        assert!(!config.is_principal("someone@example.com"));
    }
}
