use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::format::DocumentFormat;
use crate::timestamp::Timestamp;

/// Where inside a document a record was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    /// The document's own header.
    Document,
    /// A quoted header found inside another message's body.
    Quoted,
}

/// SHA-256 hex digest identifying one logical email.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Review flags set from the configured name and sender lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFlags {
    /// Canonical names of the associates found on the record, sorted.
    pub associates: Vec<String>,
    pub associate_sender: bool,
    pub associate_recipient: bool,
    /// Obvious bulk mail. Such records are kept, only marked.
    pub irrelevant: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecord {
    /// Address when one was readable, otherwise the cleaned display name.
    pub sender: String,
    pub sender_name: Option<String>,
    /// `To:` identities in header order, case-insensitive repeats removed.
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub timestamp: Timestamp,
    pub subject: String,
    pub reply_depth: u32,
    pub is_forward: bool,
    pub body: String,
    pub disclaimer: Option<String>,
    pub format: DocumentFormat,
    /// Message-store identifier. Kept for reference, never part of the fingerprint.
    pub guid: Option<String>,
    pub importance: Option<String>,
    pub origin: RecordOrigin,
    pub flags: RecordFlags,
    pub source_paths: BTreeSet<String>,
    pub fingerprint: Fingerprint,
}

impl EmailRecord {
    /// Sender, recipients and cc, in that order, without repeats.
    pub fn participants(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        std::iter::once(&self.sender)
            .chain(self.recipients.iter())
            .chain(self.cc.iter())
            .map(String::as_str)
            .filter(|p| !p.is_empty() && seen.insert(p.to_lowercase()))
            .collect()
    }

    /// Sort key used everywhere records are ordered: parsed timestamps first
    /// in time order, unparsed ones after, fingerprint breaking ties.
    pub fn chronological_key(&self) -> (bool, Option<NaiveDateTime>, &Fingerprint) {
        (
            self.timestamp.is_unparsed(),
            self.timestamp.parsed(),
            &self.fingerprint,
        )
    }
}

/// A thread of related records, in chronological order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Stable across runs on the same input.
    pub thread_key: String,
    pub subject: String,
    pub messages: Vec<Arc<EmailRecord>>,
    pub participants: BTreeSet<String>,
    pub first_timestamp: Option<NaiveDateTime>,
    pub last_timestamp: Option<NaiveDateTime>,
    pub involves_principal: bool,
}

impl Conversation {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_participant(&self, identity: &str) -> bool {
        self.participants
            .iter()
            .any(|p| p.eq_ignore_ascii_case(identity))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::NaiveDate;

    pub fn at(day: u32, hour: u32) -> Timestamp {
        Timestamp::Parsed {
            value: NaiveDate::from_ymd_opt(2015, 1, day)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap(),
        }
    }

    pub fn record(sender: &str, recipients: &[&str], timestamp: Timestamp, subject: &str) -> EmailRecord {
        EmailRecord {
            sender: sender.to_string(),
            sender_name: None,
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            cc: Vec::new(),
            timestamp,
            subject: subject.to_string(),
            reply_depth: 0,
            is_forward: false,
            body: format!("body of {subject}"),
            disclaimer: None,
            format: DocumentFormat::Traditional,
            guid: None,
            importance: None,
            origin: RecordOrigin::Document,
            flags: RecordFlags::default(),
            source_paths: BTreeSet::from([format!("{sender}-{subject}.txt")]),
            fingerprint: Fingerprint::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_participants_dedup_case_insensitive() {
        let mut r = record("a@x.com", &["b@x.com", "A@X.com"], at(1, 9), "Hi");
        r.cc = vec!["c@x.com".to_string(), "B@x.com".to_string()];
        assert_eq!(r.participants(), vec!["a@x.com", "b@x.com", "c@x.com"]);
    }

    #[test]
    fn test_unparsed_sorts_last() {
        let parsed = record("a@x.com", &[], at(2, 9), "Hi");
        let unparsed = record(
            "a@x.com",
            &[],
            Timestamp::Unparsed {
                raw: "??".to_string(),
            },
            "Hi",
        );
        assert!(parsed.chronological_key() < unparsed.chronological_key());
    }

    #[test]
    fn test_record_serializes_tagged_timestamp() {
        let r = record("a@x.com", &["b@x.com"], at(1, 9), "Hi");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["timestamp"]["state"], "parsed");
        assert_eq!(json["format"], "traditional");
        assert_eq!(json["origin"], "document");
    }
}
