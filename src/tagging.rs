use log::debug;

use crate::config::PipelineConfig;
use crate::email::{EmailRecord, RecordFlags};

/// Sets `RecordFlags` from the configured associate names and bulk-mail
/// senders. Matching is by lowercase substring, so `Lesley Groff
/// [lesley@x.com]` and `lesley groff` both hit.
pub struct RecordTagger {
    associates: Vec<String>,
    bulk_senders: Vec<String>,
}

impl RecordTagger {
    pub fn new(config: &PipelineConfig) -> Self {
        let lowered = |values: &[String]| -> Vec<String> {
            values
                .iter()
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .collect()
        };
        Self {
            associates: lowered(&config.extraction.associate_names),
            bulk_senders: lowered(&config.extraction.bulk_senders),
        }
    }

    pub fn flags(&self, record: &EmailRecord) -> RecordFlags {
        let sender_fields: Vec<&str> = std::iter::once(record.sender.as_str())
            .chain(record.sender_name.as_deref())
            .collect();
        let recipient_fields: Vec<&str> = record
            .recipients
            .iter()
            .chain(record.cc.iter())
            .map(String::as_str)
            .collect();

        let mut associates: Vec<String> = sender_fields
            .iter()
            .chain(recipient_fields.iter())
            .flat_map(|field| self.associates_in(field))
            .collect();
        associates.sort();
        associates.dedup();

        RecordFlags {
            associate_sender: sender_fields.iter().any(|f| !self.associates_in(f).is_empty()),
            associate_recipient: recipient_fields
                .iter()
                .any(|f| !self.associates_in(f).is_empty()),
            associates,
            irrelevant: self.is_bulk_mail(record),
        }
    }

    pub fn tag_all(&self, records: &mut [EmailRecord]) {
        let mut flagged = 0;
        for record in records.iter_mut() {
            record.flags = self.flags(record);
            if record.flags.irrelevant || !record.flags.associates.is_empty() {
                flagged += 1;
            }
        }
        debug!("Flagged {} of {} records", flagged, records.len());
    }

    fn associates_in(&self, field: &str) -> Vec<String> {
        let lowered = field.to_lowercase();
        self.associates
            .iter()
            .filter(|name| lowered.contains(name.as_str()))
            .map(|name| title_case(name))
            .collect()
    }

    /// Only unmistakable bulk mail: a known marketing sender, or an
    /// unsubscribe notice on a newsletter or mailing list.
    fn is_bulk_mail(&self, record: &EmailRecord) -> bool {
        let sender = record.sender.to_lowercase();
        if self.bulk_senders.iter().any(|s| sender.contains(s.as_str())) {
            return true;
        }
        let combined = format!("{} {} {}", record.subject, record.body, sender).to_lowercase();
        combined.contains("unsubscribe")
            && (combined.contains("newsletter") || combined.contains("mailing list"))
    }
}

/// Upper-cases every letter that follows a non-letter.
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut boundary = true;
    for c in name.chars() {
        if boundary && c.is_alphabetic() {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        boundary = !c.is_alphabetic();
    }
    out
}
