use log::debug;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::email::{EmailRecord, Fingerprint};

/// Builds the dedup key `sender | recipients | timestamp | body prefix`.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    prefix_len: usize,
}

impl Fingerprinter {
    pub fn new(prefix_len: usize) -> Self {
        Self { prefix_len }
    }

    /// The readable key that gets hashed. Exposed for diagnostics.
    pub fn key(&self, record: &EmailRecord) -> String {
        let mut recipients: Vec<String> = record
            .recipients
            .iter()
            .map(|r| r.trim().to_lowercase())
            .collect();
        recipients.sort();

        format!(
            "{}|{}|{}|{}",
            record.sender.trim().to_lowercase(),
            recipients.join(","),
            record.timestamp.fingerprint_token(),
            self.body_prefix(&record.body)
        )
    }

    pub fn fingerprint(&self, record: &EmailRecord) -> Fingerprint {
        let digest = Sha256::digest(self.key(record).as_bytes());
        Fingerprint(hex::encode(digest))
    }

    /// First K characters of the lowercased, whitespace-collapsed body.
    fn body_prefix(&self, body: &str) -> String {
        let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.to_lowercase().chars().take(self.prefix_len).collect()
    }
}

/// Output of a dedup pass.
#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// One record per fingerprint, ordered by fingerprint.
    pub records: Vec<Arc<EmailRecord>>,
    /// Input records folded into an earlier one.
    pub merged: usize,
}

pub struct Deduplicator;

impl Deduplicator {
    /// Merges records sharing a fingerprint. The first record seen for a
    /// fingerprint is the base; later ones contribute their source paths, a
    /// strictly longer body, and any field the base is missing.
    pub fn deduplicate(candidates: Vec<EmailRecord>) -> DedupOutcome {
        let mut by_fingerprint: BTreeMap<Fingerprint, EmailRecord> = BTreeMap::new();
        let mut merged = 0;

        for candidate in candidates {
            match by_fingerprint.get_mut(&candidate.fingerprint) {
                Some(existing) => {
                    merged += 1;
                    merge_into(existing, candidate);
                }
                None => {
                    by_fingerprint.insert(candidate.fingerprint.clone(), candidate);
                }
            }
        }

        debug!(
            "Dedup kept {} records, merged {} duplicates",
            by_fingerprint.len(),
            merged
        );

        DedupOutcome {
            records: by_fingerprint.into_values().map(Arc::new).collect(),
            merged,
        }
    }
}

fn merge_into(existing: &mut EmailRecord, other: EmailRecord) {
    existing.source_paths.extend(other.source_paths);

    if other.body.chars().count() > existing.body.chars().count() {
        existing.body = other.body;
    }
    if existing.subject.is_empty() && !other.subject.is_empty() {
        existing.subject = other.subject;
        existing.reply_depth = other.reply_depth;
        existing.is_forward = other.is_forward;
    }
    if existing.sender_name.is_none() {
        existing.sender_name = other.sender_name;
    }
    if existing.disclaimer.is_none() {
        existing.disclaimer = other.disclaimer;
    }
    if existing.guid.is_none() {
        existing.guid = other.guid;
    }
    if existing.importance.is_none() {
        existing.importance = other.importance;
    }
    for cc in other.cc {
        if !existing.cc.iter().any(|c| c.eq_ignore_ascii_case(&cc)) {
            existing.cc.push(cc);
        }
    }

    let flags = &mut existing.flags;
    flags.associate_sender |= other.flags.associate_sender;
    flags.associate_recipient |= other.flags.associate_recipient;
    flags.irrelevant |= other.flags.irrelevant;
    flags.associates.extend(other.flags.associates);
    flags.associates.sort();
    flags.associates.dedup();
}
