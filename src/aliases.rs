use log::debug;
use std::collections::{BTreeMap, HashSet};

use crate::config::PipelineConfig;
use crate::dedup::Fingerprinter;
use crate::email::EmailRecord;

/// Maps display names to addresses so that a name-only header and an
/// addressed header for the same person fingerprint alike.
pub struct AliasResolver {
    aliases: BTreeMap<String, String>,
    fingerprinter: Fingerprinter,
}

impl AliasResolver {
    pub fn new(config: &PipelineConfig) -> Self {
        let aliases = config
            .extraction
            .sender_aliases
            .iter()
            .map(|(name, address)| (alias_key(name), address.trim().to_lowercase()))
            .collect();
        Self {
            aliases,
            fingerprinter: Fingerprinter::new(config.dedup.fingerprint_prefix_len),
        }
    }

    /// Learns `name -> address` from senders that carried both. The most
    /// frequent address wins; ties go to the lexicographically smallest.
    /// Configured aliases are never overridden.
    pub fn learn(&mut self, records: &[EmailRecord]) {
        let mut seen: BTreeMap<String, BTreeMap<&str, usize>> = BTreeMap::new();
        for record in records {
            let Some(name) = record.sender_name.as_deref() else {
                continue;
            };
            if !record.sender.contains('@') {
                continue;
            }
            *seen
                .entry(alias_key(name))
                .or_default()
                .entry(record.sender.as_str())
                .or_default() += 1;
        }

        for (name, counts) in seen {
            if self.aliases.contains_key(&name) {
                continue;
            }
            // Equal counts compare reversed on address, so the smallest wins.
            let best = counts
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(address, _)| address.to_string());
            if let Some(address) = best {
                debug!("Learned alias {} -> {}", name, address);
                self.aliases.insert(name, address);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Address for a name-only identity. Addresses resolve to nothing.
    pub fn resolve(&self, identity: &str) -> Option<&str> {
        if identity.contains('@') {
            return None;
        }
        let key = alias_key(identity);
        if let Some(address) = self.aliases.get(&key) {
            return Some(address.as_str());
        }
        // "Last, First" as written in recipient lists.
        let (last, first) = key.split_once(", ")?;
        self.aliases
            .get(&format!("{first} {last}"))
            .map(String::as_str)
    }

    /// Returns rewritten copies of the records. Records that changed get a
    /// fresh fingerprint.
    pub fn apply(&self, records: &[EmailRecord]) -> Vec<EmailRecord> {
        records.iter().map(|record| self.rewrite(record)).collect()
    }

    fn rewrite(&self, record: &EmailRecord) -> EmailRecord {
        let mut rewritten = record.clone();
        let mut changed = false;

        if let Some(address) = self.resolve(&record.sender) {
            if rewritten.sender_name.is_none() {
                rewritten.sender_name = Some(record.sender.clone());
            }
            rewritten.sender = address.to_string();
            changed = true;
        }

        let (recipients, recipients_changed) = self.rewrite_list(&record.recipients);
        let (cc, cc_changed) = self.rewrite_list(&record.cc);
        rewritten.recipients = recipients;
        rewritten.cc = cc;

        if changed || recipients_changed || cc_changed {
            rewritten.fingerprint = self.fingerprinter.fingerprint(&rewritten);
            debug!("Resolved aliases in record from {}", rewritten.sender);
        }
        rewritten
    }

    fn rewrite_list(&self, identities: &[String]) -> (Vec<String>, bool) {
        let mut changed = false;
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(identities.len());

        for identity in identities {
            let resolved = match self.resolve(identity) {
                Some(address) => {
                    changed = true;
                    address.to_string()
                }
                None => identity.clone(),
            };
            if seen.insert(resolved.to_lowercase()) {
                out.push(resolved);
            } else {
                changed = true;
            }
        }
        (out, changed)
    }
}

fn alias_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::fixtures::{at, record};

    fn resolver() -> AliasResolver {
        AliasResolver::new(&PipelineConfig::default())
    }

    #[test]
    fn test_configured_alias_resolves_name_only_sender() {
        let original = record("Jeffrey  Epstein", &["a@x.com"], at(1, 9), "Hi");
        let rewritten = resolver().apply(std::slice::from_ref(&original));
        let r = &rewritten[0];
        assert_eq!(r.sender, "jeevacation@gmail.com");
        assert_eq!(r.sender_name.as_deref(), Some("Jeffrey  Epstein"));
        assert_ne!(r.fingerprint, original.fingerprint);
        // Input untouched.
        assert_eq!(original.sender, "Jeffrey  Epstein");
    }

    #[test]
    fn test_learned_alias_most_frequent_then_lexicographic() {
        let named = |sender: &str| {
            let mut r = record(sender, &[], at(1, 9), "x");
            r.sender_name = Some("Lesley Groff".to_string());
            r
        };
        let records = vec![named("lg@b.com"), named("lg@a.com"), named("lg@b.com")];
        let mut aliases = resolver();
        aliases.learn(&records);
        assert_eq!(aliases.resolve("lesley groff"), Some("lg@b.com"));

        let tied = vec![named("lg@b.com"), named("lg@a.com")];
        let mut aliases = resolver();
        aliases.learn(&tied);
        assert_eq!(aliases.resolve("Lesley Groff"), Some("lg@a.com"));
    }

    #[test]
    fn test_configured_alias_not_overridden() {
        let mut r = record("other@x.com", &[], at(1, 9), "x");
        r.sender_name = Some("Jeffrey Epstein".to_string());
        let mut aliases = resolver();
        aliases.learn(&[r]);
        assert_eq!(aliases.resolve("jeffrey epstein"), Some("jeevacation@gmail.com"));
    }

    #[test]
    fn test_recipients_rewritten_and_deduplicated() {
        let r = record(
            "a@x.com",
            &["Epstein, Jeffrey", "jeevacation@gmail.com", "Unknown Person"],
            at(1, 9),
            "Hi",
        );
        let rewritten = resolver().apply(&[r]);
        assert_eq!(
            rewritten[0].recipients,
            vec!["jeevacation@gmail.com", "Unknown Person"]
        );
    }

    #[test]
    fn test_unchanged_record_keeps_fingerprint() {
        let mut r = record("a@x.com", &["b@x.com"], at(1, 9), "Hi");
        r.fingerprint = Fingerprinter::new(200).fingerprint(&r);
        let rewritten = resolver().apply(std::slice::from_ref(&r));
        assert_eq!(rewritten[0], r);
    }
}
