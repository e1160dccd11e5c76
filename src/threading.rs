use chrono::Duration;
use log::debug;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crate::config::{PipelineConfig, MAX_PROXIMITY_WINDOW_HOURS};
use crate::email::{Conversation, EmailRecord};
use crate::subject::normalize_subject;

/// Groups deduplicated records into conversations.
///
/// Two records are linked when they share a normalized subject or a
/// non-principal participant, and their timestamps are within the proximity
/// window. Records with unparsed timestamps link
/// on subject or participants alone. Conversations are the connected
/// components of that relation.
pub struct Threader {
    window: Duration,
    ignore_principals: bool,
    participants_require_subject: bool,
    principals: HashSet<String>,
}

impl Threader {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            window: Duration::hours(
                config
                    .threading
                    .proximity_window_hours
                    .clamp(0, MAX_PROXIMITY_WINDOW_HOURS),
            ),
            ignore_principals: config.threading.ignore_principals_in_overlap,
            participants_require_subject: config.threading.participants_require_subject,
            principals: config
                .extraction
                .principal_addresses
                .iter()
                .map(|p| p.trim().to_lowercase())
                .collect(),
        }
    }

    /// Every input record ends up in exactly one conversation. The result
    /// does not depend on input order.
    pub fn thread(&self, records: &[Arc<EmailRecord>]) -> Vec<Conversation> {
        let mut sorted: Vec<Arc<EmailRecord>> = records.to_vec();
        sorted.sort_by(|a, b| a.chronological_key().cmp(&b.chronological_key()));

        let subjects: Vec<String> = sorted.iter().map(|r| normalize_subject(&r.subject)).collect();
        let mut groups = DisjointSet::new(sorted.len());

        self.link_by_subject(&sorted, &subjects, &mut groups);
        self.link_by_participants(&sorted, &subjects, &mut groups);

        let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..sorted.len() {
            members.entry(groups.find(i)).or_default().push(i);
        }

        // Roots are the smallest member index and members were pushed in
        // sorted order, so iteration is already by first message.
        let conversations: Vec<Conversation> = members
            .into_values()
            .map(|indices| self.build_conversation(&sorted, &subjects, &indices))
            .collect();

        debug!(
            "Threaded {} records into {} conversations",
            sorted.len(),
            conversations.len()
        );
        conversations
    }

    fn link_by_subject(
        &self,
        sorted: &[Arc<EmailRecord>],
        subjects: &[String],
        groups: &mut DisjointSet,
    ) {
        let mut buckets: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, subject) in subjects.iter().enumerate() {
            if !subject.is_empty() {
                buckets.entry(subject.as_str()).or_default().push(i);
            }
        }

        for bucket in buckets.values() {
            let first = bucket[0];
            let mut previous: Option<usize> = None;
            for &i in bucket {
                if sorted[i].timestamp.is_unparsed() {
                    groups.union(first, i);
                    continue;
                }
                if let Some(p) = previous {
                    if self.within_window(&sorted[p], &sorted[i]) {
                        groups.union(p, i);
                    }
                }
                previous = Some(i);
            }
        }
    }

    fn link_by_participants(
        &self,
        sorted: &[Arc<EmailRecord>],
        subjects: &[String],
        groups: &mut DisjointSet,
    ) {
        let mut buckets: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, record) in sorted.iter().enumerate() {
            for participant in record.participants() {
                let key = participant.to_lowercase();
                if self.ignore_principals && self.principals.contains(&key) {
                    continue;
                }
                buckets.entry(key).or_default().push(i);
            }
        }

        for bucket in buckets.values() {
            for (n, &i) in bucket.iter().enumerate() {
                let earlier = &bucket[..n];
                let target = if sorted[i].timestamp.is_unparsed() {
                    earlier
                        .iter()
                        .copied()
                        .find(|&j| self.subjects_compatible(&subjects[i], &subjects[j]))
                } else {
                    // Most recent compatible record still inside the window.
                    earlier
                        .iter()
                        .rev()
                        .copied()
                        .filter(|&j| !sorted[j].timestamp.is_unparsed())
                        .take_while(|&j| self.within_window(&sorted[j], &sorted[i]))
                        .find(|&j| self.subjects_compatible(&subjects[i], &subjects[j]))
                };
                if let Some(j) = target {
                    groups.union(j, i);
                }
            }
        }
    }

    fn subjects_compatible(&self, a: &str, b: &str) -> bool {
        !self.participants_require_subject || a.is_empty() || b.is_empty() || a == b
    }

    fn within_window(&self, earlier: &EmailRecord, later: &EmailRecord) -> bool {
        match (earlier.timestamp.parsed(), later.timestamp.parsed()) {
            (Some(a), Some(b)) => b - a <= self.window,
            _ => true,
        }
    }

    fn build_conversation(
        &self,
        sorted: &[Arc<EmailRecord>],
        subjects: &[String],
        indices: &[usize],
    ) -> Conversation {
        let messages: Vec<Arc<EmailRecord>> =
            indices.iter().map(|&i| Arc::clone(&sorted[i])).collect();

        let mut seen = HashSet::new();
        let mut participants = BTreeSet::new();
        for message in &messages {
            for participant in message.participants() {
                if seen.insert(participant.to_lowercase()) {
                    participants.insert(participant.to_string());
                }
            }
        }

        let subject = messages
            .iter()
            .map(|m| m.subject.trim())
            .find(|s| !s.is_empty())
            .unwrap_or_default()
            .to_string();
        let normalized = indices
            .iter()
            .map(|&i| subjects[i].as_str())
            .find(|s| !s.is_empty())
            .unwrap_or_default();

        let parsed: Vec<_> = messages.iter().filter_map(|m| m.timestamp.parsed()).collect();
        let involves_principal = seen.iter().any(|p| self.principals.contains(p));

        let thread_key = thread_key(normalized, &seen, &messages[0]);

        Conversation {
            thread_key,
            subject,
            first_timestamp: parsed.iter().min().copied(),
            last_timestamp: parsed.iter().max().copied(),
            messages,
            participants,
            involves_principal,
        }
    }
}

/// SHA-256 over the normalized subject, sorted lowercase participants and
/// the first message's fingerprint.
fn thread_key(
    normalized_subject: &str,
    participants: &HashSet<String>,
    first: &EmailRecord,
) -> String {
    let mut sorted: Vec<&str> = participants.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(normalized_subject.as_bytes());
    hasher.update(b"|");
    hasher.update(sorted.join(",").as_bytes());
    hasher.update(b"|");
    hasher.update(first.fingerprint.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Conversations in which `identity` took part, compared case-insensitively.
pub fn conversations_with_participant<'a>(
    conversations: &'a [Conversation],
    identity: &str,
) -> Vec<&'a Conversation> {
    conversations
        .iter()
        .filter(|c| c.has_participant(identity))
        .collect()
}

pub fn principal_conversations(conversations: &[Conversation]) -> Vec<&Conversation> {
    conversations.iter().filter(|c| c.involves_principal).collect()
}

/// Union-find over record indices. The smaller index always becomes the
/// root, so a component's root is its earliest record.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = i;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::Fingerprinter;
    use crate::email::fixtures::{at, record};
    use crate::timestamp::Timestamp;

    fn shared(mut r: EmailRecord) -> Arc<EmailRecord> {
        r.fingerprint = Fingerprinter::new(200).fingerprint(&r);
        Arc::new(r)
    }

    fn threader() -> Threader {
        Threader::new(&PipelineConfig::default())
    }

    fn sizes(conversations: &[Conversation]) -> Vec<usize> {
        conversations.iter().map(Conversation::len).collect()
    }

    #[test]
    fn test_reply_chain_threads_in_order() {
        let records = vec![
            shared(record("b@x.com", &["a@x.com"], at(2, 9), "Re: Hi")),
            shared(record("a@x.com", &["b@x.com"], at(1, 9), "Hi")),
            shared(record("a@x.com", &["b@x.com"], at(1, 12), "RE: Hi")),
        ];
        let conversations = threader().thread(&records);
        assert_eq!(sizes(&conversations), vec![3]);
        let subjects: Vec<&str> = conversations[0].messages.iter().map(|m| m.subject.as_str()).collect();
        assert_eq!(subjects, vec!["Hi", "RE: Hi", "Re: Hi"]);
        assert_eq!(conversations[0].subject, "Hi");
        assert_eq!(conversations[0].participants.len(), 2);
    }

    #[test]
    fn test_same_subject_outside_window_splits() {
        let records = vec![
            shared(record("a@x.com", &["b@x.com"], at(1, 9), "Lunch")),
            shared(record("c@x.com", &["d@x.com"], at(20, 9), "Lunch")),
        ];
        assert_eq!(sizes(&threader().thread(&records)), vec![1, 1]);
    }

    #[test]
    fn test_unparsed_joins_subject_thread_at_end() {
        let mut garbled = record("b@x.com", &["a@x.com"], at(1, 9), "Re: Hi");
        garbled.timestamp = Timestamp::Unparsed {
            raw: "Jnu ?? 2O1?".to_string(),
        };
        let records = vec![
            shared(garbled),
            shared(record("a@x.com", &["b@x.com"], at(1, 9), "Hi")),
            shared(record("b@x.com", &["a@x.com"], at(1, 10), "Re: Hi")),
        ];
        let conversations = threader().thread(&records);
        assert_eq!(sizes(&conversations), vec![3]);
        let last = conversations[0].messages.last().unwrap();
        assert!(last.timestamp.is_unparsed());
        assert_eq!(conversations[0].last_timestamp, at(1, 10).parsed());
    }

    #[test]
    fn test_empty_subject_links_by_participant() {
        let records = vec![
            shared(record("a@x.com", &["b@x.com"], at(1, 9), "")),
            shared(record("b@x.com", &["a@x.com"], at(1, 10), "")),
            shared(record("c@x.com", &["d@x.com"], at(1, 11), "")),
        ];
        assert_eq!(sizes(&threader().thread(&records)), vec![2, 1]);
    }

    #[test]
    fn test_principal_overlap_alone_does_not_link() {
        let records = vec![
            shared(record("a@x.com", &["jeevacation@gmail.com"], at(1, 9), "")),
            shared(record("c@x.com", &["jeevacation@gmail.com"], at(1, 10), "")),
        ];
        let conversations = threader().thread(&records);
        assert_eq!(sizes(&conversations), vec![1, 1]);
        assert!(conversations.iter().all(|c| c.involves_principal));

        let mut config = PipelineConfig::default();
        config.threading.ignore_principals_in_overlap = false;
        assert_eq!(sizes(&Threader::new(&config).thread(&records)), vec![2]);
    }

    #[test]
    fn test_different_subjects_link_through_participants() {
        let records = vec![
            shared(record("a@x.com", &["b@x.com"], at(1, 9), "Budget")),
            shared(record("b@x.com", &["a@x.com"], at(1, 10), "Party")),
        ];
        let conversations = threader().thread(&records);
        assert_eq!(sizes(&conversations), vec![2]);
        assert_eq!(conversations[0].subject, "Budget");

        let mut config = PipelineConfig::default();
        config.threading.participants_require_subject = true;
        assert_eq!(sizes(&Threader::new(&config).thread(&records)), vec![1, 1]);
    }

    #[test]
    fn test_shared_participant_outside_window_splits() {
        let records = vec![
            shared(record("a@x.com", &["b@x.com"], at(1, 9), "Budget")),
            shared(record("b@x.com", &["a@x.com"], at(20, 9), "Party")),
        ];
        assert_eq!(sizes(&threader().thread(&records)), vec![1, 1]);
    }

    #[test]
    fn test_unvalidated_huge_window_does_not_panic() {
        let mut config = PipelineConfig::default();
        config.threading.proximity_window_hours = i64::MAX;
        let records = vec![
            shared(record("a@x.com", &["b@x.com"], at(1, 9), "Hi")),
            shared(record("c@x.com", &["d@x.com"], at(30, 9), "Hi")),
        ];
        assert_eq!(sizes(&Threader::new(&config).thread(&records)), vec![2]);
    }

    #[test]
    fn test_order_independent_and_stable_keys() {
        let mut records = vec![
            shared(record("a@x.com", &["b@x.com"], at(1, 9), "Hi")),
            shared(record("b@x.com", &["a@x.com"], at(1, 12), "RE: Hi")),
            shared(record("c@x.com", &["d@x.com"], at(3, 9), "Other")),
        ];
        let first = threader().thread(&records);
        records.reverse();
        let second = threader().thread(&records);
        assert_eq!(first, second);
        assert_eq!(first[0].thread_key.len(), 64);
        assert_ne!(first[0].thread_key, first[1].thread_key);
    }

    #[test]
    fn test_queries() {
        let records = vec![
            shared(record("a@x.com", &["jeeitunes@gmail.com"], at(1, 9), "One")),
            shared(record("c@x.com", &["d@x.com"], at(2, 9), "Two")),
        ];
        let conversations = threader().thread(&records);
        assert_eq!(conversations_with_participant(&conversations, "D@X.COM").len(), 1);
        assert_eq!(principal_conversations(&conversations).len(), 1);
        assert_eq!(principal_conversations(&conversations)[0].subject, "One");
    }

    #[test]
    fn test_empty_input() {
        assert!(threader().thread(&[]).is_empty());
    }
}
