use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Write};

use crate::config::PipelineConfig;
use crate::email::{Conversation, RecordOrigin};
use crate::format::DocumentFormat;

/// Identity and how many records it appears on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCount {
    pub identity: String,
    pub records: usize,
}

/// Archive-level numbers computed from the final conversations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStatistics {
    pub records: usize,
    pub conversations: usize,
    pub singleton_conversations: usize,
    pub largest_conversation: usize,
    pub records_per_format: BTreeMap<DocumentFormat, usize>,
    pub quoted_records: usize,
    /// Records assembled from more than one source document.
    pub merged_records: usize,
    pub unparsed_timestamps: usize,
    pub unique_senders: usize,
    pub unique_recipients: usize,
    pub top_senders: Vec<IdentityCount>,
    pub top_recipients: Vec<IdentityCount>,
    pub earliest: Option<NaiveDateTime>,
    pub latest: Option<NaiveDateTime>,
    pub principal_records: usize,
    pub associate_records: usize,
    /// Records flagged as bulk mail.
    pub irrelevant_records: usize,
}

impl ArchiveStatistics {
    pub fn from_conversations(
        conversations: &[Conversation],
        config: &PipelineConfig,
        top: usize,
    ) -> Self {
        let mut stats = ArchiveStatistics {
            conversations: conversations.len(),
            ..Default::default()
        };
        let mut senders: HashMap<String, usize> = HashMap::new();
        let mut recipients: HashMap<String, usize> = HashMap::new();

        for conversation in conversations {
            stats.largest_conversation = stats.largest_conversation.max(conversation.len());
            if conversation.len() == 1 {
                stats.singleton_conversations += 1;
            }

            for message in &conversation.messages {
                stats.records += 1;
                *stats.records_per_format.entry(message.format).or_default() += 1;
                if message.origin == RecordOrigin::Quoted {
                    stats.quoted_records += 1;
                }
                if message.source_paths.len() > 1 {
                    stats.merged_records += 1;
                }

                match message.timestamp.parsed() {
                    Some(value) => {
                        stats.earliest = Some(stats.earliest.map_or(value, |e| e.min(value)));
                        stats.latest = Some(stats.latest.map_or(value, |l| l.max(value)));
                    }
                    None => stats.unparsed_timestamps += 1,
                }

                *senders.entry(message.sender.to_lowercase()).or_default() += 1;
                let distinct: BTreeSet<String> =
                    message.recipients.iter().map(|r| r.to_lowercase()).collect();
                for recipient in distinct {
                    *recipients.entry(recipient).or_default() += 1;
                }

                if message.participants().iter().any(|p| config.is_principal(p)) {
                    stats.principal_records += 1;
                }
                if !message.flags.associates.is_empty() {
                    stats.associate_records += 1;
                }
                if message.flags.irrelevant {
                    stats.irrelevant_records += 1;
                }
            }
        }

        stats.unique_senders = senders.len();
        stats.unique_recipients = recipients.len();
        stats.top_senders = ranked(senders, top);
        stats.top_recipients = ranked(recipients, top);
        stats
    }

    /// Human-readable report. Callers pick the stream so the JSON export
    /// on stdout stays parseable.
    pub fn write_summary(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "📊 Archive Statistics")?;
        writeln!(out, "═══════════════════════════════════════")?;
        writeln!(out)?;
        writeln!(out, "📈 Records: {}", self.records)?;
        for (format, count) in &self.records_per_format {
            writeln!(out, "  ├─ {:?}: {}", format, count)?;
        }
        writeln!(out, "  ├─ From quoted headers: {}", self.quoted_records)?;
        writeln!(out, "  ├─ Merged from several files: {}", self.merged_records)?;
        writeln!(out, "  └─ Unparsed timestamps: {}", self.unparsed_timestamps)?;
        writeln!(out)?;
        writeln!(
            out,
            "🧵 Conversations: {} ({} singletons, largest {})",
            self.conversations, self.singleton_conversations, self.largest_conversation
        )?;
        match (self.earliest, self.latest) {
            (Some(earliest), Some(latest)) => writeln!(
                out,
                "📅 Date range: {} to {}",
                earliest.format("%Y-%m-%d"),
                latest.format("%Y-%m-%d")
            )?,
            _ => writeln!(out, "📅 Date range: unknown")?,
        }
        writeln!(out, "⭐ Records involving a principal: {}", self.principal_records)?;
        writeln!(out, "🔗 Records involving an associate: {}", self.associate_records)?;
        writeln!(out, "🗑️  Bulk mail records: {}", self.irrelevant_records)?;
        writeln!(out)?;

        write_ranking(out, "Top senders", self.unique_senders, &self.top_senders)?;
        write_ranking(out, "Top recipients", self.unique_recipients, &self.top_recipients)
    }
}

fn write_ranking(
    out: &mut dyn Write,
    title: &str,
    unique: usize,
    ranking: &[IdentityCount],
) -> io::Result<()> {
    if ranking.is_empty() {
        return Ok(());
    }
    writeln!(out, "👥 {} ({} unique):", title, unique)?;
    writeln!(out, "┌──────────────────────────────────────────────┬─────────┐")?;
    for entry in ranking {
        writeln!(
            out,
            "│ {:<44} │ {:>7} │",
            truncate_string(&entry.identity, 44),
            entry.records
        )?;
    }
    writeln!(out, "└──────────────────────────────────────────────┴─────────┘")?;
    writeln!(out)
}

/// Highest count first; equal counts in name order.
fn ranked(counts: HashMap<String, usize>, top: usize) -> Vec<IdentityCount> {
    let mut entries: Vec<IdentityCount> = counts
        .into_iter()
        .map(|(identity, records)| IdentityCount { identity, records })
        .collect();
    entries.sort_by(|a, b| {
        b.records
            .cmp(&a.records)
            .then_with(|| a.identity.cmp(&b.identity))
    });
    entries.truncate(top);
    entries
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
