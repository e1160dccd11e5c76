use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use std::collections::BTreeSet;

use crate::address::{is_redacted, PartyParser};
use crate::body::BodyCleaner;
use crate::config::PipelineConfig;
use crate::dedup::Fingerprinter;
use crate::email::{EmailRecord, Fingerprint, RecordFlags, RecordOrigin};
use crate::error::ExtractionFailure;
use crate::format::{
    message_blocks, scan_header_at, Detection, DocumentFormat, HeaderLabel, HeaderScan,
    MessageBlock,
};
use crate::subject::SubjectInfo;
use crate::timestamp::TimestampParser;

lazy_static! {
    static ref FORWARD_MARKER: Regex = Regex::new(
        r"(?im)^[ \t>]*(?:-+\s*Forwarded message\s*-+|Begin forwarded message:|-+\s*Original Message\s*-+)"
    )
    .unwrap();
    static ref BODY_TO_LINE: Regex = Regex::new(r"(?m)^[ \t>]*To[ \t]*:[ \t]*(.+)$").unwrap();
    static ref WROTE_LINE: Regex =
        Regex::new(r"(?m)^[ \t>]*On\b[^\n]{0,200}?<([^<>\s]+@[^<>\s]+)>\s*wrote:").unwrap();
    static ref QUOTED_FROM_LINE: Regex =
        Regex::new(r"(?m)^[ \t>]*From[ \t]*:[ \t]*(.+)$").unwrap();
    static ref QUOTED_HEADER_START: Regex = Regex::new(r"(?m)^[ \t]*From[ \t]*:").unwrap();
    static ref TIME_LIKE_SENDER: Regex =
        Regex::new(r"^\d{1,2}[:/]\d{1,2}(?:[:/]\d{2,4})?(?:\s*[AaPp][Mm])?$").unwrap();
    static ref PHONE_LIKE_SENDER: Regex = Regex::new(r"^(?:e:)?\+?[\d\s().\-]{7,}$").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref CHAT_TIMESTAMP: Regex =
        Regex::new(r"^\d{1,2}/\d{1,2}/\d{4}\s+\d{1,2}:\d{2}:\d{2}\s*[AaPp][Mm]$").unwrap();
    static ref NUMERIC_NOISE: Regex = Regex::new(r"^[\d()\s\-]+$").unwrap();
}

/// How far into a body recipient recovery looks for forward markers and
/// forwarded `To:` lines, in characters.
const FORWARD_MARKER_WINDOW: usize = 500;
const FORWARD_TO_WINDOW: usize = 1000;

/// Turns a detected document into email records.
pub struct FieldExtractor {
    parties: PartyParser,
    timestamps: TimestampParser,
    bodies: BodyCleaner,
    fingerprinter: Fingerprinter,
    principals: Vec<String>,
    split_message_blocks: bool,
    extract_quoted: bool,
}

/// One line-anchored message of a chat transcript.
struct ChatMessage {
    sender: String,
    sender_name: Option<String>,
    time: String,
    text: String,
}

impl FieldExtractor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            parties: PartyParser::new(config),
            timestamps: TimestampParser::new(config.extraction.date_formats.clone()),
            bodies: BodyCleaner::new(config),
            fingerprinter: Fingerprinter::new(config.dedup.fingerprint_prefix_len),
            principals: config
                .extraction
                .principal_addresses
                .iter()
                .map(|p| p.trim().to_lowercase())
                .collect(),
            split_message_blocks: config.extraction.split_message_blocks,
            extract_quoted: config.extraction.extract_quoted,
        }
    }

    /// Reads the records of one normalized document. With default settings a
    /// document yields at most one record; the first is always the
    /// document's own message.
    pub fn extract(
        &self,
        detection: &Detection,
        text: &str,
        source_path: &str,
    ) -> Result<Vec<EmailRecord>, ExtractionFailure> {
        match (detection.format, detection.header) {
            (DocumentFormat::Traditional, Some(header)) => {
                self.extract_traditional(text, header.start, source_path)
            }
            (DocumentFormat::MessageGuid, _) => self.extract_message_blocks(text, source_path),
            (DocumentFormat::GroupChat, Some(header)) => {
                self.extract_group_chat(text, header.start, source_path)
            }
            _ => Ok(Vec::new()),
        }
    }

    fn extract_traditional(
        &self,
        text: &str,
        header_start: usize,
        source_path: &str,
    ) -> Result<Vec<EmailRecord>, ExtractionFailure> {
        let scan = scan_header_at(text, header_start).ok_or(ExtractionFailure::MissingSender)?;
        let prepared = self.bodies.prepare(&text[scan.block.end..]);

        let record = self.record_from_header(&scan, &prepared, RecordOrigin::Document, source_path)?;
        let mut records = vec![record];

        if self.extract_quoted {
            records.extend(self.quoted_records(&prepared, source_path));
        }
        Ok(records)
    }

    /// Formal quoted headers inside a prepared body. Each quoted message's
    /// body runs to the next quoted header.
    fn quoted_records(&self, prepared: &str, source_path: &str) -> Vec<EmailRecord> {
        let mut scans: Vec<HeaderScan> = Vec::new();
        for found in QUOTED_HEADER_START.find_iter(prepared) {
            if scans.last().map_or(false, |s| found.start() < s.block.end) {
                continue;
            }
            let Some(scan) = scan_header_at(prepared, found.start()) else {
                continue;
            };
            let has_date = scan.has(HeaderLabel::Sent) || scan.has(HeaderLabel::Date);
            if scan.has(HeaderLabel::From) && has_date {
                scans.push(scan);
            }
        }

        let mut records = Vec::new();
        for (i, scan) in scans.iter().enumerate() {
            let end = scans
                .get(i + 1)
                .map_or(prepared.len(), |next| next.block.start);
            let body = prepared[scan.block.end..end].trim();
            match self.record_from_header(scan, body, RecordOrigin::Quoted, source_path) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    debug!("Skipping quoted message in {}: {}", source_path, reason);
                }
            }
        }
        records
    }

    fn record_from_header(
        &self,
        scan: &HeaderScan,
        prepared_body: &str,
        origin: RecordOrigin,
        source_path: &str,
    ) -> Result<EmailRecord, ExtractionFailure> {
        let party = scan
            .field(HeaderLabel::From)
            .and_then(|value| self.parties.parse_party(value))
            .ok_or(ExtractionFailure::MissingSender)?;
        let sender = party.identity().ok_or(ExtractionFailure::MissingSender)?;
        let sender_name = party.name.filter(|name| Some(name) != party.address.as_ref());

        let raw_time = scan
            .field(HeaderLabel::Sent)
            .or_else(|| scan.field(HeaderLabel::Date))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(ExtractionFailure::MissingTimestamp)?;
        let timestamp = self.timestamps.parse(raw_time);

        let recipients = match scan.field(HeaderLabel::To) {
            Some(value) if !is_redacted(value) => {
                let recipients = self.parties.split_recipients(value);
                if recipients.is_empty() {
                    return Err(ExtractionFailure::AmbiguousRecipients);
                }
                recipients
            }
            _ => self.recover_recipients(prepared_body, &sender),
        };

        let cc = scan
            .field(HeaderLabel::Cc)
            .filter(|value| !is_redacted(value))
            .map(|value| self.parties.split_recipients(value))
            .unwrap_or_default();

        let subject = scan
            .field(HeaderLabel::Subject)
            .map(|s| WHITESPACE.replace_all(s.trim(), " ").into_owned())
            .unwrap_or_default();
        let info = SubjectInfo::analyze(&subject);

        let importance = scan
            .field(HeaderLabel::Importance)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let body = self.bodies.finish(prepared_body);

        Ok(self.finalize(EmailRecord {
            sender,
            sender_name,
            recipients,
            cc,
            timestamp,
            subject,
            reply_depth: info.reply_depth,
            is_forward: info.is_forward,
            body: body.text,
            disclaimer: body.disclaimer,
            format: DocumentFormat::Traditional,
            guid: None,
            importance,
            origin,
            flags: RecordFlags::default(),
            source_paths: BTreeSet::from([source_path.to_string()]),
            fingerprint: Fingerprint::default(),
        }))
    }

    /// Recipient of a header without a usable `To:`, read from the body:
    /// a forwarded `To:` line, the address in an `On ... wrote:` line, or a
    /// quoted `From:` address, in that order. Addresses equal to the sender
    /// are passed over.
    pub fn recover_recipients(&self, prepared_body: &str, sender: &str) -> Vec<String> {
        if FORWARD_MARKER.is_match(head(prepared_body, FORWARD_MARKER_WINDOW)) {
            let window = head(prepared_body, FORWARD_TO_WINDOW);
            if let Some(caps) = BODY_TO_LINE.captures(window) {
                let recipients = self.parties.split_recipients(&caps[1]);
                if !recipients.is_empty() {
                    debug!("Recovered recipients from forwarded header");
                    return recipients;
                }
            }
        }

        let not_sender = |address: &String| !address.eq_ignore_ascii_case(sender);

        let wrote = WROTE_LINE
            .captures_iter(prepared_body)
            .map(|caps| self.parties.canonical_address(&caps[1]))
            .find(not_sender);
        if let Some(address) = wrote {
            return vec![address];
        }

        let quoted = QUOTED_FROM_LINE
            .captures_iter(prepared_body)
            .filter_map(|caps| self.parties.parse_party(&caps[1]))
            .filter_map(|party| party.address)
            .find(not_sender);
        quoted.into_iter().collect()
    }

    fn extract_message_blocks(
        &self,
        text: &str,
        source_path: &str,
    ) -> Result<Vec<EmailRecord>, ExtractionFailure> {
        let blocks = message_blocks(text);
        if blocks.is_empty() {
            return Err(ExtractionFailure::MissingGuid);
        }

        if !self.split_message_blocks {
            if blocks.len() > 1 {
                debug!(
                    "{}: reading the first of {} message blocks, {} dropped",
                    source_path,
                    blocks.len(),
                    blocks.len() - 1
                );
            }
            return self
                .record_from_block(&blocks[0], source_path)
                .map(|record| vec![record]);
        }

        let mut records = Vec::new();
        let mut first_failure = None;
        for (i, block) in blocks.iter().enumerate() {
            match self.record_from_block(block, source_path) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    warn!("Message block {} of {} skipped: {}", i + 1, source_path, reason);
                    first_failure.get_or_insert(reason);
                }
            }
        }

        match (records.is_empty(), first_failure) {
            (true, Some(reason)) => Err(reason),
            _ => Ok(records),
        }
    }

    fn record_from_block(
        &self,
        block: &MessageBlock,
        source_path: &str,
    ) -> Result<EmailRecord, ExtractionFailure> {
        let guid = block.guid.clone().ok_or(ExtractionFailure::MissingGuid)?;

        let raw_sender = block
            .sender
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ExtractionFailure::MissingSender)?;
        if TIME_LIKE_SENDER.is_match(raw_sender) || PHONE_LIKE_SENDER.is_match(raw_sender) {
            return Err(ExtractionFailure::MissingSender);
        }
        let party = self
            .parties
            .parse_party(raw_sender)
            .ok_or(ExtractionFailure::MissingSender)?;
        let sender = party.identity().ok_or(ExtractionFailure::MissingSender)?;

        let raw_time = block
            .time
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ExtractionFailure::MissingTimestamp)?;
        let timestamp = self.timestamps.parse(raw_time);

        let message = block
            .message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or(ExtractionFailure::EmptyMessage)?;

        let (recipients, message) = match self.explicit_recipients(message) {
            Some(found) => found,
            None => (self.implicit_recipients(&sender), message.to_string()),
        };

        let body = self.bodies.process(&message);

        Ok(self.finalize(EmailRecord {
            sender,
            sender_name: party.name,
            recipients,
            cc: Vec::new(),
            timestamp,
            subject: String::new(),
            reply_depth: 0,
            is_forward: false,
            body: body.text,
            disclaimer: body.disclaimer,
            format: DocumentFormat::MessageGuid,
            guid: Some(guid),
            importance: None,
            origin: RecordOrigin::Document,
            flags: RecordFlags::default(),
            source_paths: BTreeSet::from([source_path.to_string()]),
            fingerprint: Fingerprint::default(),
        }))
    }

    /// A `From: multiple senders` transcript. Each message is a speaker
    /// line, a timestamp line, then text up to the next speaker. Every
    /// message is addressed to the other speakers of the transcript.
    fn extract_group_chat(
        &self,
        text: &str,
        header_start: usize,
        source_path: &str,
    ) -> Result<Vec<EmailRecord>, ExtractionFailure> {
        let scan = scan_header_at(text, header_start).ok_or(ExtractionFailure::MissingSender)?;
        let subject = scan
            .field(HeaderLabel::Subject)
            .map(|s| WHITESPACE.replace_all(s.trim(), " ").into_owned())
            .unwrap_or_default();
        let info = SubjectInfo::analyze(&subject);

        let messages = self.chat_messages(&text[scan.block.end..], source_path);
        if messages.is_empty() {
            return Err(ExtractionFailure::EmptyMessage);
        }

        let mut speakers: Vec<&str> = Vec::new();
        for message in &messages {
            if !speakers.iter().any(|s| s.eq_ignore_ascii_case(&message.sender)) {
                speakers.push(&message.sender);
            }
        }

        let records = messages
            .iter()
            .map(|message| {
                let recipients = speakers
                    .iter()
                    .filter(|s| !s.eq_ignore_ascii_case(&message.sender))
                    .map(|s| s.to_string())
                    .collect();
                let body = self.bodies.finish(&message.text);
                self.finalize(EmailRecord {
                    sender: message.sender.clone(),
                    sender_name: message.sender_name.clone(),
                    recipients,
                    cc: Vec::new(),
                    timestamp: self.timestamps.parse(&message.time),
                    subject: subject.clone(),
                    reply_depth: info.reply_depth,
                    is_forward: info.is_forward,
                    body: body.text,
                    disclaimer: body.disclaimer,
                    format: DocumentFormat::GroupChat,
                    guid: None,
                    importance: None,
                    origin: RecordOrigin::Document,
                    flags: RecordFlags::default(),
                    source_paths: BTreeSet::from([source_path.to_string()]),
                    fingerprint: Fingerprint::default(),
                })
            })
            .collect();
        Ok(records)
    }

    fn chat_messages(&self, transcript: &str, source_path: &str) -> Vec<ChatMessage> {
        let cleaned = self.bodies.clean(transcript);
        let lines: Vec<&str> = cleaned
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !self.bodies.is_page_marker(line))
            .collect();
        let anchors: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| CHAT_TIMESTAMP.is_match(line))
            .map(|(i, _)| i)
            .collect();

        let mut messages = Vec::new();
        for (n, &anchor) in anchors.iter().enumerate() {
            let Some(speaker) = anchor.checked_sub(1).map(|i| lines[i]) else {
                continue;
            };
            if !is_chat_speaker(speaker) {
                debug!("{}: skipping chat line with speaker {:?}", source_path, speaker);
                continue;
            }
            // The next message's speaker line is not part of this one.
            let stop = anchors.get(n + 1).map_or(lines.len(), |&next| next - 1);
            let text = lines
                .get(anchor + 1..stop)
                .map(|span| span.join(" "))
                .unwrap_or_default();
            if text.is_empty() {
                continue;
            }
            let Some(party) = self.parties.parse_party(speaker) else {
                continue;
            };
            let Some(sender) = party.identity() else {
                continue;
            };
            messages.push(ChatMessage {
                sender_name: party.name.filter(|name| Some(name) != party.address.as_ref()),
                sender,
                time: lines[anchor].to_string(),
                text,
            });
        }
        messages
    }

    /// A `To:` line among the first three lines of a message. Returns the
    /// recipients and the message without that line.
    fn explicit_recipients(&self, message: &str) -> Option<(Vec<String>, String)> {
        let lines: Vec<&str> = message.lines().collect();
        let index = lines
            .iter()
            .take(3)
            .position(|line| BODY_TO_LINE.is_match(line))?;
        let caps = BODY_TO_LINE.captures(lines[index])?;
        let recipients = self.parties.split_recipients(&caps[1]);
        if recipients.is_empty() {
            return None;
        }

        let rest: Vec<&str> = lines
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, line)| *line)
            .collect();
        Some((recipients, rest.join("\n").trim().to_string()))
    }

    /// Message-store exports are the principals' own mailboxes: a message
    /// from anyone else was sent to them.
    fn implicit_recipients(&self, sender: &str) -> Vec<String> {
        let sender_is_principal = self.principals.iter().any(|p| p.eq_ignore_ascii_case(sender));
        if sender_is_principal {
            Vec::new()
        } else {
            self.principals.clone()
        }
    }

    fn finalize(&self, mut record: EmailRecord) -> EmailRecord {
        record.fingerprint = self.fingerprinter.fingerprint(&record);
        record
    }
}

/// Rejects speaker lines that are really phone numbers, stray timestamps or
/// numeric noise.
fn is_chat_speaker(line: &str) -> bool {
    line.chars().count() >= 2
        && line.chars().any(char::is_alphanumeric)
        && !line.starts_with("Time:")
        && !CHAT_TIMESTAMP.is_match(line)
        && !TIME_LIKE_SENDER.is_match(line)
        && !PHONE_LIKE_SENDER.is_match(line)
        && !NUMERIC_NOISE.is_match(line)
}

/// The first `max` characters of `text`.
fn head(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}
