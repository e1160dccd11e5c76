use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::PipelineConfig;

lazy_static! {
    static ref HEADER_LABEL: Regex = Regex::new(
        r"^[ \t]*(From|FROM|Sent|SENT|Date|DATE|To|TO|Cc|CC|Bcc|BCC|Subject|SUBJECT|Importance|Attachments)[ \t]*:(.*)$"
    )
    .unwrap();
    static ref BLOCK_LABEL: Regex =
        Regex::new(r"^[ \t]*(GUID|Message|Sender|Time|Flags)[ \t]*:(.*)$").unwrap();
    static ref MULTIPLE_SENDERS: Regex = Regex::new(r"(?i)\bmultiple\s+senders\b").unwrap();
    static ref GUID_TOKEN: Regex =
        Regex::new(r"\b[0-9A-Fa-f]{8}(?:-?[0-9A-Fa-f]{4}){3}-?[0-9A-Fa-f]{12}\b").unwrap();
}

/// Layout family of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    /// Outlook-style `From:` / `Sent:` / `To:` / `Subject:` header block.
    Traditional,
    /// Message-store export: `GUID:` / `Message:` / `Sender:` / `Time:` blocks.
    MessageGuid,
    /// Chat transcript under a `From: multiple senders` header. Only
    /// reported when group-chat splitting is enabled.
    GroupChat,
    Unparseable,
}

/// Byte range of the structured header inside the normalized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderBlock {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderLabel {
    From,
    Sent,
    Date,
    To,
    Cc,
    Bcc,
    Subject,
    Importance,
    Attachments,
}

impl HeaderLabel {
    fn parse(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "from" => Some(HeaderLabel::From),
            "sent" => Some(HeaderLabel::Sent),
            "date" => Some(HeaderLabel::Date),
            "to" => Some(HeaderLabel::To),
            "cc" => Some(HeaderLabel::Cc),
            "bcc" => Some(HeaderLabel::Bcc),
            "subject" => Some(HeaderLabel::Subject),
            "importance" => Some(HeaderLabel::Importance),
            "attachments" => Some(HeaderLabel::Attachments),
            _ => None,
        }
    }

    /// Fields whose value may wrap onto following lines.
    pub fn is_address_list(&self) -> bool {
        matches!(self, HeaderLabel::To | HeaderLabel::Cc | HeaderLabel::Bcc)
    }
}

/// One labelled header line. Wrapped recipient lists are joined with `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub label: HeaderLabel,
    pub value: String,
}

/// A traditional header block and the fields read from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderScan {
    pub block: HeaderBlock,
    pub fields: Vec<HeaderField>,
}

impl HeaderScan {
    /// First value recorded for a label.
    pub fn field(&self, label: HeaderLabel) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.label == label)
            .map(|f| f.value.as_str())
    }

    pub fn has(&self, label: HeaderLabel) -> bool {
        self.fields.iter().any(|f| f.label == label)
    }
}

/// One `GUID:` block of a message-store export.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageBlock {
    pub start: usize,
    pub end: usize,
    pub guid: Option<String>,
    pub message: Option<String>,
    pub sender: Option<String>,
    pub time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub format: DocumentFormat,
    pub header: Option<HeaderBlock>,
    /// Why the document was not recognised. Set only for `Unparseable`.
    pub reason: Option<String>,
}

pub struct FormatDetector {
    scan_lines: usize,
    group_chats: bool,
}

impl FormatDetector {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            scan_lines: config.detection.header_scan_lines,
            group_chats: config.extraction.split_group_chats,
        }
    }

    /// Traditional is tried first; some exports carry both layouts and the
    /// header block is the richer of the two.
    pub fn detect(&self, text: &str) -> Detection {
        if let Some(scan) = scan_traditional(text, self.scan_lines) {
            if self.group_chats && is_group_chat(&scan) {
                debug!("Group chat header at {}..{}", scan.block.start, scan.block.end);
                return Detection {
                    format: DocumentFormat::GroupChat,
                    header: Some(scan.block),
                    reason: None,
                };
            }
            debug!("Traditional header at {}..{}", scan.block.start, scan.block.end);
            return Detection {
                format: DocumentFormat::Traditional,
                header: Some(scan.block),
                reason: None,
            };
        }

        if let Some(block) = self.leading_message_block(text) {
            debug!("Message block at {}..{}", block.start, block.end);
            return Detection {
                format: DocumentFormat::MessageGuid,
                header: Some(HeaderBlock {
                    start: block.start,
                    end: block.end,
                }),
                reason: None,
            };
        }

        Detection {
            format: DocumentFormat::Unparseable,
            header: None,
            reason: Some(format!(
                "no From/Sent header or GUID message block in the first {} lines",
                self.scan_lines
            )),
        }
    }

    fn leading_message_block(&self, text: &str) -> Option<MessageBlock> {
        let block = message_blocks(text).into_iter().next()?;
        let lines = lines_with_offsets(text);
        let opening = lines.iter().position(|(offset, _)| *offset == block.start)?;
        let within_window = non_blank_index(&lines, opening) < self.scan_lines;

        if within_window && block.guid.is_some() && block.sender.is_some() && block.time.is_some() {
            Some(block)
        } else {
            None
        }
    }
}

fn is_group_chat(scan: &HeaderScan) -> bool {
    scan.field(HeaderLabel::From)
        .map_or(false, |from| MULTIPLE_SENDERS.is_match(from))
}

/// Finds the first traditional header block that starts within the first
/// `scan_lines` non-blank lines and carries `From:` plus `Sent:` or `Date:`.
pub fn scan_traditional(text: &str, scan_lines: usize) -> Option<HeaderScan> {
    let lines = lines_with_offsets(text);
    let mut seen_non_blank = 0;

    for i in 0..lines.len() {
        let line = lines[i].1;
        if line.trim().is_empty() {
            continue;
        }
        if seen_non_blank >= scan_lines {
            break;
        }
        seen_non_blank += 1;

        if parse_header_line(line).is_none() {
            continue;
        }
        let scan = scan_block(&lines, i);
        let has_date = scan.has(HeaderLabel::Sent) || scan.has(HeaderLabel::Date);
        if scan.has(HeaderLabel::From) && has_date {
            return Some(scan);
        }
    }

    None
}

/// Reads a header block starting at `text[offset..]` with no window limit.
/// Used for quoted headers inside a body.
pub fn scan_header_at(text: &str, offset: usize) -> Option<HeaderScan> {
    let tail = text.get(offset..)?;
    let lines = lines_with_offsets(tail);
    let first = lines.iter().position(|(_, line)| !line.trim().is_empty())?;
    parse_header_line(lines[first].1)?;

    let mut scan = scan_block(&lines, first);
    scan.block.start += offset;
    scan.block.end += offset;
    Some(scan)
}

fn scan_block(lines: &[(usize, &str)], first: usize) -> HeaderScan {
    let mut fields: Vec<HeaderField> = Vec::new();
    let mut seen = HashSet::new();
    let mut wrapping: Option<usize> = None;
    let mut last_line = first;
    let mut i = first;

    while i < lines.len() {
        let line = lines[i].1;

        if let Some((label, value)) = parse_header_line(line) {
            if !seen.insert(label) {
                break;
            }
            fields.push(HeaderField {
                label,
                value: value.trim().to_string(),
            });
            wrapping = label.is_address_list().then(|| fields.len() - 1);
            last_line = i;
            i += 1;
            continue;
        }

        if line.trim().is_empty() {
            // A blank line is inside the block only when a new label follows.
            let next = (i + 1..lines.len()).find(|&j| !lines[j].1.trim().is_empty());
            match next.and_then(|j| parse_header_line(lines[j].1).map(|(label, _)| (j, label))) {
                Some((j, label)) if !seen.contains(&label) => {
                    wrapping = None;
                    i = j;
                    continue;
                }
                _ => break,
            }
        }

        // A wrapped recipient line must sit between its field and a later
        // label, otherwise it is the first line of the body.
        let Some(field_index) = wrapping else {
            break;
        };
        let mut j = i + 1;
        let mut sandwiched = false;
        while j < lines.len() {
            let next = lines[j].1;
            if next.trim().is_empty() {
                break;
            }
            if parse_header_line(next).is_some() {
                sandwiched = true;
                break;
            }
            j += 1;
        }
        if !sandwiched {
            break;
        }
        for (_, wrapped) in &lines[i..j] {
            let value = &mut fields[field_index].value;
            value.push('\n');
            value.push_str(wrapped.trim());
        }
        last_line = j - 1;
        i = j;
    }

    let (start, _) = lines[first];
    let (end_offset, end_line) = lines[last_line];
    HeaderScan {
        block: HeaderBlock {
            start,
            end: end_offset + end_line.len(),
        },
        fields,
    }
}

fn parse_header_line(line: &str) -> Option<(HeaderLabel, &str)> {
    let caps = HEADER_LABEL.captures(line)?;
    let label = HeaderLabel::parse(caps.get(1)?.as_str())?;
    Some((label, caps.get(2).map_or("", |m| m.as_str())))
}

/// Splits a message-store export into its `GUID:` blocks. A document with
/// no `GUID:` line but a `Message:` line opening with a GUID is one block.
pub fn message_blocks(text: &str) -> Vec<MessageBlock> {
    let lines = lines_with_offsets(text);
    let label_of = |line: &str| {
        BLOCK_LABEL
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };

    let mut starts: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, (_, line))| label_of(line).as_deref() == Some("GUID"))
        .map(|(i, _)| i)
        .collect();

    if starts.is_empty() {
        let opening = lines.iter().position(|(_, line)| {
            BLOCK_LABEL
                .captures(line)
                .filter(|c| &c[1] == "Message")
                .map_or(false, |c| {
                    let first_word = c[2].split_whitespace().next().unwrap_or("");
                    GUID_TOKEN.is_match(first_word)
                })
        });
        match opening {
            Some(i) => starts.push(i),
            None => return Vec::new(),
        }
    }

    let mut blocks = Vec::new();
    for (n, &first) in starts.iter().enumerate() {
        let stop = starts.get(n + 1).copied().unwrap_or(lines.len());
        blocks.push(read_block(&lines[first..stop]));
    }
    blocks
}

fn read_block(lines: &[(usize, &str)]) -> MessageBlock {
    let mut block = MessageBlock {
        start: lines[0].0,
        ..MessageBlock::default()
    };
    let mut message_lines: Option<Vec<&str>> = None;
    let mut last_content = 0;

    for (i, (_, line)) in lines.iter().enumerate() {
        if !line.trim().is_empty() {
            last_content = i;
        }

        let caps = BLOCK_LABEL.captures(line);
        let label = caps.as_ref().and_then(|c| c.get(1)).map(|m| m.as_str());
        let value = caps.as_ref().and_then(|c| c.get(2)).map_or("", |m| m.as_str()).trim();

        match label {
            Some("GUID") if block.guid.is_none() => {
                block.guid = GUID_TOKEN.find(value).map(|m| m.as_str().to_string());
            }
            Some("Message") if message_lines.is_none() && block.message.is_none() => {
                let mut text = value;
                if let Some(token) = GUID_TOKEN.find(value).filter(|m| m.start() == 0) {
                    if block.guid.is_none() {
                        block.guid = Some(token.as_str().to_string());
                    }
                    text = value[token.end()..].trim_start();
                }
                message_lines = Some(vec![text]);
            }
            Some("Sender") if block.sender.is_none() => {
                if let Some(pending) = message_lines.take() {
                    block.message = Some(pending.join("\n").trim().to_string());
                }
                block.sender = Some(value.to_string());
            }
            Some("Time") if block.time.is_none() => {
                block.time = Some(value.to_string());
            }
            _ => {
                if let Some(pending) = message_lines.as_mut() {
                    pending.push(*line);
                }
            }
        }
    }

    if let Some(pending) = message_lines {
        block.message = Some(pending.join("\n").trim().to_string());
    }
    let (offset, line) = lines[last_content];
    block.end = offset + line.len();
    block
}

fn lines_with_offsets(text: &str) -> Vec<(usize, &str)> {
    let mut lines = Vec::new();
    let mut offset = 0;
    for line in text.split('\n') {
        lines.push((offset, line));
        offset += line.len() + 1;
    }
    lines
}

fn non_blank_index(lines: &[(usize, &str)], index: usize) -> usize {
    lines[..index]
        .iter()
        .filter(|(_, line)| !line.trim().is_empty())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> FormatDetector {
        FormatDetector::new(&PipelineConfig::default())
    }

    #[test]
    fn test_traditional_detected_with_offsets() {
        let text = "HOUSE_OVERSIGHT_010101\n\nFrom: a@x.com\nSent: 1/1/2015 9:00 AM\nTo: b@x.com\nSubject: Hi\n\nBody here";
        let detection = detector().detect(text);
        assert_eq!(detection.format, DocumentFormat::Traditional);
        let header = detection.header.unwrap();
        assert!(text[header.start..].starts_with("From:"));
        assert!(text[..header.end].ends_with("Subject: Hi"));
    }

    #[test]
    fn test_date_label_is_enough() {
        let text = "Subject: Lunch\nFrom: a@x.com\nDate: 2015-01-01\n\nhello";
        assert_eq!(detector().detect(text).format, DocumentFormat::Traditional);
    }

    #[test]
    fn test_header_beyond_window_is_unparseable() {
        let mut text = String::new();
        for i in 0..20 {
            text.push_str(&format!("line {i}\n"));
        }
        text.push_str("From: a@x.com\nSent: 2015-01-01\n");
        let detection = detector().detect(&text);
        assert_eq!(detection.format, DocumentFormat::Unparseable);
        assert!(detection.header.is_none());
        assert!(detection.reason.is_some());
    }

    #[test]
    fn test_wrapped_recipients_joined() {
        let text = "From: a@x.com\nSent: 2015-01-01\nTo: b@x.com;\nc@x.com\nSubject: Hi\n\nBody";
        let scan = scan_traditional(text, 15).unwrap();
        assert_eq!(scan.field(HeaderLabel::To), Some("b@x.com;\nc@x.com"));
        assert_eq!(scan.field(HeaderLabel::Subject), Some("Hi"));
    }

    #[test]
    fn test_unsandwiched_line_starts_body() {
        let text = "From: a@x.com\nSent: 2015-01-01\nTo: b@x.com\nThanks for the note\n";
        let scan = scan_traditional(text, 15).unwrap();
        assert_eq!(scan.field(HeaderLabel::To), Some("b@x.com"));
        assert!(text[scan.block.end..].contains("Thanks"));
    }

    #[test]
    fn test_blank_line_inside_header() {
        let text = "From: a@x.com\nSent: 2015-01-01\n\nTo: b@x.com\nSubject: Hi\n\nFrom: quoted@x.com\n";
        let scan = scan_traditional(text, 15).unwrap();
        assert_eq!(scan.field(HeaderLabel::Subject), Some("Hi"));
        assert_eq!(scan.field(HeaderLabel::From), Some("a@x.com"));
        assert!(text[scan.block.end..].contains("quoted@x.com"));
    }

    #[test]
    fn test_message_guid_detected() {
        let text = "GUID: 3F2504E0-4F89-11D3-9A0C-0305E82C3301\nMessage: see you at 5\nthanks\nSender: e:jeeitunes@gmail.com\nTime: 7/25/2018 2:29:14 PM\nFlags: 0\n";
        let detection = detector().detect(text);
        assert_eq!(detection.format, DocumentFormat::MessageGuid);

        let blocks = message_blocks(text);
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.guid.as_deref(), Some("3F2504E0-4F89-11D3-9A0C-0305E82C3301"));
        assert_eq!(block.message.as_deref(), Some("see you at 5\nthanks"));
        assert_eq!(block.sender.as_deref(), Some("e:jeeitunes@gmail.com"));
        assert_eq!(block.time.as_deref(), Some("7/25/2018 2:29:14 PM"));
    }

    #[test]
    fn test_guid_on_message_line() {
        let text = "Message: 3F2504E04F8911D39A0C0305E82C3301 ok\nSender: Bob\nTime: 2015-01-01\n";
        let detection = detector().detect(text);
        assert_eq!(detection.format, DocumentFormat::MessageGuid);
        let block = &message_blocks(text)[0];
        assert_eq!(block.message.as_deref(), Some("ok"));
    }

    #[test]
    fn test_multiple_blocks() {
        let text = "GUID: 3F2504E0-4F89-11D3-9A0C-0305E82C3301\nMessage: one\nSender: a\nTime: t1\n\nGUID: 3F2504E0-4F89-11D3-9A0C-0305E82C3302\nMessage: two\nSender: b\nTime: t2\n";
        let blocks = message_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].message.as_deref(), Some("two"));
        assert_eq!(blocks[1].sender.as_deref(), Some("b"));
    }

    #[test]
    fn test_guid_without_sender_is_unparseable() {
        let text = "GUID: 3F2504E0-4F89-11D3-9A0C-0305E82C3301\nMessage: hi\n";
        assert_eq!(detector().detect(text).format, DocumentFormat::Unparseable);
    }

    #[test]
    fn test_group_chat_detected_only_when_enabled() {
        let text = "From: Multiple Senders\nSent: 7/25/2018 2:29:14 PM\nSubject: chat\n\nBob\n07/25/2018 2:29:14 PM\nhello\n";
        assert_eq!(detector().detect(text).format, DocumentFormat::Traditional);

        let mut config = PipelineConfig::default();
        config.extraction.split_group_chats = true;
        let detection = FormatDetector::new(&config).detect(text);
        assert_eq!(detection.format, DocumentFormat::GroupChat);
        assert!(text[..detection.header.unwrap().end].ends_with("Subject: chat"));

        let plain = "From: a@x.com\nSent: 2015-01-01\n\nhello";
        assert_eq!(FormatDetector::new(&config).detect(plain).format, DocumentFormat::Traditional);
    }

    #[test]
    fn test_plain_prose_is_unparseable() {
        assert_eq!(
            detector().detect("Dear sir,\nplease find attached.\n").format,
            DocumentFormat::Unparseable
        );
        assert_eq!(detector().detect("").format, DocumentFormat::Unparseable);
    }
}
