use lazy_static::lazy_static;
use regex::Regex;

use crate::config::PipelineConfig;

lazy_static! {
    static ref PAGE_OF: Regex = Regex::new(r"(?i)\bPage \d+ of \d+\b").unwrap();
    static ref DEVICE_SIGNATURE: Regex = Regex::new(
        r"(?im)^[ \t]*(?:Sent from my (?:iPhone|iPad|BlackBerry|Android)|Sent from Yahoo Mail|Get Outlook for)[^\n]*$"
    )
    .unwrap();
    static ref SEPARATOR_LINE: Regex = Regex::new(r"^[ \t]*[_\-=]{3,}[ \t]*$").unwrap();
    static ref EXCESS_BLANK: Regex = Regex::new(r"\n{3,}").unwrap();
    static ref DISCLAIMERS: Vec<Regex> = vec![
        Regex::new(r"(?is)(?:^|\n)[ \t]*please\s*note\b.*?all rights reserved\.?").unwrap(),
        Regex::new(
            r"(?is)(?:^|\n)[ \t]*please\s*note\s*:?\s*the information contained in this communication.*?(?:\n[ \t]*\n|$)"
        )
        .unwrap(),
        Regex::new(r"(?is)(?:^|\n)[ \t]*the information contained in this communication.*?(?:\n[ \t]*\n|$)").unwrap(),
    ];
    static ref QUOTE_MARKERS: Vec<Regex> = vec![
        Regex::new(r"(?m)^[ \t>]*On\s+[A-Z][a-z]{2},\s+[A-Z][a-z]{2,}\s+\d{1,2},\s+\d{4}\s+at\s+[\d:]+\s*[AaPp][Mm]").unwrap(),
        Regex::new(r"(?m)^[ \t>]*On\b[^\n]{0,200}\bwrote:").unwrap(),
        Regex::new(r"(?m)^[ \t>]*From:[^\n]*\n[ \t>]*(?:Sent|Date):[^\n]*\n[ \t>]*To:").unwrap(),
        Regex::new(r"(?im)^[ \t>]*-+\s*Original Message\s*-+").unwrap(),
        Regex::new(r"(?im)^[ \t>]*-+\s*Forwarded message\s*-+").unwrap(),
        Regex::new(r"(?im)^[ \t>]*Begin forwarded message:").unwrap(),
        Regex::new(r"(?m)^[<>]\s*wrote:").unwrap(),
    ];
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Turns the text after a header block into a message body.
pub struct BodyCleaner {
    page_prefixes: Vec<String>,
    inline_marker: Option<Regex>,
    strip_quoted: bool,
}

/// A cleaned body, with the legal footer split off when one was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanBody {
    pub text: String,
    pub disclaimer: Option<String>,
}

impl BodyCleaner {
    pub fn new(config: &PipelineConfig) -> Self {
        let prefixes = &config.extraction.page_marker_prefixes;
        let inline_marker = if prefixes.is_empty() {
            None
        } else {
            let alternatives: Vec<String> = prefixes.iter().map(|p| regex::escape(p)).collect();
            Regex::new(&format!(r"(?:{})[_ ]?\d+", alternatives.join("|"))).ok()
        };

        Self {
            page_prefixes: prefixes.clone(),
            inline_marker,
            strip_quoted: config.extraction.strip_quoted,
        }
    }

    /// Full treatment: page cut, cleanup, disclaimer split, quote strip.
    pub fn process(&self, raw_body: &str) -> CleanBody {
        self.finish(&self.prepare(raw_body))
    }

    /// Page cut and cleanup only. Quoted material is still present, which
    /// is what recipient recovery and quoted-header extraction read.
    pub fn prepare(&self, raw_body: &str) -> String {
        self.clean(self.cut_at_page_marker(raw_body))
    }

    pub fn finish(&self, prepared: &str) -> CleanBody {
        let (body, disclaimer) = extract_disclaimer(prepared);
        let text = if self.strip_quoted {
            strip_quoted(&body)
        } else {
            body
        };
        CleanBody { text, disclaimer }
    }

    /// The body ends at the first standalone page-stamp line.
    pub fn cut_at_page_marker<'a>(&self, body: &'a str) -> &'a str {
        let mut offset = 0;
        for line in body.split_inclusive('\n') {
            if self.is_page_marker(line) {
                return &body[..offset];
            }
            offset += line.len();
        }
        body
    }

    /// A short line opening with one of the configured page-stamp prefixes.
    pub fn is_page_marker(&self, line: &str) -> bool {
        let trimmed = line.trim();
        trimmed.len() < 50
            && self
                .page_prefixes
                .iter()
                .any(|prefix| !prefix.is_empty() && trimmed.starts_with(prefix.as_str()))
    }

    pub fn clean(&self, body: &str) -> String {
        let mut text = PAGE_OF.replace_all(body, "").into_owned();
        if let Some(marker) = &self.inline_marker {
            text = marker.replace_all(&text, "").into_owned();
        }
        text = DEVICE_SIGNATURE.replace_all(&text, "").into_owned();

        let lines: Vec<&str> = text
            .lines()
            .filter(|line| !SEPARATOR_LINE.is_match(line))
            .map(str::trim_end)
            .collect();
        let joined = lines.join("\n");
        EXCESS_BLANK
            .replace_all(joined.trim(), "\n\n")
            .into_owned()
    }
}

/// Removes confidentiality footers. Returns the first one found, whitespace
/// collapsed, so repeated copies do not vary the stored text.
pub fn extract_disclaimer(body: &str) -> (String, Option<String>) {
    let mut text = body.to_string();
    let mut disclaimer = None;

    loop {
        let found = DISCLAIMERS.iter().find_map(|pattern| pattern.find(&text));
        let Some(found) = found else {
            break;
        };
        if disclaimer.is_none() {
            disclaimer = Some(WHITESPACE.replace_all(found.as_str().trim(), " ").into_owned());
        }
        let (start, end) = (found.start(), found.end());
        text = format!("{}\n{}", text[..start].trim_end(), &text[end..]);
        text = text.trim().to_string();
    }

    (text, disclaimer)
}

/// Cuts the body at the earliest reply or forward marker.
pub fn strip_quoted(body: &str) -> String {
    let cut = QUOTE_MARKERS
        .iter()
        .filter_map(|pattern| pattern.find(body).map(|m| m.start()))
        .min()
        .unwrap_or(body.len());
    body[..cut].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleaner() -> BodyCleaner {
        BodyCleaner::new(&PipelineConfig::default())
    }

    #[test]
    fn test_cut_at_standalone_marker() {
        let body = "hello\nworld\nHOUSE_OVERSIGHT_022330\nnext page text";
        assert_eq!(cleaner().cut_at_page_marker(body), "hello\nworld\n");
    }

    #[test]
    fn test_marker_inside_long_line_does_not_cut() {
        let body = "HOUSE_OVERSIGHT is mentioned in this much longer sentence about the committee\nrest";
        assert_eq!(cleaner().cut_at_page_marker(body), body);
    }

    #[test]
    fn test_clean_removes_noise() {
        let body = "Hi there\nPage 1 of 2\n__________\n\n\n\nSee you\nSent from my iPhone\n";
        assert_eq!(cleaner().clean(body), "Hi there\n\nSee you");
    }

    #[test]
    fn test_inline_marker_removed() {
        assert_eq!(cleaner().clean("text HOUSE_OVERSIGHT_012345 more"), "text  more");
    }

    #[test]
    fn test_disclaimer_extracted() {
        let body = "Sounds good.\n\nplease note\nThe information contained in this communication is confidential, may be attorney-client privileged.\n\nthanks";
        let (text, disclaimer) = extract_disclaimer(body);
        assert_eq!(text, "Sounds good.\nthanks");
        assert!(disclaimer.unwrap().starts_with("please note The information contained"));
    }

    #[test]
    fn test_no_disclaimer() {
        let (text, disclaimer) = extract_disclaimer("just a note");
        assert_eq!(text, "just a note");
        assert!(disclaimer.is_none());
    }

    #[test]
    fn test_strip_quoted_earliest_marker() {
        let body = "My reply.\n\n-----Original Message-----\nFrom: b@x.com\nSent: x\nTo: a@x.com\nold text";
        assert_eq!(strip_quoted(body), "My reply.");

        let body = "Yes.\nOn Mon, Jun 3, 2019 at 9:12 AM Reid <r@x.com> wrote:\n> earlier";
        assert_eq!(strip_quoted(body), "Yes.");
    }

    #[test]
    fn test_process_keeps_quotes_when_disabled() {
        let mut config = PipelineConfig::default();
        config.extraction.strip_quoted = false;
        let cleaner = BodyCleaner::new(&config);
        let body = "Reply\n-----Original Message-----\nolder";
        assert_eq!(cleaner.process(body).text, body);
    }
}
