use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::PipelineConfig;

lazy_static! {
    static ref HTML_ENTITY: Regex =
        Regex::new(r"&(?:#(\d+)|#[xX]([0-9A-Fa-f]+)|([a-zA-Z][a-zA-Z0-9]*));").unwrap();
    static ref URL_SCHEME: Regex = Regex::new(r"(?i)https?[ \t]*:[ \t]*/[ \t]*/").unwrap();
    static ref COPYRIGHT_AT: Regex =
        Regex::new(r"([A-Za-z0-9._%+\-]+)[ \t]*©[ \t]*([A-Za-z0-9\-]+\.[A-Za-z]{2,})").unwrap();
    // `(a)` is also a list marker in prose, so it only counts as `@` on
    // sender and recipient lines.
    static ref PAREN_A_AT: Regex =
        Regex::new(r"([A-Za-z0-9._%+\-]+)[ \t]*\(a\)[ \t]*([A-Za-z0-9\-]+\.[A-Za-z]{2,})").unwrap();
    static ref SPACED_ADDRESS: Regex = Regex::new(
        r"([A-Za-z0-9._%+\-]+)[ \t]*@[ \t]*([A-Za-z0-9\-]+(?:[ \t]*\.[ \t]*(?:com|net|org|edu|gov|co|uk|us)\b|[ \t]+\.[ \t]*[a-z0-9\-]+|\.[A-Za-z0-9\-]+)+)"
    )
    .unwrap();
    static ref ADDRESS_TOKEN: Regex = Regex::new(r"[A-Za-z0-9._%+\-@]+").unwrap();
    static ref DATE_LINE: Regex =
        Regex::new(r"(?m)^([ \t>]*(?:Sent|Date|Time)[ \t]*:)([^\n]*)$").unwrap();
    static ref NAME_LINE: Regex =
        Regex::new(r"(?m)^([ \t>]*(?:From|To|Cc|CC|Bcc|BCC|Sender)[ \t]*:)([^\n]*)$").unwrap();
    static ref SPLIT_DIGITS: Regex =
        Regex::new(r"(\d)[ \t]*([:/])[ \t]*(\d|[OolI|]\d)").unwrap();
    static ref O_BETWEEN_DIGITS: Regex = Regex::new(r"(\d|[:/])[Oo](\d)|(\d)[Oo]([:/])").unwrap();
    static ref ONE_BETWEEN_DIGITS: Regex =
        Regex::new(r"(\d|[:/])[lI|](\d)|(\d)[lI|]([:/])").unwrap();
    static ref MERIDIEM: Regex = Regex::new(r"(\d)([ \t]*)([AaPp])\.?[ \t]?[Mm](?:\.|\b)").unwrap();
    static ref HORIZONTAL_SPACE: Regex = Regex::new(r"[ \t]+").unwrap();
    static ref NAME_LEAD: Regex = Regex::new(r"^[\s>•●▪·*_\-:]+").unwrap();
    static ref NAME_OCR_TAIL: Regex = Regex::new(r"\s*\[\s*[il1I|]*\s*$").unwrap();
    static ref NAME_TRAIL: Regex = Regex::new(r"[\s_\-•●▪·,;:|]+$").unwrap();
}

const URL_JOINERS: &[char] = &['/', '.', '-', '_', '=', '?', '&', '#', '%', ':', '~'];

/// The repair rules, in the order `OcrNormalizer::normalize` applies them.
/// Each one is idempotent on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcrRule {
    UrlWhitespace,
    EmailAddress,
    DateToken,
    NameField,
}

impl OcrRule {
    pub const ALL: [OcrRule; 4] = [
        OcrRule::UrlWhitespace,
        OcrRule::EmailAddress,
        OcrRule::DateToken,
        OcrRule::NameField,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OcrRule::UrlWhitespace => "url_whitespace",
            OcrRule::EmailAddress => "email_address",
            OcrRule::DateToken => "date_token",
            OcrRule::NameField => "name_field",
        }
    }
}

pub struct OcrNormalizer {
    address_corrections: BTreeMap<String, String>,
    domain_corrections: BTreeMap<String, String>,
}

impl OcrNormalizer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            address_corrections: config.normalization.address_corrections.clone(),
            domain_corrections: config.normalization.domain_corrections.clone(),
        }
    }

    /// Canonical text followed by every rule in order.
    pub fn normalize(&self, raw: &str) -> String {
        let mut text = self.canonicalize(raw);
        for rule in OcrRule::ALL {
            text = self.apply(rule, &text);
        }
        text
    }

    pub fn apply(&self, rule: OcrRule, text: &str) -> String {
        match rule {
            OcrRule::UrlWhitespace => self.repair_urls(text),
            OcrRule::EmailAddress => self.repair_addresses(text),
            OcrRule::DateToken => self.repair_date_fields(text),
            OcrRule::NameField => self.repair_name_fields(text),
        }
    }

    /// Line endings, byte-order mark and the HTML entities OCR exports carry.
    /// Not a repair rule: decoding `&amp;lt;` twice is not the same as once.
    pub fn canonicalize(&self, raw: &str) -> String {
        let text = raw.strip_prefix('\u{FEFF}').unwrap_or(raw);
        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        self.decode_html_entities(&text)
    }

    fn decode_html_entities(&self, text: &str) -> String {
        if !text.contains('&') {
            return text.to_string();
        }

        HTML_ENTITY
            .replace_all(text, |caps: &Captures| {
                if let Some(decimal) = caps.get(1) {
                    if let Some(ch) = decimal.as_str().parse::<u32>().ok().and_then(char::from_u32) {
                        return ch.to_string();
                    }
                } else if let Some(hex) = caps.get(2) {
                    if let Some(ch) = u32::from_str_radix(hex.as_str(), 16)
                        .ok()
                        .and_then(char::from_u32)
                    {
                        return ch.to_string();
                    }
                } else if let Some(named) = caps.get(3) {
                    match named.as_str() {
                        "amp" => return "&".to_string(),
                        "lt" => return "<".to_string(),
                        "gt" => return ">".to_string(),
                        "quot" => return "\"".to_string(),
                        "apos" => return "'".to_string(),
                        "nbsp" => return " ".to_string(),
                        _ => {}
                    }
                }
                caps[0].to_string()
            })
            .into_owned()
    }

    /// Rejoins URLs that OCR broke at whitespace, starting from each scheme.
    fn repair_urls(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;

        for scheme in URL_SCHEME.find_iter(text) {
            if scheme.start() < last {
                continue;
            }
            out.push_str(&text[last..scheme.start()]);

            let mut url: String = scheme
                .as_str()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            let mut pos = scheme.end();

            loop {
                let rest = &text[pos..];
                let ws_len = rest.len() - rest.trim_start().len();
                let gap = &rest[..ws_len];
                let after = &rest[ws_len..];
                let token_len = after.find(char::is_whitespace).unwrap_or(after.len());
                let token = &after[..token_len];
                if token.is_empty() {
                    break;
                }

                if gap.is_empty() {
                    // Directly attached text: keep its URL-shaped prefix.
                    let keep = token.find(|c| !is_url_char(c)).unwrap_or(token.len());
                    url.push_str(&token[..keep]);
                    pos += keep;
                    if keep < token.len() {
                        break;
                    }
                    continue;
                }

                if gap.matches('\n').count() >= 2
                    || !token.chars().all(is_url_char)
                    || !joins_url(&url, token)
                {
                    break;
                }
                url.push_str(token);
                pos += ws_len + token_len;
            }

            out.push_str(&url);
            last = pos;
        }

        out.push_str(&text[last..]);
        out
    }

    fn repair_addresses(&self, text: &str) -> String {
        let text = COPYRIGHT_AT.replace_all(text, "$1@$2");
        let text = NAME_LINE.replace_all(&text, |caps: &Captures| {
            format!("{}{}", &caps[1], PAREN_A_AT.replace_all(&caps[2], "$1@$2"))
        });

        let text = SPACED_ADDRESS.replace_all(&text, |caps: &Captures| {
            let domain: String = caps[2]
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_lowercase();
            let domain = self
                .domain_corrections
                .get(&domain)
                .cloned()
                .unwrap_or(domain);
            format!("{}@{}", &caps[1], domain)
        });

        if self.address_corrections.is_empty() {
            return text.into_owned();
        }
        ADDRESS_TOKEN
            .replace_all(&text, |caps: &Captures| {
                let token = &caps[0];
                match self.address_corrections.get(&token.to_lowercase()) {
                    Some(fixed) => fixed.clone(),
                    None => token.to_string(),
                }
            })
            .into_owned()
    }

    fn repair_date_fields(&self, text: &str) -> String {
        DATE_LINE
            .replace_all(text, |caps: &Captures| {
                let mut value = caps[2].to_string();
                // Repairs can expose each other (`1O : 2` -> `10 : 2`), so run
                // them to a fixed point.
                for _ in 0..8 {
                    let next = repair_date_value(&value);
                    if next == value {
                        break;
                    }
                    value = next;
                }
                format!("{}{}", &caps[1], value)
            })
            .into_owned()
    }

    fn repair_name_fields(&self, text: &str) -> String {
        NAME_LINE
            .replace_all(text, |caps: &Captures| {
                let value = HORIZONTAL_SPACE.replace_all(&caps[2], " ");
                let mut value = NAME_LEAD.replace(&value, "").into_owned();
                loop {
                    let trimmed = NAME_OCR_TAIL.replace(&value, "");
                    let trimmed = NAME_TRAIL.replace(&trimmed, "").into_owned();
                    if trimmed == value {
                        break;
                    }
                    value = trimmed;
                }
                if value.is_empty() {
                    caps[1].to_string()
                } else {
                    format!("{} {}", &caps[1], value)
                }
            })
            .into_owned()
    }
}

fn repair_date_value(value: &str) -> String {
    let mut value = value.to_string();
    loop {
        let next = SPLIT_DIGITS.replace_all(&value, "$1$2$3").into_owned();
        if next == value {
            break;
        }
        value = next;
    }
    let value = O_BETWEEN_DIGITS.replace_all(&value, "${1}${3}0${2}${4}");
    let value = ONE_BETWEEN_DIGITS.replace_all(&value, "${1}${3}1${2}${4}");
    let value = MERIDIEM.replace_all(&value, |caps: &Captures| {
        format!("{}{}{}M", &caps[1], &caps[2], caps[3].to_uppercase())
    });
    let value = HORIZONTAL_SPACE.replace_all(&value, " ");
    let trimmed = value.trim_end();
    if trimmed.is_empty() {
        String::new()
    } else if value.starts_with(' ') {
        format!(" {}", trimmed.trim_start())
    } else {
        trimmed.to_string()
    }
}

fn is_url_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._~:/?#[]@!$&'()*+,;=%".contains(c)
}

fn joins_url(prev: &str, next: &str) -> bool {
    let (Some(last), Some(first)) = (prev.chars().last(), next.chars().next()) else {
        return false;
    };
    if (last == '.' || last == '/') && first.is_uppercase() {
        return false;
    }
    URL_JOINERS.contains(&last)
        || URL_JOINERS.contains(&first)
        || (last.is_ascii_digit() && first.is_ascii_digit())
}
