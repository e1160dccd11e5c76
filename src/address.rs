use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

use crate::config::PipelineConfig;

lazy_static! {
    static ref EMBEDDED_ADDRESS: Regex =
        Regex::new(r"(?i)(?:mailto:|e:)?[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap();
    static ref VALID_ADDRESS: Regex =
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(?:\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$").unwrap();
    static ref MAILTO_FRAGMENT: Regex = Regex::new(r"(?i)\s*\[mailto:?[^\]]*\]?").unwrap();
    static ref BRACKET_TAIL: Regex = Regex::new(r"\s*[<‹〈(].*$").unwrap();
    static ref BULLETS: Regex = Regex::new(r"[•●○◦▪▫]").unwrap();
    static ref TRAILING_OCR_BRACKET: Regex = Regex::new(r"\s*\[\s*[il1I]*\s*$").unwrap();
    static ref EDGE_PUNCT_END: Regex = Regex::new(r"[\s_\-.;:,>\]\[|]+$").unwrap();
    static ref EDGE_PUNCT_START: Regex = Regex::new(r"^[\s_\-.;:,>\]\[|]+").unwrap();
    static ref TRAILING_DIGIT_RUN: Regex = Regex::new(r"\s+\d{5,}[.\-=]*$").unwrap();
    static ref TRAILING_NOISE: Regex = Regex::new(r"\s+[\d=\-.|]+$").unwrap();
    static ref TRAILING_STRAY_LETTER: Regex = Regex::new(r"\s+[IilL1]$").unwrap();
    static ref TRAILING_QUOTE_TAIL: Regex = Regex::new(r"['`]+[IiLl]*$").unwrap();
    static ref TRAILING_BT: Regex = Regex::new(r"(?i)\s+bt$").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref SURNAME_PART: Regex =
        Regex::new(r"^[A-Z][A-Za-z'\-]*(?: [A-Z][A-Za-z'\-]*)*$").unwrap();
    static ref GIVEN_NAME_PART: Regex = Regex::new(r"^[A-Z][a-z]+(?: [A-Z]\.?)?$").unwrap();
}

const REDACTION_MARKERS: &[&str] = &["[redacted]", "(redacted)", "redacted", "-", "unknown"];
const BOGUS_TLDS: &[&str] = &["corn", "cam", "cpm"];

/// A sender or recipient as read from a header. At least one side is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    pub address: Option<String>,
    pub name: Option<String>,
}

impl Party {
    /// The string used for the party in records: its address when known.
    pub fn identity(&self) -> Option<String> {
        self.address.clone().or_else(|| self.name.clone())
    }
}

pub fn is_redacted(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    value.is_empty() || REDACTION_MARKERS.contains(&value.as_str())
}

pub fn is_valid_address(address: &str) -> bool {
    if !VALID_ADDRESS.is_match(address) {
        return false;
    }
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    if local.is_empty() || local.len() > 64 {
        return false;
    }
    let tld = domain.rsplit('.').next().unwrap_or_default().to_lowercase();
    !BOGUS_TLDS.contains(&tld.as_str())
}

/// Strips `mailto:`/`e:` prefixes and wrapping punctuation, then lowercases.
pub fn normalize_address(raw: &str) -> String {
    let mut address = raw.trim().trim_matches(|c| "<>[]()\"'".contains(c)).trim();
    for prefix in ["mailto:", "e:"] {
        let has_prefix = address
            .get(..prefix.len())
            .map_or(false, |head| head.eq_ignore_ascii_case(prefix));
        if has_prefix && address.len() > prefix.len() {
            address = &address[prefix.len()..];
        }
    }
    address
        .trim_end_matches(|c| ".,;:".contains(c))
        .to_lowercase()
}

/// Reads parties out of header values using the configured correction tables.
pub struct PartyParser {
    name_corrections: BTreeMap<String, String>,
    address_corrections: BTreeMap<String, String>,
    domain_corrections: BTreeMap<String, String>,
}

impl PartyParser {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            name_corrections: config.extraction.name_corrections.clone(),
            address_corrections: config.normalization.address_corrections.clone(),
            domain_corrections: config.normalization.domain_corrections.clone(),
        }
    }

    /// Normalizes an address and applies the correction tables.
    pub fn canonical_address(&self, raw: &str) -> String {
        let address = normalize_address(raw);
        if let Some(fixed) = self.address_corrections.get(&address) {
            return fixed.clone();
        }
        match address.split_once('@') {
            Some((local, domain)) => match self.domain_corrections.get(domain) {
                Some(fixed) => format!("{local}@{fixed}"),
                None => address,
            },
            None => address,
        }
    }

    pub fn parse_party(&self, field: &str) -> Option<Party> {
        let field = field.trim();
        if is_redacted(field) {
            return None;
        }

        for found in EMBEDDED_ADDRESS.find_iter(field) {
            let address = self.canonical_address(found.as_str());
            if is_valid_address(&address) {
                let name = self.clean_name(&field[..found.start()]);
                return Some(Party {
                    address: Some(address),
                    name,
                });
            }
        }

        // A garbled address with no `@` can still be a known correction.
        let lowered = field.to_lowercase();
        if let Some(fixed) = self.address_corrections.get(&lowered) {
            return Some(Party {
                address: Some(fixed.clone()),
                name: None,
            });
        }

        self.clean_name(field).map(|name| Party {
            address: None,
            name: Some(name),
        })
    }

    /// Removes OCR residue around a display name. Returns `None` when nothing
    /// name-like is left.
    pub fn clean_name(&self, raw: &str) -> Option<String> {
        let mut name = MAILTO_FRAGMENT.replace_all(raw.trim(), "").to_string();
        name = BRACKET_TAIL.replace(&name, "").to_string();
        name = name
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .trim()
            .to_string();
        name = BULLETS.replace_all(&name, "").to_string();
        name = TRAILING_OCR_BRACKET.replace(&name, "").to_string();
        name = EDGE_PUNCT_START.replace(&name, "").to_string();
        name = EDGE_PUNCT_END.replace(&name, "").to_string();
        name = TRAILING_DIGIT_RUN.replace(&name, "").to_string();
        name = TRAILING_NOISE.replace(&name, "").to_string();
        name = TRAILING_STRAY_LETTER.replace(&name, "").to_string();
        name = TRAILING_QUOTE_TAIL.replace(&name, "").to_string();
        name = TRAILING_BT.replace(&name, "").to_string();
        name = EDGE_PUNCT_END.replace(&name, "").to_string();
        name = WHITESPACE.replace_all(name.trim(), " ").to_string();

        if name.chars().filter(|c| c.is_alphanumeric()).count() < 2 || is_redacted(&name) {
            return None;
        }

        match self.name_corrections.get(&name.to_lowercase()) {
            Some(fixed) => Some(fixed.clone()),
            None => Some(name),
        }
    }

    /// Splits a `To:`/`Cc:` value into identities. `;`, `,` and newlines
    /// separate entries, except that `Last, First` stays one entry.
    /// Case-insensitive repeats are dropped, keeping the first spelling.
    pub fn split_recipients(&self, field: &str) -> Vec<String> {
        let mut entries = Vec::new();
        for segment in field.split(|c| c == ';' || c == '\n') {
            let pieces: Vec<&str> = segment.split(',').map(str::trim).collect();
            let mut i = 0;
            while i < pieces.len() {
                let piece = pieces[i];
                if i + 1 < pieces.len()
                    && SURNAME_PART.is_match(piece)
                    && GIVEN_NAME_PART.is_match(pieces[i + 1])
                {
                    entries.push(format!("{}, {}", piece, pieces[i + 1]));
                    i += 2;
                } else {
                    entries.push(piece.to_string());
                    i += 1;
                }
            }
        }

        let mut seen = HashSet::new();
        entries
            .iter()
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| self.parse_party(entry))
            .filter_map(|party| party.identity())
            .filter(|identity| seen.insert(identity.to_lowercase()))
            .collect()
    }
}
