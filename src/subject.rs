use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref REPLY_PREFIX: Regex = Regex::new(r"(?i)^\s*re\s*(?:\[\d+\]|\(\d+\))?\s*:").unwrap();
    static ref FORWARD_PREFIX: Regex = Regex::new(r"(?i)^\s*(?:fwd?|fw)\s*(?:\[\d+\])?\s*:").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// A subject line with its reply/forward chain separated out.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubjectInfo {
    /// Lowercased, prefix-free, whitespace-collapsed subject used for threading.
    pub normalized: String,
    pub reply_depth: u32,
    pub is_forward: bool,
}

impl SubjectInfo {
    pub fn analyze(subject: &str) -> Self {
        let mut rest = subject;
        let mut reply_depth = 0;
        let mut is_forward = false;

        loop {
            if let Some(m) = REPLY_PREFIX.find(rest) {
                reply_depth += 1;
                rest = &rest[m.end()..];
            } else if let Some(m) = FORWARD_PREFIX.find(rest) {
                is_forward = true;
                rest = &rest[m.end()..];
            } else {
                break;
            }
        }

        Self {
            normalized: WHITESPACE.replace_all(rest.trim(), " ").to_lowercase(),
            reply_depth,
            is_forward,
        }
    }
}

/// Shorthand for the threading key of a subject.
pub fn normalize_subject(subject: &str) -> String {
    SubjectInfo::analyze(subject).normalized
}
