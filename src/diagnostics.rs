use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ExtractionFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Unreadable file, or no recognisable header.
    UnparseableDocument,
    ExtractionFailure,
}

/// One document that contributed no records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Diagnostic {
    pub source_path: String,
    pub kind: DiagnosticKind,
    pub reason: String,
}

impl Diagnostic {
    pub fn unparseable(source_path: &str, reason: impl Into<String>) -> Self {
        Self {
            source_path: source_path.to_string(),
            kind: DiagnosticKind::UnparseableDocument,
            reason: reason.into(),
        }
    }

    pub fn extraction(source_path: &str, failure: &ExtractionFailure) -> Self {
        Self {
            source_path: source_path.to_string(),
            kind: DiagnosticKind::ExtractionFailure,
            reason: failure.to_string(),
        }
    }
}

/// Coverage report returned next to the conversations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub documents_in: usize,
    pub documents_parsed: usize,
    pub documents_failed: usize,
    pub candidates_extracted: usize,
    pub records_after_dedup: usize,
    pub duplicates_merged: usize,
    pub unparsed_timestamps: usize,
    pub conversations: usize,
    /// Sorted by source path.
    pub failures: Vec<Diagnostic>,
    pub reasons: BTreeMap<String, usize>,
}

impl DiagnosticsReport {
    pub fn record_failure(&mut self, diagnostic: Diagnostic) {
        let reason = match diagnostic.kind {
            DiagnosticKind::UnparseableDocument => "unparseable document".to_string(),
            DiagnosticKind::ExtractionFailure => diagnostic.reason.clone(),
        };
        *self.reasons.entry(reason).or_default() += 1;
        self.documents_failed += 1;
        self.failures.push(diagnostic);
    }

    /// Puts failures in a run-independent order.
    pub fn finalize(&mut self) {
        self.failures.sort();
    }

    pub fn failures_of(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.failures.iter().filter(move |d| d.kind == kind)
    }
}

impl fmt::Display for DiagnosticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files in, {} parsed, {} failed",
            self.documents_in, self.documents_parsed, self.documents_failed
        )?;
        if !self.reasons.is_empty() {
            let reasons: Vec<String> = self
                .reasons
                .iter()
                .map(|(reason, count)| format!("{reason} ({count})"))
                .collect();
            write!(f, ", reasons: {}", reasons.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_line() {
        let mut report = DiagnosticsReport {
            documents_in: 4,
            documents_parsed: 1,
            ..Default::default()
        };
        report.record_failure(Diagnostic::unparseable("b.txt", "no header"));
        report.record_failure(Diagnostic::extraction("a.txt", &ExtractionFailure::MissingSender));
        report.record_failure(Diagnostic::unparseable("c.txt", "no header"));
        report.finalize();

        assert_eq!(
            report.to_string(),
            "4 files in, 1 parsed, 3 failed, reasons: no usable sender (1), unparseable document (2)"
        );
        assert_eq!(report.failures[0].source_path, "a.txt");
        assert_eq!(report.failures_of(DiagnosticKind::UnparseableDocument).count(), 2);
    }

    #[test]
    fn test_clean_run_has_no_reasons() {
        let report = DiagnosticsReport {
            documents_in: 2,
            documents_parsed: 2,
            ..Default::default()
        };
        assert_eq!(report.to_string(), "2 files in, 2 parsed, 0 failed");
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let d = Diagnostic::unparseable("x.txt", "no header");
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["kind"], "unparseable_document");
    }
}
