use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::aliases::AliasResolver;
use crate::config::PipelineConfig;
use crate::dedup::Deduplicator;
use crate::diagnostics::{Diagnostic, DiagnosticsReport};
use crate::document::{LoadedBatch, RawDocument};
use crate::email::{Conversation, EmailRecord};
use crate::error::PipelineError;
use crate::extraction::FieldExtractor;
use crate::format::{DocumentFormat, FormatDetector};
use crate::normalization::OcrNormalizer;
use crate::statistics::ArchiveStatistics;
use crate::tagging::RecordTagger;
use crate::threading::{self, Threader};

/// Result of a run: every deduplicated record sits in exactly one
/// conversation, and every document that yielded nothing is in the report.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub conversations: Vec<Conversation>,
    /// The deduplicated record set, ordered by fingerprint.
    #[serde(skip)]
    pub records: Vec<Arc<EmailRecord>>,
    pub diagnostics: DiagnosticsReport,
}

impl PipelineOutput {
    pub fn conversations_with_participant(&self, identity: &str) -> Vec<&Conversation> {
        threading::conversations_with_participant(&self.conversations, identity)
    }

    pub fn principal_conversations(&self) -> Vec<&Conversation> {
        threading::principal_conversations(&self.conversations)
    }

    pub fn statistics(&self, config: &PipelineConfig, top: usize) -> ArchiveStatistics {
        ArchiveStatistics::from_conversations(&self.conversations, config, top)
    }
}

/// Loader output in, conversations out. Per-document work runs in parallel;
/// alias resolution, dedup and threading each see the whole set.
pub struct Pipeline {
    config: PipelineConfig,
    normalizer: OcrNormalizer,
    detector: FormatDetector,
    extractor: FieldExtractor,
    tagger: RecordTagger,
    threader: Threader,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            normalizer: OcrNormalizer::new(&config),
            detector: FormatDetector::new(&config),
            extractor: FieldExtractor::new(&config),
            tagger: RecordTagger::new(&config),
            threader: Threader::new(&config),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Normalize, detect and extract one document.
    pub fn process_document(&self, document: &RawDocument) -> Result<Vec<EmailRecord>, Diagnostic> {
        let path = document.source_path();
        let text = self.normalizer.normalize(document.raw_text());
        let detection = self.detector.detect(&text);

        if detection.format == DocumentFormat::Unparseable {
            let reason = detection
                .reason
                .unwrap_or_else(|| "no recognisable header".to_string());
            warn!("Unparseable document {}: {}", path, reason);
            return Err(Diagnostic::unparseable(path, reason));
        }
        debug!("{} detected as {:?}", path, detection.format);

        self.extractor
            .extract(&detection, &text, path)
            .map_err(|failure| {
                warn!("Extraction failed for {}: {}", path, failure);
                Diagnostic::extraction(path, &failure)
            })
    }

    pub fn run(&self, documents: &[RawDocument]) -> Result<PipelineOutput, PipelineError> {
        self.run_cancellable(documents, &AtomicBool::new(false))
    }

    pub fn run_cancellable(
        &self,
        documents: &[RawDocument],
        cancel: &AtomicBool,
    ) -> Result<PipelineOutput, PipelineError> {
        self.execute(documents, Vec::new(), cancel)
    }

    /// Runs a loaded batch. Files the loader could not read are reported as
    /// unparseable documents.
    pub fn run_batch(
        &self,
        batch: LoadedBatch,
        cancel: &AtomicBool,
    ) -> Result<PipelineOutput, PipelineError> {
        let unreadable = batch
            .failures
            .iter()
            .map(|(path, error)| Diagnostic::unparseable(path, error.to_string()))
            .collect();
        self.execute(&batch.documents, unreadable, cancel)
    }

    fn execute(
        &self,
        documents: &[RawDocument],
        unreadable: Vec<Diagnostic>,
        cancel: &AtomicBool,
    ) -> Result<PipelineOutput, PipelineError> {
        let mut report = DiagnosticsReport {
            documents_in: documents.len() + unreadable.len(),
            ..Default::default()
        };
        for diagnostic in unreadable {
            report.record_failure(diagnostic);
        }

        check_cancelled(cancel, "extraction")?;
        let mut ordered: Vec<&RawDocument> = documents.iter().collect();
        ordered.sort_by(|a, b| a.source_path().cmp(b.source_path()));

        info!("Extracting {} documents", ordered.len());
        let outcomes = self.in_pool(|| {
            ordered
                .par_iter()
                .map(|document| self.process_document(document))
                .collect::<Vec<_>>()
        })?;

        let mut candidates = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(records) => {
                    report.documents_parsed += 1;
                    candidates.extend(records);
                }
                Err(diagnostic) => report.record_failure(diagnostic),
            }
        }
        report.candidates_extracted = candidates.len();
        info!(
            "Extracted {} candidates from {} documents ({} failed)",
            candidates.len(),
            report.documents_parsed,
            report.documents_failed
        );

        if self.config.extraction.resolve_aliases {
            check_cancelled(cancel, "alias resolution")?;
            let mut aliases = AliasResolver::new(&self.config);
            aliases.learn(&candidates);
            info!("Resolving sender aliases ({} known)", aliases.len());
            candidates = aliases.apply(&candidates);
        }

        self.tagger.tag_all(&mut candidates);

        check_cancelled(cancel, "dedup")?;
        let deduped = Deduplicator::deduplicate(candidates);
        report.records_after_dedup = deduped.records.len();
        report.duplicates_merged = deduped.merged;
        report.unparsed_timestamps = deduped
            .records
            .iter()
            .filter(|r| r.timestamp.is_unparsed())
            .count();
        info!(
            "{} records after dedup ({} duplicates merged)",
            deduped.records.len(),
            deduped.merged
        );

        check_cancelled(cancel, "threading")?;
        let conversations = self.threader.thread(&deduped.records);
        report.conversations = conversations.len();
        report.finalize();
        info!("Built {} conversations", conversations.len());
        info!("{}", report);

        Ok(PipelineOutput {
            conversations,
            records: deduped.records,
            diagnostics: report,
        })
    }

    /// Runs `work` in a pool of the configured size, or in rayon's global
    /// pool when no size is set.
    fn in_pool<T, F>(&self, work: F) -> Result<T, PipelineError>
    where
        T: Send,
        F: FnOnce() -> T + Send,
    {
        match self.config.workers {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;
                Ok(pool.install(work))
            }
            None => Ok(work()),
        }
    }
}

fn check_cancelled(cancel: &AtomicBool, stage: &'static str) -> Result<(), PipelineError> {
    if cancel.load(Ordering::SeqCst) {
        warn!("Cancellation requested, stopping before {stage}");
        return Err(PipelineError::Cancelled { stage });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticKind;

    fn pipeline() -> Pipeline {
        Pipeline::new(PipelineConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.dedup.fingerprint_prefix_len = 0;
        assert!(matches!(
            Pipeline::new(config),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_process_document_normalizes_before_detection() {
        let doc = RawDocument::new(
            "a.txt",
            "From: Jeffrey Epstein [mailto:jeevacation@gmail.corn]\r\nSent: 1/5/2015 9:O0 AM\r\nTo: b @ X.com\r\nSubject: Hi\r\n\r\nok\r\n",
        );
        let records = pipeline().process_document(&doc).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sender, "jeevacation@gmail.com");
        assert_eq!(records[0].recipients, vec!["b@x.com"]);
        assert!(records[0].timestamp.parsed().is_some());
    }

    #[test]
    fn test_failures_reported_not_raised() {
        let docs = vec![
            RawDocument::new("good.txt", "From: a@x.com\nSent: 1/5/2015 9:00 AM\nTo: b@x.com\nSubject: Hi\n\nhello\n"),
            RawDocument::new("prose.txt", "Just some scanned letter text.\n"),
            RawDocument::new("nosender.txt", "From: [redacted]\nSent: 1/5/2015 9:00 AM\nTo: b@x.com\n\nhello\n"),
        ];
        let output = pipeline().run(&docs).unwrap();
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.conversations.len(), 1);

        let report = &output.diagnostics;
        assert_eq!(report.documents_in, 3);
        assert_eq!(report.documents_parsed, 1);
        assert_eq!(report.documents_failed, 2);
        assert_eq!(report.failures[0].source_path, "nosender.txt");
        assert_eq!(report.failures[0].kind, DiagnosticKind::ExtractionFailure);
        assert_eq!(report.failures[1].kind, DiagnosticKind::UnparseableDocument);
    }

    #[test]
    fn test_oversized_window_rejected_not_panicking() {
        let mut config = PipelineConfig::default();
        config.threading.proximity_window_hours = i64::MAX;
        assert!(matches!(
            Pipeline::new(config),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_records_tagged_after_alias_resolution() {
        let docs = vec![RawDocument::new(
            "a.txt",
            "From: Lesley Groff\nSent: 1/5/2015 9:00 AM\nTo: b@x.com\nSubject: Hi\n\nhello\n",
        )];
        let output = pipeline().run(&docs).unwrap();
        let flags = &output.records[0].flags;
        assert!(flags.associate_sender);
        assert_eq!(flags.associates, vec!["Lesley Groff"]);
    }

    #[test]
    fn test_cancelled_before_extraction() {
        let cancel = AtomicBool::new(true);
        let result = pipeline().run_cancellable(&[], &cancel);
        assert!(matches!(
            result,
            Err(PipelineError::Cancelled { stage: "extraction" })
        ));
    }

    #[test]
    fn test_alias_resolution_merges_name_only_copy() {
        let docs = vec![
            RawDocument::new(
                "a.txt",
                "From: Jeffrey Epstein [mailto:jeevacation@gmail.com]\nSent: 1/5/2015 9:00 AM\nTo: b@x.com\nSubject: Hi\n\nhello there\n",
            ),
            RawDocument::new(
                "b.txt",
                "From: Jeffrey Epstein\nSent: 1/5/2015 9:00 AM\nTo: b@x.com\nSubject: Hi\n\nhello there\n",
            ),
        ];
        let output = pipeline().run(&docs).unwrap();
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].source_paths.len(), 2);
        assert_eq!(output.diagnostics.duplicates_merged, 1);

        let mut config = PipelineConfig::default();
        config.extraction.resolve_aliases = false;
        let output = Pipeline::new(config).unwrap().run(&docs).unwrap();
        assert_eq!(output.records.len(), 2);
    }

    #[test]
    fn test_sized_worker_pool() {
        let mut config = PipelineConfig::default();
        config.workers = Some(2);
        let docs: Vec<RawDocument> = (0..8)
            .map(|i| {
                RawDocument::new(
                    format!("{i}.txt"),
                    format!("From: a{i}@x.com\nSent: 1/{}/2015 9:00 AM\nTo: b@x.com\nSubject: Note {i}\n\nbody {i}\n", i + 1),
                )
            })
            .collect();
        let output = Pipeline::new(config).unwrap().run(&docs).unwrap();
        assert_eq!(output.records.len(), 8);
        assert_eq!(output.diagnostics.documents_parsed, 8);
    }

    #[test]
    fn test_load_failures_counted() {
        let batch = LoadedBatch {
            documents: vec![RawDocument::new("ok.txt", "From: a@x.com\nSent: 1/5/2015 9:00 AM\nTo: b@x.com\n\nhi\n")],
            failures: vec![(
                "gone.txt".to_string(),
                crate::error::LoadError::NotAFile("gone.txt".into()),
            )],
        };
        let output = pipeline().run_batch(batch, &AtomicBool::new(false)).unwrap();
        assert_eq!(output.diagnostics.documents_in, 2);
        assert_eq!(output.diagnostics.documents_failed, 1);
        assert_eq!(output.diagnostics.failures[0].kind, DiagnosticKind::UnparseableDocument);
    }
}
