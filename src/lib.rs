pub mod address;
pub mod aliases;
pub mod body;
pub mod config;
pub mod dedup;
pub mod diagnostics;
pub mod document;
pub mod email;
pub mod error;
pub mod extraction;
pub mod format;
pub mod normalization;
pub mod pipeline;
pub mod statistics;
pub mod subject;
pub mod tagging;
pub mod threading;
pub mod timestamp;

pub use config::PipelineConfig;
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticsReport};
pub use document::{DocumentLoader, LoadedBatch, RawDocument};
pub use email::{Conversation, EmailRecord, Fingerprint, RecordFlags, RecordOrigin};
pub use error::{ExtractionFailure, LoadError, PipelineError};
pub use format::DocumentFormat;
pub use pipeline::{Pipeline, PipelineOutput};
pub use statistics::ArchiveStatistics;
pub use tagging::RecordTagger;
pub use timestamp::Timestamp;
