use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Reading a source file failed. The document is reported and skipped.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),
}

/// Why a recognised document produced no email record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionFailure {
    #[error("no usable sender")]
    MissingSender,

    #[error("no timestamp field")]
    MissingTimestamp,

    #[error("recipient field present but no recipient could be read")]
    AmbiguousRecipients,

    #[error("message block has no GUID")]
    MissingGuid,

    #[error("message block has no text")]
    EmptyMessage,
}

/// Errors that end a whole run. Document content never produces these.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("run cancelled before {stage}")]
    Cancelled { stage: &'static str },

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
}
