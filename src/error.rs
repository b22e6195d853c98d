//! Per-asset compression errors.
//!
//! None of these abort a build pass: each is scoped to one asset (or one
//! embedded literal), recorded in the ledger, and the original bytes stay
//! in the output.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompressError {
    #[error("unable to detect file type")]
    UnknownFormat,

    #[error("no compressor available for {0}")]
    NoApplicableCompressor(String),

    #[error("{message}")]
    Compressor { name: String, message: String },

    // NOTE: no #[source] here - the last error is already part of the message
    #[error("no compressor succeeded{}", describe_last(.last))]
    NoCompressorSucceeded { last: Option<Box<CompressError>> },

    #[error("invalid base64 payload: {0}")]
    InvalidEmbedded(String),

    #[error("task aborted: {0}")]
    Aborted(String),
}

impl CompressError {
    pub fn compressor(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compressor {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Name of the backend this error came from, if any.
    pub fn compressor_name(&self) -> Option<&str> {
        match self {
            Self::Compressor { name, .. } => Some(name),
            Self::NoCompressorSucceeded { last: Some(last) } => last.compressor_name(),
            _ => None,
        }
    }
}

fn describe_last(last: &Option<Box<CompressError>>) -> String {
    last.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
}
