//! Tagged result of one compression attempt.

use std::sync::Arc;

use crate::error::CompressError;
use crate::format::Format;

/// Compressor name reported for cache hits.
pub const CACHE_COMPRESSOR: &str = "cache";

/// A result strictly smaller than its source.
///
/// Only [`CompressionOutcome::classify`] builds one, which keeps
/// `output_size < source_size` true for every instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Improved {
    source_size: usize,
    compressor: String,
    output: Arc<[u8]>,
    format: Format,
}

impl Improved {
    pub fn source_size(&self) -> usize {
        self.source_size
    }

    pub fn output_size(&self) -> usize {
        self.output.len()
    }

    /// Winning compressor, or [`CACHE_COMPRESSOR`].
    pub fn compressor(&self) -> &str {
        &self.compressor
    }

    pub fn output(&self) -> &Arc<[u8]> {
        &self.output
    }

    /// Detected format of the source (and of the output).
    pub fn format(&self) -> Format {
        self.format
    }

    pub fn from_cache(&self) -> bool {
        self.compressor == CACHE_COMPRESSOR
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionOutcome {
    Improved(Improved),
    /// A compressor ran but its best output was not strictly smaller.
    NotImproved {
        source_size: usize,
        output_size: usize,
        compressor: String,
    },
    Failed {
        error: CompressError,
        /// Last compressor attempted, if any.
        compressor: Option<String>,
    },
}

impl CompressionOutcome {
    /// `Improved` if `output` is strictly smaller than the source,
    /// `NotImproved` otherwise.
    pub fn classify(
        source_size: usize,
        compressor: impl Into<String>,
        output: Arc<[u8]>,
        format: Format,
    ) -> Self {
        let compressor = compressor.into();
        if output.len() < source_size {
            Self::Improved(Improved {
                source_size,
                compressor,
                output,
                format,
            })
        } else {
            Self::NotImproved {
                source_size,
                output_size: output.len(),
                compressor,
            }
        }
    }

    pub fn failed(error: CompressError) -> Self {
        let compressor = error.compressor_name().map(str::to_string);
        Self::Failed { error, compressor }
    }

    pub fn improved(&self) -> Option<&Improved> {
        match self {
            Self::Improved(improved) => Some(improved),
            _ => None,
        }
    }

    pub fn is_improved(&self) -> bool {
        matches!(self, Self::Improved(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn error(&self) -> Option<&CompressError> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}
