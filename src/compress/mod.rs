//! Compression orchestration.
//!
//! The [`Orchestrator`] turns one asset into one [`CompressionOutcome`]:
//!
//! ```text
//! bytes ──► identify ──► cache? ──► applicable compressors
//!                          │              │ (one task each)
//!                          ▼              ▼
//!                       Improved     smallest output ──► classify ──► cache write
//! ```
//!
//! Every call records exactly one ledger entry under the asset id.
//!
//! # Modules
//!
//! - [`embedded`]: base64 image data URIs inside JS/CSS text
//! - `outcome`: the tagged per-asset result

pub mod embedded;
mod outcome;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::cache::ContentCache;
use crate::compressor::{CompressorRegistry, RegisteredCompressor};
use crate::config::CompressConfig;
use crate::error::CompressError;
use crate::format::{self, Format};
use crate::ledger::Ledger;
use crate::{debug, log};

pub use embedded::{EmbeddedSpan, Occurrence, Rewriter, Rewritten, scan};
pub use outcome::{CACHE_COMPRESSOR, CompressionOutcome, Improved};

/// One unit of work: an id for the report and the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: String,
    pub bytes: Arc<[u8]>,
}

impl Asset {
    pub fn new(id: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            id: id.into(),
            bytes: bytes.into(),
        }
    }
}

/// Per-build compression context.
///
/// Cheap to clone; clones share registry, cache, ledger and the
/// concurrency permits.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<CompressorRegistry>,
    cache: Option<Arc<ContentCache>>,
    ledger: Arc<Ledger>,
    config: Arc<CompressConfig>,
    permits: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<CompressorRegistry>,
        cache: Option<Arc<ContentCache>>,
        ledger: Arc<Ledger>,
        config: Arc<CompressConfig>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency()));
        Self {
            registry,
            cache,
            ledger,
            config,
            permits,
        }
    }

    /// Override how many assets may compress at once.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    pub fn registry(&self) -> &Arc<CompressorRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn config(&self) -> &Arc<CompressConfig> {
        &self.config
    }

    /// Compress `asset` and record the outcome in the ledger.
    pub async fn compress(&self, asset: &Asset) -> CompressionOutcome {
        let outcome = self.run(&asset.bytes).await;
        self.record(&asset.id, &outcome);
        outcome
    }

    /// Record an outcome produced outside [`compress`](Self::compress).
    pub fn record(&self, id: &str, outcome: &CompressionOutcome) {
        match outcome {
            CompressionOutcome::Improved(improved) => debug!(
                "compress"; "{}: {} -> {} bytes ({})",
                id, improved.source_size(), improved.output_size(), improved.compressor()
            ),
            CompressionOutcome::NotImproved { compressor, .. } => {
                debug!("compress"; "{}: not smaller with {}, keeping original", id, compressor)
            }
            CompressionOutcome::Failed { error, .. } => {
                debug!("compress"; "{}: {}", id, error)
            }
        }
        self.ledger.record(id, outcome);
    }

    async fn run(&self, input: &Arc<[u8]>) -> CompressionOutcome {
        let Some(format) = format::identify(input) else {
            return CompressionOutcome::failed(CompressError::UnknownFormat);
        };

        if let Some(hit) = self.cached(input) {
            return CompressionOutcome::classify(input.len(), CACHE_COMPRESSOR, hit, format);
        }

        let compressors = self.registry.applicable(&format);
        if compressors.is_empty() {
            return CompressionOutcome::failed(CompressError::NoApplicableCompressor(
                format.mime().to_string(),
            ));
        }

        let Ok(_permit) = self.permits.acquire().await else {
            return CompressionOutcome::failed(CompressError::Aborted(
                "compression pool closed".into(),
            ));
        };

        let timeout = self.config.timeout();
        let handles: Vec<_> = compressors
            .into_iter()
            .map(|entry| {
                let name = entry.name().to_string();
                let input = Arc::clone(input);
                let handle = tokio::spawn(async move { call(&entry, &input, format, timeout).await });
                (name, handle)
            })
            .collect();

        // Joined in registry order: on equal size the earlier one stays.
        let mut best: Option<(String, Vec<u8>)> = None;
        let mut last_error = None;
        for (name, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    Err(CompressError::compressor(&name, "compressor panicked"))
                }
                Err(err) => Err(CompressError::compressor(&name, format!("task failed: {err}"))),
            };
            match result {
                Ok(Some(output)) => {
                    if best.as_ref().is_none_or(|(_, b)| output.len() < b.len()) {
                        best = Some((name, output));
                    }
                }
                Ok(None) => debug!("compress"; "{} declined {}", name, format),
                Err(err) => {
                    log!("compress"; "{} failed: {}", name, err);
                    last_error = Some(err);
                }
            }
        }

        let Some((name, output)) = best else {
            return CompressionOutcome::failed(CompressError::NoCompressorSucceeded {
                last: last_error.map(Box::new),
            });
        };

        let outcome = CompressionOutcome::classify(input.len(), name, Arc::from(output), format);
        if let (CompressionOutcome::Improved(improved), Some(cache)) = (&outcome, &self.cache) {
            cache.set(input, improved.output());
        }
        outcome
    }

    /// Cached output for `input`, ignoring entries that would not shrink it.
    fn cached(&self, input: &[u8]) -> Option<Arc<[u8]>> {
        let hit = self.cache.as_ref()?.get(input)?;
        if hit.len() < input.len() {
            Some(hit)
        } else {
            debug!("cache"; "ignoring cached entry that is not smaller than its source");
            None
        }
    }
}

async fn call(
    entry: &RegisteredCompressor,
    input: &[u8],
    format: Format,
    timeout: Option<Duration>,
) -> Result<Option<Vec<u8>>, CompressError> {
    let Some(limit) = timeout else {
        return entry.compress(input, &format).await;
    };
    tokio::time::timeout(limit, entry.compress(input, &format))
        .await
        .unwrap_or_else(|_| {
            Err(CompressError::compressor(
                entry.name(),
                format!("timed out after {}ms", limit.as_millis()),
            ))
        })
}
