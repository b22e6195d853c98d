//! Reporting ledger.
//!
//! Append-only record of per-asset outcomes for one build. Each asset or
//! embedded literal the engine touches produces exactly one record. The
//! summary is recomputed from the records on demand.

mod report;

use parking_lot::Mutex;

use crate::compress::CompressionOutcome;

pub use report::render_report;

/// Size/compressor/error projection of an outcome (no output bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEntry {
    Improved {
        before: usize,
        after: usize,
        compressor: String,
    },
    /// Ran but was not strictly smaller; the original was kept.
    Skipped {
        before: usize,
        after: usize,
        compressor: String,
    },
    Failed {
        compressor: Option<String>,
        message: String,
    },
}

impl From<&CompressionOutcome> for RecordEntry {
    fn from(outcome: &CompressionOutcome) -> Self {
        match outcome {
            CompressionOutcome::Improved(improved) => Self::Improved {
                before: improved.source_size(),
                after: improved.output_size(),
                compressor: improved.compressor().to_string(),
            },
            CompressionOutcome::NotImproved {
                source_size,
                output_size,
                compressor,
            } => Self::Skipped {
                before: *source_size,
                after: *output_size,
                compressor: compressor.clone(),
            },
            CompressionOutcome::Failed { error, compressor } => Self::Failed {
                compressor: compressor.clone(),
                message: error.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    pub id: String,
    pub entry: RecordEntry,
}

/// Aggregate counts. Byte totals cover improved records only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub improved: usize,
    pub not_improved: usize,
    pub failed: usize,
    pub total_before: u64,
    pub total_after: u64,
}

impl Summary {
    /// Build status for the report header.
    ///
    /// `succeeded` when something improved and nothing failed, `completed`
    /// when something improved despite failures, `failed` otherwise.
    pub fn status(&self) -> &'static str {
        match (self.improved, self.failed) {
            (0, _) => "failed",
            (_, 0) => "succeeded",
            _ => "completed",
        }
    }

    /// Saved bytes as a percentage of `total_before`.
    pub fn reduction_percent(&self) -> f64 {
        if self.total_before == 0 {
            return 0.0;
        }
        (self.total_before - self.total_after) as f64 / self.total_before as f64 * 100.0
    }
}

/// Outcome ledger (thread-safe, append-only).
#[derive(Debug, Default)]
pub struct Ledger {
    records: Mutex<Vec<LedgerRecord>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: impl Into<String>, outcome: &CompressionOutcome) {
        self.records.lock().push(LedgerRecord {
            id: id.into(),
            entry: outcome.into(),
        });
    }

    /// Snapshot of all records in append order.
    pub fn records(&self) -> Vec<LedgerRecord> {
        self.records.lock().clone()
    }

    pub fn summary(&self) -> Summary {
        self.records
            .lock()
            .iter()
            .fold(Summary::default(), |mut acc, record| {
                acc.total += 1;
                match &record.entry {
                    RecordEntry::Improved { before, after, .. } => {
                        acc.improved += 1;
                        acc.total_before += *before as u64;
                        acc.total_after += *after as u64;
                    }
                    RecordEntry::Skipped { .. } => acc.not_improved += 1,
                    RecordEntry::Failed { .. } => acc.failed += 1,
                }
                acc
            })
    }

    /// Forget all records (start of a new build).
    pub fn reset(&self) {
        self.records.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Render the report line by line into `print`.
    pub fn print_report(&self, print: &mut dyn FnMut(&str)) {
        let records = self.records();
        render_report(&records, &self.summary(), print);
    }
}
