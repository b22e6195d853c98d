//! asset-squeeze - best-of-N image compression for bundler plugins.
//!
//! Every emitted image runs through all applicable compressor backends
//! concurrently; the smallest output wins and is kept only when it is
//! strictly smaller than the source. Results are cached by content digest,
//! base64 data URIs inside JS/CSS chunks get the same treatment, and every
//! outcome lands in a ledger rendered as a report at the end of the build.
//!
//! Start from [`Session`]; the lower layers ([`Orchestrator`],
//! [`Rewriter`], [`CompressorRegistry`], [`ContentCache`], [`Ledger`]) are
//! public for hosts that drive the engine directly.

pub mod cache;
pub mod compress;
pub mod compressor;
pub mod config;
pub mod error;
pub mod format;
pub mod ledger;
pub mod logger;
pub mod session;

pub use cache::{CacheError, ContentCache, ContentDigest};
pub use compress::{Asset, CompressionOutcome, Improved, Orchestrator, Rewriter, Rewritten};
pub use compressor::{
    Applicability, Compressor, CompressorContext, CompressorRef, CompressorRegistry, FnCompressor,
};
pub use config::{CompressConfig, ConfigError, Switch};
pub use error::CompressError;
pub use format::{Format, identify};
pub use ledger::{Ledger, LedgerRecord, RecordEntry, Summary};
pub use session::{BundleAsset, BundleHost, Session, SessionBuilder, Substitution};
