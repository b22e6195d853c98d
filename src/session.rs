//! Build session: the surface a bundler integration talks to.
//!
//! A [`Session`] owns everything one build needs (registry, cache, ledger,
//! orchestrator and rewriter) and is threaded through explicitly; there is
//! no process-wide state apart from the logger's verbose flag.
//!
//! ```ignore
//! let session = Session::builder(config).root(host.build_root()).build()?;
//! session.start().await;
//! session.on_bundle_assets(&mut host).await;
//! session.on_done(&mut |line| println!("{line}"));
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::ContentCache;
use crate::compress::{Asset, CompressionOutcome, Orchestrator, Rewriter};
use crate::compressor::{CompressorRef, CompressorRegistry};
use crate::config::CompressConfig;
use crate::error::CompressError;
use crate::ledger::Ledger;
use crate::{debug, log, logger};

/// One emitted build output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleAsset {
    /// An emitted file (image, font, ...).
    Binary { id: String, bytes: Arc<[u8]> },
    /// A JS/CSS chunk that may carry embedded data URIs.
    Text { id: String, text: String },
}

impl BundleAsset {
    pub fn binary(id: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Binary {
            id: id.into(),
            bytes: bytes.into(),
        }
    }

    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Text {
            id: id.into(),
            text: text.into(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Binary { id, .. } | Self::Text { id, .. } => id,
        }
    }
}

/// A replacement the host should apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Substitution {
    Binary { id: String, bytes: Arc<[u8]> },
    Text { id: String, text: String },
}

impl Substitution {
    pub fn id(&self) -> &str {
        match self {
            Self::Binary { id, .. } | Self::Text { id, .. } => id,
        }
    }
}

/// Hooks provided by the bundler integration.
pub trait BundleHost: Send {
    /// Emitted outputs of the current build.
    fn assets(&self) -> Vec<BundleAsset>;

    fn replace_asset(&mut self, id: &str, bytes: Arc<[u8]>);

    fn replace_chunk_text(&mut self, id: &str, text: String);

    /// Root the cache directory is resolved against.
    fn build_root(&self) -> PathBuf;
}

// ============================================================================
// SessionBuilder
// ============================================================================

pub struct SessionBuilder {
    config: CompressConfig,
    root: PathBuf,
    compressors: Vec<CompressorRef>,
    builtins: bool,
    concurrency: Option<usize>,
}

impl SessionBuilder {
    pub fn new(config: CompressConfig) -> Self {
        Self {
            config,
            root: PathBuf::from("."),
            compressors: Vec::new(),
            builtins: true,
            concurrency: None,
        }
    }

    /// Build root the cache directory is relative to.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Add a custom backend. Registration order is tie-break order.
    pub fn compressor(mut self, compressor: CompressorRef) -> Self {
        self.compressors.push(compressor);
        self
    }

    /// Load the `raster` and `svg` backends (default: on).
    pub fn builtins(mut self, enabled: bool) -> Self {
        self.builtins = enabled;
        self
    }

    /// Override `concurrency` from the config.
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn build(self) -> Result<Session> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let registry = Arc::new(if self.builtins {
            CompressorRegistry::with_builtins(Arc::clone(&config))
        } else {
            CompressorRegistry::without_builtins(Arc::clone(&config))
        });
        for compressor in self.compressors {
            registry.register(compressor);
        }

        let cache = match config.cache_dir(&self.root) {
            Some(dir) => {
                let cache = ContentCache::open(&dir)
                    .with_context(|| format!("Failed to open cache at {}", dir.display()))?;
                Some(Arc::new(cache))
            }
            None => None,
        };

        let ledger = Arc::new(Ledger::new());
        let mut orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            cache.clone(),
            Arc::clone(&ledger),
            Arc::clone(&config),
        );
        if let Some(limit) = self.concurrency {
            orchestrator = orchestrator.with_concurrency(limit);
        }
        let rewriter = Rewriter::new(orchestrator.clone());

        Ok(Session {
            config,
            registry,
            cache,
            ledger,
            orchestrator,
            rewriter,
        })
    }
}

// ============================================================================
// Session
// ============================================================================

/// Context of one build invocation.
pub struct Session {
    config: Arc<CompressConfig>,
    registry: Arc<CompressorRegistry>,
    cache: Option<Arc<ContentCache>>,
    ledger: Arc<Ledger>,
    orchestrator: Orchestrator,
    rewriter: Rewriter,
}

impl Session {
    pub fn builder(config: CompressConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    pub fn config(&self) -> &CompressConfig {
        &self.config
    }

    pub fn registry(&self) -> &CompressorRegistry {
        &self.registry
    }

    pub fn cache(&self) -> Option<&ContentCache> {
        self.cache.as_deref()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn rewriter(&self) -> &Rewriter {
        &self.rewriter
    }

    /// Start of a build: reset the ledger and run every backend's `init`.
    pub async fn start(&self) {
        logger::set_verbose(self.config.verbose());
        self.ledger.reset();
        self.registry.init_all().await;
        debug!("compress"; "backends: {}", self.registry.names().join(", "));
    }

    /// Compress all `assets` concurrently.
    ///
    /// Returns substitutions for improved binaries and changed text chunks,
    /// in input order. Everything else is left to the host untouched.
    pub async fn process(&self, assets: Vec<BundleAsset>) -> Vec<Substitution> {
        let handles: Vec<_> = assets
            .into_iter()
            .map(|asset| {
                let id = asset.id().to_string();
                let orchestrator = self.orchestrator.clone();
                let rewriter = self.rewriter.clone();
                let is_binary = matches!(asset, BundleAsset::Binary { .. });
                let handle =
                    tokio::spawn(async move { process_one(&orchestrator, &rewriter, asset).await });
                (id, is_binary, handle)
            })
            .collect();

        let mut substitutions = Vec::new();
        for (id, is_binary, handle) in handles {
            match handle.await {
                Ok(Some(substitution)) => substitutions.push(substitution),
                Ok(None) => {}
                Err(err) => {
                    log!("error"; "processing {} aborted: {}", id, err);
                    if is_binary {
                        let outcome =
                            CompressionOutcome::failed(CompressError::Aborted(err.to_string()));
                        self.orchestrator.record(&id, &outcome);
                    }
                }
            }
        }
        substitutions
    }

    /// Process the host's assets and apply the replacements.
    ///
    /// Returns the number of substitutions applied.
    pub async fn on_bundle_assets(&self, host: &mut dyn BundleHost) -> usize {
        let substitutions = self.process(host.assets()).await;
        let count = substitutions.len();
        for substitution in substitutions {
            match substitution {
                Substitution::Binary { id, bytes } => host.replace_asset(&id, bytes),
                Substitution::Text { id, text } => host.replace_chunk_text(&id, text),
            }
        }
        count
    }

    /// End of a build: print the report unless `logger = false`.
    pub fn on_done(&self, print: &mut dyn FnMut(&str)) {
        if self.config.report_enabled() {
            self.ledger.print_report(print);
        }
    }
}

async fn process_one(
    orchestrator: &Orchestrator,
    rewriter: &Rewriter,
    asset: BundleAsset,
) -> Option<Substitution> {
    match asset {
        BundleAsset::Binary { id, bytes } => {
            let asset = Asset { id, bytes };
            let outcome = orchestrator.compress(&asset).await;
            let improved = outcome.improved()?;
            Some(Substitution::Binary {
                id: asset.id,
                bytes: Arc::clone(improved.output()),
            })
        }
        BundleAsset::Text { id, text } => {
            let rewritten = rewriter.rewrite(&id, &text).await;
            rewritten.changed().then(|| Substitution::Text {
                id,
                text: rewritten.text,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::{Applicability, FnCompressor};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use std::collections::BTreeMap;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

    fn png(len: usize) -> Vec<u8> {
        let mut bytes = PNG_MAGIC.to_vec();
        bytes.resize(len, 0);
        bytes
    }

    /// Keeps the first 16 bytes of anything it sees.
    fn truncate() -> CompressorRef {
        FnCompressor::new("truncate", Applicability::Any, |input, _, _| {
            Ok(Some(input[..input.len().min(16)].to_vec()))
        })
        .shared()
    }

    #[derive(Default)]
    struct MockHost {
        assets: Vec<BundleAsset>,
        binaries: BTreeMap<String, Arc<[u8]>>,
        texts: BTreeMap<String, String>,
    }

    impl BundleHost for MockHost {
        fn assets(&self) -> Vec<BundleAsset> {
            self.assets.clone()
        }

        fn replace_asset(&mut self, id: &str, bytes: Arc<[u8]>) {
            self.binaries.insert(id.to_string(), bytes);
        }

        fn replace_chunk_text(&mut self, id: &str, text: String) {
            self.texts.insert(id.to_string(), text);
        }

        fn build_root(&self) -> PathBuf {
            PathBuf::from(".")
        }
    }

    fn session(toml: &str) -> Session {
        Session::builder(CompressConfig::parse(toml).unwrap())
            .builtins(false)
            .compressor(truncate())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_on_bundle_assets_applies_only_improvements() {
        let session = session("cache = false");
        session.start().await;

        let literal = format!("data:image/png;base64,{}", STANDARD.encode(png(64)));
        let mut host = MockHost {
            assets: vec![
                BundleAsset::binary("big.png", png(100)),
                BundleAsset::binary("tiny.png", png(12)),
                BundleAsset::binary("notes.txt", b"plain text".to_vec()),
                BundleAsset::text("main.js", format!("img.src='{literal}'")),
                BundleAsset::text("plain.js", "console.log(1)"),
            ],
            ..MockHost::default()
        };

        let applied = session.on_bundle_assets(&mut host).await;
        assert_eq!(applied, 2);
        assert_eq!(host.binaries.len(), 1);
        assert_eq!(host.binaries["big.png"].len(), 16);
        assert_eq!(
            host.texts["main.js"],
            format!("img.src='data:image/png;base64,{}'", STANDARD.encode(png(16)))
        );

        // big.png, tiny.png, notes.txt and one literal
        let summary = session.ledger().summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.improved, 2);
        assert_eq!(summary.not_improved, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_start_resets_ledger() {
        let session = session("cache = false");
        session.process(vec![BundleAsset::binary("a.png", png(64))]).await;
        assert_eq!(session.ledger().len(), 1);

        session.start().await;
        assert!(session.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_on_done_respects_logger_switch() {
        for (toml, expect_output) in [("cache = false", true), ("cache = false\nlogger = false", false)] {
            let session = session(toml);
            session.process(vec![BundleAsset::binary("a.png", png(64))]).await;

            let mut lines = Vec::new();
            session.on_done(&mut |line: &str| lines.push(line.to_string()));
            assert_eq!(!lines.is_empty(), expect_output, "config: {toml}");
        }
    }

    #[tokio::test]
    async fn test_cache_dir_resolved_against_root() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::builder(CompressConfig::parse("cache = { dir = \"squeeze\" }").unwrap())
            .root(dir.path())
            .builtins(false)
            .compressor(truncate())
            .build()
            .unwrap();

        assert_eq!(session.cache().and_then(|c| c.dir()), Some(dir.path().join("squeeze").as_path()));
        session.process(vec![BundleAsset::binary("a.png", png(64))]).await;
        assert_eq!(std::fs::read_dir(dir.path().join("squeeze")).unwrap().count(), 1);
    }

    #[test]
    fn test_unusable_cache_dir_fails_build() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let config = CompressConfig::parse("cache = { dir = \"file/cache\" }").unwrap();
        let err = Session::builder(config).root(dir.path()).build().err().unwrap();
        assert!(format!("{err:#}").contains("Failed to open cache"));
    }
}
