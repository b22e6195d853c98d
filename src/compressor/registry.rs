//! Compressor registry.
//!
//! Names are unique: registering a second compressor under a taken name is a
//! no-op, so the first registration wins. Built-ins are loaded lazily on first
//! use, ahead of user compressors and in fixed priority order; a built-in
//! whose name a user compressor already holds is skipped (the user's
//! compressor shadows it).

use std::sync::{Arc, Once};

use parking_lot::RwLock;
use tokio::sync::OnceCell;

use super::{BUILTINS, CompressorContext, CompressorRef};
use crate::config::{BUILTIN_BACKENDS, CompressConfig};
use crate::error::CompressError;
use crate::format::Format;
use crate::{debug, log};

/// A compressor plus its memoized `init` outcome.
pub struct RegisteredCompressor {
    compressor: CompressorRef,
    ctx: CompressorContext,
    ready: OnceCell<Result<(), String>>,
}

impl RegisteredCompressor {
    fn new(compressor: CompressorRef, config: &Arc<CompressConfig>) -> Self {
        let ctx = CompressorContext::new(compressor.name(), Arc::clone(config));
        Self {
            compressor,
            ctx,
            ready: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.compressor.name()
    }

    /// Run `init` once; concurrent callers all await the same run.
    pub async fn ensure_ready(&self) -> Result<(), CompressError> {
        let state = self
            .ready
            .get_or_init(|| async {
                self.compressor.init(&self.ctx).await.map_err(|err| {
                    log!("error"; "failed to initialize compressor `{}`: {:#}", self.name(), err);
                    format!("{err:#}")
                })
            })
            .await;

        state.clone().map_err(|message| {
            CompressError::compressor(self.name(), format!("init failed: {message}"))
        })
    }

    /// Compress with this backend after its init has completed.
    pub async fn compress(
        &self,
        input: &[u8],
        format: &Format,
    ) -> Result<Option<Vec<u8>>, CompressError> {
        self.ensure_ready().await?;
        self.compressor
            .compress(input, format, &self.ctx)
            .await
            .map_err(|err| CompressError::compressor(self.name(), format!("{err:#}")))
    }
}

/// Registry of available compressors for one session.
pub struct CompressorRegistry {
    config: Arc<CompressConfig>,
    entries: RwLock<Vec<Arc<RegisteredCompressor>>>,
    builtins: bool,
    builtins_loaded: Once,
}

impl CompressorRegistry {
    /// Registry that loads the built-in backends on first use.
    pub fn with_builtins(config: Arc<CompressConfig>) -> Self {
        Self::new(config, true)
    }

    /// Registry holding only explicitly registered compressors.
    pub fn without_builtins(config: Arc<CompressConfig>) -> Self {
        Self::new(config, false)
    }

    fn new(config: Arc<CompressConfig>, builtins: bool) -> Self {
        Self {
            config,
            entries: RwLock::new(Vec::new()),
            builtins,
            builtins_loaded: Once::new(),
        }
    }

    /// Register a compressor. Returns `false` if the name is already taken.
    pub fn register(&self, compressor: CompressorRef) -> bool {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.name() == compressor.name()) {
            debug!("compress"; "compressor `{}` already registered, ignoring", compressor.name());
            return false;
        }
        entries.push(Arc::new(RegisteredCompressor::new(compressor, &self.config)));
        true
    }

    fn ensure_builtins(&self) {
        if !self.builtins {
            return;
        }
        self.builtins_loaded.call_once(|| {
            let mut entries = self.entries.write();
            let users = std::mem::take(&mut *entries);
            let builtins = BUILTINS
                .iter()
                .filter(|(name, _)| !users.iter().any(|e| e.name() == *name))
                .map(|(_, create)| Arc::new(RegisteredCompressor::new(create(), &self.config)));
            entries.extend(builtins);
            entries.extend(users);
        });
    }

    /// Enabled compressors that claim `format`, in registry order.
    pub fn applicable(&self, format: &Format) -> Vec<Arc<RegisteredCompressor>> {
        self.ensure_builtins();
        self.entries
            .read()
            .iter()
            .filter(|e| !self.config.is_disabled(e.name()))
            .filter(|e| e.compressor.applies_to(format))
            .cloned()
            .collect()
    }

    /// Registered names in registry order.
    pub fn names(&self) -> Vec<String> {
        self.ensure_builtins();
        self.entries
            .read()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ensure_builtins();
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Await the `init` hook of every enabled compressor.
    pub async fn init_all(&self) {
        self.ensure_builtins();
        self.warn_unknown_backends();

        let entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .filter(|e| !self.config.is_disabled(e.name()))
            .cloned()
            .collect();

        let handles: Vec<_> = entries
            .into_iter()
            .map(|entry| tokio::spawn(async move { entry.ensure_ready().await }))
            .collect();
        for handle in handles {
            // Failures are logged and memoized by `ensure_ready`.
            let _ = handle.await;
        }
    }

    fn warn_unknown_backends(&self) {
        let entries = self.entries.read();
        for name in self.config.configured_backends() {
            let known = BUILTIN_BACKENDS.contains(&name) || entries.iter().any(|e| e.name() == name);
            if !known {
                log!("warning"; "`backends.{}` does not match any registered compressor", name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::{Applicability, Compressor, FnCompressor};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const PNG: Format = Format::new("image/png", "png");

    fn fixed(name: &str, out: &'static [u8]) -> CompressorRef {
        FnCompressor::new(name, Applicability::Any, move |_, _, _| Ok(Some(out.to_vec()))).shared()
    }

    fn config(toml: &str) -> Arc<CompressConfig> {
        Arc::new(CompressConfig::parse(toml).unwrap())
    }

    #[tokio::test]
    async fn test_duplicate_name_first_wins() {
        let registry = CompressorRegistry::without_builtins(config(""));
        assert!(registry.register(fixed("dup", b"first")));
        assert!(!registry.register(fixed("dup", b"second")));

        let applicable = registry.applicable(&PNG);
        assert_eq!(applicable.len(), 1);
        let out = applicable[0].compress(b"input", &PNG).await.unwrap();
        assert_eq!(out.as_deref(), Some(&b"first"[..]));
    }

    #[test]
    fn test_builtins_loaded_lazily_in_priority_order() {
        let registry = CompressorRegistry::with_builtins(config(""));
        registry.register(fixed("custom", b"x"));
        assert_eq!(
            registry.names(),
            vec!["raster", "avif", "svg", "tinypng", "custom"]
        );
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_user_compressor_shadows_builtin() {
        let registry = CompressorRegistry::with_builtins(config(""));
        registry.register(fixed("svg", b"x"));
        assert_eq!(registry.names(), vec!["raster", "avif", "svg", "tinypng"]);

        // The shadowing compressor claims every format; the builtin would not.
        let applicable = registry.applicable(&PNG);
        let names: Vec<_> = applicable.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["raster", "svg"]);
    }

    #[test]
    fn test_disabled_and_filtered() {
        let registry = CompressorRegistry::with_builtins(config("raster = false"));
        registry.register(
            FnCompressor::new("jpeg-only", Applicability::pattern("jpe?g").unwrap(), |_, _, _| {
                Ok(None)
            })
            .shared(),
        );
        assert!(registry.applicable(&PNG).is_empty());

        let svg: Vec<_> = registry
            .applicable(&Format::SVG)
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(svg, vec!["svg"]);
    }

    #[test]
    fn test_custom_disabled_by_backends_table() {
        let registry = CompressorRegistry::without_builtins(config("[backends]\noff = false"));
        registry.register(fixed("off", b"x"));
        registry.register(fixed("on", b"x"));
        let names: Vec<_> = registry
            .applicable(&PNG)
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["on"]);
    }

    struct CountingInit {
        inits: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Compressor for CountingInit {
        fn name(&self) -> &str {
            "counting"
        }

        async fn init(&self, _ctx: &CompressorContext) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("missing credentials");
            }
            Ok(())
        }

        async fn compress(
            &self,
            _input: &[u8],
            _format: &Format,
            _ctx: &CompressorContext,
        ) -> Result<Option<Vec<u8>>> {
            Ok(Some(vec![1]))
        }
    }

    #[tokio::test]
    async fn test_init_runs_once_for_concurrent_callers() {
        let inits = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(CompressorRegistry::without_builtins(config("")));
        registry.register(Arc::new(CountingInit {
            inits: Arc::clone(&inits),
            fail: false,
        }));

        let entry = registry.applicable(&PNG).remove(0);
        let calls: Vec<_> = (0..4)
            .map(|_| {
                let entry = Arc::clone(&entry);
                tokio::spawn(async move { entry.compress(b"abc", &PNG).await })
            })
            .collect();
        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }
        registry.init_all().await;
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_init_is_memoized_as_error() {
        let inits = Arc::new(AtomicUsize::new(0));
        let registry = CompressorRegistry::without_builtins(config(""));
        registry.register(Arc::new(CountingInit {
            inits: Arc::clone(&inits),
            fail: true,
        }));
        registry.init_all().await;

        let entry = registry.applicable(&PNG).remove(0);
        let err = entry.compress(b"abc", &PNG).await.unwrap_err();
        assert_eq!(err.compressor_name(), Some("counting"));
        assert!(err.to_string().contains("missing credentials"));
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }
}
