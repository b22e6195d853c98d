//! Compressor backends.
//!
//! A backend is anything implementing [`Compressor`]: a name, an
//! applicability rule over the detected [`Format`], an optional one-time
//! `init` hook and the `compress` call itself. Built-in backends are created
//! through [`CompressorFactory`] functions; hosts can implement the trait
//! directly or wrap a closure in [`FnCompressor`].
//!
//! # Modules
//!
//! - [`registry`]: name-unique registry, lazy built-ins, memoized init
//! - `raster`: PNG/JPEG/WebP re-encoding with the `image` crate
//! - `avif`: AVIF re-encoding with `ravif`
//! - `svg`: structure-preserving SVG minification with `quick-xml`
//! - `tinypng`: the TinyPNG web API with key rotation

mod avif;
mod raster;
pub mod registry;
mod svg;
mod tinypng;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use crate::config::CompressConfig;
use crate::format::Format;

pub use avif::AvifCompressor;
pub use raster::RasterCompressor;
pub use registry::{CompressorRegistry, RegisteredCompressor};
pub use svg::SvgCompressor;
pub use tinypng::TinyPngCompressor;

/// Shared handle to a backend.
pub type CompressorRef = Arc<dyn Compressor>;

/// Constructor of a built-in backend.
pub type CompressorFactory = fn() -> CompressorRef;

/// Built-in backends in priority order (earlier wins size ties).
pub(crate) const BUILTINS: [(&str, CompressorFactory); 4] = [
    ("raster", RasterCompressor::create),
    ("avif", AvifCompressor::create),
    ("svg", SvgCompressor::create),
    ("tinypng", TinyPngCompressor::create),
];

/// A pluggable compression backend.
#[async_trait]
pub trait Compressor: Send + Sync {
    /// Unique name; also the key of the backend's config section.
    fn name(&self) -> &str;

    /// Which formats this backend handles.
    fn applicability(&self) -> Applicability {
        Applicability::Any
    }

    fn applies_to(&self, format: &Format) -> bool {
        self.applicability().matches(format)
    }

    /// One-time setup, awaited before the first `compress` call.
    async fn init(&self, _ctx: &CompressorContext) -> Result<()> {
        Ok(())
    }

    /// Compress `input`.
    ///
    /// `Ok(None)` means the backend declines this input (not applicable or
    /// nothing to gain); it is neither a success nor an error.
    async fn compress(
        &self,
        input: &[u8],
        format: &Format,
        ctx: &CompressorContext,
    ) -> Result<Option<Vec<u8>>>;
}

// ============================================================================
// Applicability
// ============================================================================

/// Format filter of a backend.
#[derive(Clone, Default)]
pub enum Applicability {
    /// Every detected format.
    #[default]
    Any,
    /// Matches the extension, the mime type, or `.<extension>`.
    Pattern(Regex),
    /// Custom predicate.
    Predicate(Arc<dyn Fn(&Format) -> bool + Send + Sync>),
}

impl Applicability {
    pub fn pattern(re: &str) -> Result<Self, regex::Error> {
        Regex::new(re).map(Self::Pattern)
    }

    pub fn predicate(f: impl Fn(&Format) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, format: &Format) -> bool {
        match self {
            Self::Any => true,
            Self::Pattern(re) => {
                re.is_match(format.extension())
                    || re.is_match(format.mime())
                    || re.is_match(&format!(".{}", format.extension()))
            }
            Self::Predicate(f) => f(format),
        }
    }
}

impl fmt::Debug for Applicability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// What a backend sees of the session: its name and the configuration.
#[derive(Debug, Clone)]
pub struct CompressorContext {
    name: String,
    config: Arc<CompressConfig>,
}

impl CompressorContext {
    pub fn new(name: impl Into<String>, config: Arc<CompressConfig>) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn config(&self) -> &CompressConfig {
        &self.config
    }

    /// The backend's `[backends.<name>]` table (empty if absent).
    pub fn options(&self) -> toml::Table {
        self.config.backend_options(&self.name)
    }
}

// ============================================================================
// FnCompressor
// ============================================================================

type CompressFn =
    dyn Fn(&[u8], &Format, &CompressorContext) -> Result<Option<Vec<u8>>> + Send + Sync;

/// A backend defined by a synchronous closure.
///
/// ```ignore
/// let strip = FnCompressor::new("strip", Applicability::pattern("png")?, |input, _, _| {
///     Ok(Some(strip_chunks(input)))
/// });
/// ```
pub struct FnCompressor {
    name: String,
    applicability: Applicability,
    compress: Box<CompressFn>,
}

impl FnCompressor {
    pub fn new<F>(name: impl Into<String>, applicability: Applicability, compress: F) -> Self
    where
        F: Fn(&[u8], &Format, &CompressorContext) -> Result<Option<Vec<u8>>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            applicability,
            compress: Box::new(compress),
        }
    }

    pub fn shared(self) -> CompressorRef {
        Arc::new(self)
    }
}

#[async_trait]
impl Compressor for FnCompressor {
    fn name(&self) -> &str {
        &self.name
    }

    fn applicability(&self) -> Applicability {
        self.applicability.clone()
    }

    async fn compress(
        &self,
        input: &[u8],
        format: &Format,
        ctx: &CompressorContext,
    ) -> Result<Option<Vec<u8>>> {
        (self.compress)(input, format, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: Format = Format::new("image/png", "png");

    #[test]
    fn test_pattern_matches_ext_mime_or_dotted() {
        assert!(Applicability::pattern("^png$").unwrap().matches(&PNG));
        assert!(Applicability::pattern("image/png").unwrap().matches(&PNG));
        assert!(Applicability::pattern(r"^\.png$").unwrap().matches(&PNG));
        assert!(!Applicability::pattern("jpe?g").unwrap().matches(&PNG));
        assert!(Applicability::pattern("svg").unwrap().matches(&Format::SVG));
    }

    #[test]
    fn test_predicate_and_any() {
        let raster_only = Applicability::predicate(|f| f.image_format().is_some());
        assert!(raster_only.matches(&PNG));
        assert!(!raster_only.matches(&Format::SVG));
        assert!(Applicability::Any.matches(&Format::SVG));
        assert_eq!(format!("{:?}", raster_only), "Predicate(..)");
    }

    #[tokio::test]
    async fn test_fn_compressor() {
        let compressor = FnCompressor::new("halve", Applicability::Any, |input, _, _| {
            Ok(Some(input[..input.len() / 2].to_vec()))
        })
        .shared();
        let ctx = CompressorContext::new("halve", Arc::new(CompressConfig::default()));

        assert_eq!(compressor.name(), "halve");
        assert!(compressor.applies_to(&PNG));
        let out = compressor.compress(b"abcd", &PNG, &ctx).await.unwrap();
        assert_eq!(out.as_deref(), Some(&b"ab"[..]));
        compressor.init(&ctx).await.unwrap();
    }

    #[test]
    fn test_context_options() {
        let config = CompressConfig::parse("[backends]\nremote = { key = \"k\" }").unwrap();
        let ctx = CompressorContext::new("remote", Arc::new(config));
        assert_eq!(ctx.options().get("key").and_then(|v| v.as_str()), Some("k"));
        assert!(ctx.config().embedded_asset_scan);
    }
}
