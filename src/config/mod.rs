//! Engine configuration.
//!
//! Loaded from TOML (or built in code) once per build session:
//!
//! ```toml
//! concurrency = 8
//! timeout_ms = 60000
//! embedded_asset_scan = true
//! cache = { dir = "node_modules/.cache/asset-squeeze" }   # or: cache = false
//! logger = { verbose = false }                            # or: logger = false
//! raster = { png_level = "best", jpeg_quality = 75 }      # or: raster = false
//! avif = { quality = 70.0, speed = 6 }                    # or: avif = false
//! svg = false
//! tinypng = { keys = ["key-a", "key-b"] }                 # or: TINYPNG_KEYS=a,b
//!
//! [backends]
//! my-backend = { key = "value" }
//! ```

mod backend;
mod error;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::log;

pub use backend::{
    ApiKeys, AvifOptions, PngLevel, RasterOptions, SvgOptions, TinyPngOptions, split_keys,
};
pub use error::ConfigError;

/// Default cache directory (relative to the build root)
pub const DEFAULT_CACHE_DIR: &str = "node_modules/.cache/asset-squeeze";

/// Names of the built-in backends, in priority order.
pub const BUILTIN_BACKENDS: [&str; 4] = ["raster", "avif", "svg", "tinypng"];

// ============================================================================
// Switch
// ============================================================================

/// A `false | { options }` config value.
///
/// `true` and an empty table both mean "enabled with defaults".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Switch<T> {
    Flag(bool),
    With(T),
}

impl<T> Default for Switch<T> {
    fn default() -> Self {
        Self::Flag(true)
    }
}

impl<T: Default + Clone> Switch<T> {
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Flag(false))
    }

    /// Effective options, `None` when disabled.
    pub fn options(&self) -> Option<T> {
        match self {
            Self::Flag(false) => None,
            Self::Flag(true) => Some(T::default()),
            Self::With(options) => Some(options.clone()),
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// `cache` options.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheOptions {
    /// Cache directory, relative to the build root.
    pub dir: Option<PathBuf>,
}

/// `logger` options.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggerOptions {
    /// Print per-asset debug traces.
    pub verbose: bool,
}

// ============================================================================
// CompressConfig
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompressConfig {
    /// Max assets compressing at once (default: available parallelism).
    pub concurrency: Option<usize>,
    /// Per-compressor call timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Scan JS/CSS text for base64 image data URIs.
    pub embedded_asset_scan: bool,
    pub cache: Switch<CacheOptions>,
    pub logger: Switch<LoggerOptions>,
    pub raster: Switch<RasterOptions>,
    pub avif: Switch<AvifOptions>,
    pub svg: Switch<SvgOptions>,
    pub tinypng: Switch<TinyPngOptions>,
    /// Settings of user-supplied backends, keyed by compressor name.
    pub backends: BTreeMap<String, Switch<toml::Table>>,
}

impl Default for CompressConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            timeout_ms: None,
            embedded_asset_scan: true,
            cache: Switch::default(),
            logger: Switch::default(),
            raster: Switch::default(),
            avif: Switch::default(),
            svg: Switch::default(),
            tinypng: Switch::default(),
            backends: BTreeMap::new(),
        }
    }
}

impl CompressConfig {
    /// Parse configuration from TOML, warning about unknown fields.
    pub fn parse(content: &str) -> Result<Self> {
        let (config, ignored) = Self::parse_with_ignored(content)?;
        if !ignored.is_empty() {
            Self::print_unknown_fields_warning(&ignored);
        }
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;
        Self::parse(&content)
    }

    /// Parse TOML content, collecting any unknown fields.
    fn parse_with_ignored(content: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(content);
        let config = serde_ignored::deserialize(deserializer, |path: serde_ignored::Path| {
            ignored.push(path.to_string());
        })?;
        Ok((config, ignored))
    }

    fn print_unknown_fields_warning(fields: &[String]) {
        log!("warning"; "ignoring unknown config fields: {}", fields.join(", "));
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == Some(0) {
            return Err(ConfigError::Validation(
                "`concurrency` must be at least 1".into(),
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(ConfigError::Validation(
                "`timeout_ms` must be greater than 0".into(),
            ));
        }
        if let Switch::With(raster) = &self.raster
            && !(1..=100).contains(&raster.jpeg_quality)
        {
            return Err(ConfigError::Validation(format!(
                "`raster.jpeg_quality` must be within 1..=100, got {}",
                raster.jpeg_quality
            )));
        }
        if let Switch::With(avif) = &self.avif {
            if !(1.0..=100.0).contains(&avif.quality) {
                return Err(ConfigError::Validation(format!(
                    "`avif.quality` must be within 1..=100, got {}",
                    avif.quality
                )));
            }
            if !(1..=10).contains(&avif.speed) {
                return Err(ConfigError::Validation(format!(
                    "`avif.speed` must be within 1..=10, got {}",
                    avif.speed
                )));
            }
        }
        Ok(())
    }

    /// Whether the backend named `name` is switched off.
    pub fn is_disabled(&self, name: &str) -> bool {
        match name {
            "raster" => self.raster.is_disabled(),
            "avif" => self.avif.is_disabled(),
            "svg" => self.svg.is_disabled(),
            "tinypng" => self.tinypng.is_disabled(),
            other => self.backends.get(other).is_some_and(Switch::is_disabled),
        }
    }

    /// Options table handed to a user-supplied backend.
    pub fn backend_options(&self, name: &str) -> toml::Table {
        self.backends
            .get(name)
            .and_then(Switch::options)
            .unwrap_or_default()
    }

    /// Names mentioned in `[backends]`.
    pub fn configured_backends(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Cache directory under `root`, `None` when caching is disabled.
    pub fn cache_dir(&self, root: &Path) -> Option<PathBuf> {
        let options = self.cache.options()?;
        let dir = options
            .dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
        Some(root.join(dir))
    }

    pub fn report_enabled(&self) -> bool {
        !self.logger.is_disabled()
    }

    pub fn verbose(&self) -> bool {
        self.logger.options().is_some_and(|o| o.verbose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompressConfig::parse("").unwrap();
        assert!(config.embedded_asset_scan);
        assert!(!config.is_disabled("raster"));
        assert!(!config.is_disabled("svg"));
        assert!(config.report_enabled());
        assert!(!config.verbose());
        assert_eq!(
            config.cache_dir(Path::new("/site")),
            Some(PathBuf::from("/site").join(DEFAULT_CACHE_DIR))
        );
        assert!(config.concurrency() >= 1);
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_switches() {
        let config = CompressConfig::parse(
            r#"
            embedded_asset_scan = false
            cache = false
            logger = { verbose = true }
            svg = false
            raster = { jpeg_quality = 60 }
            timeout_ms = 250

            [backends]
            remote = false
            local = { level = 3 }
            "#,
        )
        .unwrap();

        assert!(!config.embedded_asset_scan);
        assert_eq!(config.cache_dir(Path::new("/site")), None);
        assert!(config.verbose());
        assert!(config.is_disabled("svg"));
        assert!(!config.is_disabled("raster"));
        assert!(config.is_disabled("remote"));
        assert!(!config.is_disabled("local"));
        assert!(!config.is_disabled("never-mentioned"));
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));

        let raster = config.raster.options().unwrap();
        assert_eq!(raster.jpeg_quality, 60);
        assert_eq!(raster.png_level, PngLevel::Best);

        let local = config.backend_options("local");
        assert_eq!(local.get("level").and_then(|v| v.as_integer()), Some(3));
        assert!(config.backend_options("remote").is_empty());
    }

    #[test]
    fn test_cache_dir_override() {
        let config = CompressConfig::parse(r#"cache = { dir = ".imgcache" }"#).unwrap();
        assert_eq!(
            config.cache_dir(Path::new("/site")),
            Some(PathBuf::from("/site/.imgcache"))
        );
    }

    #[test]
    fn test_logger_false_disables_report() {
        let config = CompressConfig::parse("logger = false").unwrap();
        assert!(!config.report_enabled());
        assert!(!config.verbose());
    }

    #[test]
    fn test_unknown_fields_collected() {
        let (_, ignored) =
            CompressConfig::parse_with_ignored("embeded_asset_scan = true\n").unwrap();
        assert_eq!(ignored, vec!["embeded_asset_scan".to_string()]);
    }

    #[test]
    fn test_validation() {
        assert!(CompressConfig::parse("concurrency = 0").is_err());
        assert!(CompressConfig::parse("timeout_ms = 0").is_err());
        assert!(CompressConfig::parse("raster = { jpeg_quality = 0 }").is_err());
        assert!(CompressConfig::parse("avif = { quality = 0.0 }").is_err());
        assert!(CompressConfig::parse("avif = { speed = 11 }").is_err());
        assert!(CompressConfig::parse("concurrency = 2").is_ok());
    }

    #[test]
    fn test_misspelled_backend_option_is_an_error() {
        assert!(CompressConfig::parse("raster = { jpeg_qualty = 60 }").is_err());
        assert!(CompressConfig::parse("cache = { directory = \"x\" }").is_err());
        assert!(CompressConfig::parse("logger = { verbos = true }").is_err());

        let config = CompressConfig::parse("tinypng = { keys = \"a,b\", proxy = \"http://p\" }").unwrap();
        let tinypng = config.tinypng.options().unwrap();
        assert_eq!(tinypng.keys.unwrap().to_vec(), vec!["a", "b"]);
        assert_eq!(tinypng.proxy.as_deref(), Some("http://p"));
        assert!(!config.is_disabled("avif"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = CompressConfig::load(Path::new("/nonexistent/squeeze.toml")).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }
}
