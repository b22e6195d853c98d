//! Options of the built-in compressor backends.
//!
//! Unknown keys inside these tables are errors: the sections sit behind an
//! untagged [`Switch`](super::Switch), where a misspelled key would
//! otherwise fall back to the defaults without a warning.
//!
//! # Example
//!
//! ```toml
//! raster = { png_level = "best", jpeg_quality = 75 }
//! avif = { quality = 70.0, speed = 6 }
//! svg = { remove_metadata = true, keep_comments = false }
//! tinypng = { keys = "key-a, key-b", proxy = "http://127.0.0.1:7890" }
//! ```

use serde::{Deserialize, Serialize};

/// PNG deflate effort.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PngLevel {
    Fast,
    Default,
    #[default]
    Best,
}

/// `raster` backend options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RasterOptions {
    /// PNG compression effort.
    pub png_level: PngLevel,
    /// JPEG re-encode quality (1-100).
    pub jpeg_quality: u8,
    /// Re-encode WebP input losslessly.
    pub webp: bool,
}

impl Default for RasterOptions {
    fn default() -> Self {
        Self {
            png_level: PngLevel::Best,
            jpeg_quality: 75,
            webp: true,
        }
    }
}

/// `avif` backend options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AvifOptions {
    /// Color quality (1-100).
    pub quality: f32,
    /// Encoder speed, 1 (slowest, smallest) to 10 (fastest).
    pub speed: u8,
}

impl Default for AvifOptions {
    fn default() -> Self {
        Self {
            quality: 70.0,
            speed: 6,
        }
    }
}

/// `svg` backend options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SvgOptions {
    /// Drop `<metadata>` and editor (Inkscape/Sodipodi) elements and attributes.
    pub remove_metadata: bool,
    /// Keep ordinary comments. `<!--! ... -->` comments are always kept.
    pub keep_comments: bool,
}

impl Default for SvgOptions {
    fn default() -> Self {
        Self {
            remove_metadata: true,
            keep_comments: false,
        }
    }
}

/// `tinypng` backend options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TinyPngOptions {
    /// API keys; falls back to the `TINYPNG_KEYS` environment variable.
    pub keys: Option<ApiKeys>,
    /// HTTP(S) proxy for API calls.
    pub proxy: Option<String>,
    /// API base URL.
    pub api_url: String,
}

impl Default for TinyPngOptions {
    fn default() -> Self {
        Self {
            keys: None,
            proxy: None,
            api_url: "https://api.tinify.com".into(),
        }
    }
}

/// `"a, b"` or `["a", "b"]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ApiKeys {
    Joined(String),
    List(Vec<String>),
}

impl ApiKeys {
    /// Trimmed, non-empty keys in order.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::Joined(joined) => split_keys(joined),
            Self::List(list) => list
                .iter()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect(),
        }
    }
}

/// Split a comma-separated key list.
pub fn split_keys(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}
