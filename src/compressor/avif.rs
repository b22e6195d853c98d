//! AVIF re-encoding with `ravif`.
//!
//! Decoding AVIF needs the `avif-native` feature (dav1d through `image`);
//! without it the backend declines every input.

use std::sync::{Arc, LazyLock, OnceLock};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use ravif::{Encoder, Img, RGBA8};
use regex::Regex;

use super::raster::decode_still;
use super::{Applicability, Compressor, CompressorContext, CompressorRef};
use crate::config::AvifOptions;
use crate::debug;
use crate::format::Format;

static AVIF_EXT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^avif$").expect("valid regex"));

/// The `avif` built-in backend.
#[derive(Default)]
pub struct AvifCompressor {
    options: OnceLock<AvifOptions>,
}

impl AvifCompressor {
    pub fn create() -> CompressorRef {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Compressor for AvifCompressor {
    fn name(&self) -> &str {
        "avif"
    }

    fn applicability(&self) -> Applicability {
        Applicability::Pattern(AVIF_EXT.clone())
    }

    async fn init(&self, ctx: &CompressorContext) -> Result<()> {
        let options = ctx.config().avif.options().unwrap_or_default();
        self.options.get_or_init(|| options);
        Ok(())
    }

    async fn compress(
        &self,
        input: &[u8],
        _format: &Format,
        _ctx: &CompressorContext,
    ) -> Result<Option<Vec<u8>>> {
        if !ImageFormat::Avif.reading_enabled() {
            debug!("compress"; "avif decoding not built in, declining");
            return Ok(None);
        }
        let options = self.options.get().cloned().unwrap_or_default();
        let input = input.to_vec();

        tokio::task::spawn_blocking(move || {
            let Some(image) = decode_still(&input, ImageFormat::Avif)? else {
                return Ok(None);
            };
            encode_avif(&image, &options).map(Some)
        })
        .await?
    }
}

fn encode_avif(image: &DynamicImage, options: &AvifOptions) -> Result<Vec<u8>> {
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    let pixels: Vec<RGBA8> = rgba
        .pixels()
        .map(|p| RGBA8::new(p[0], p[1], p[2], p[3]))
        .collect();

    let encoded = Encoder::new()
        .with_quality(options.quality)
        .with_alpha_quality(options.quality)
        .with_speed(options.speed)
        .encode_rgba(Img::new(pixels.as_slice(), width as usize, height as usize))
        .map_err(|e| anyhow!("{e}"))
        .context("Failed to encode AVIF")?;
    Ok(encoded.avif_file)
}
