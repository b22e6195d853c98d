//! Raster re-encoding with the `image` crate.
//!
//! Decodes PNG, JPEG and WebP and re-encodes them in the same format:
//! PNG at the configured deflate effort with adaptive filtering, JPEG at the
//! configured quality, WebP losslessly. Metadata chunks are not carried over,
//! so inputs whose rendering depends on them are declined: animations (APNG
//! `acTL`, WebP `ANIM`), an EXIF orientation other than upright, and an
//! embedded ICC color profile.

use std::io::Cursor;
use std::sync::{Arc, LazyLock, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngDecoder, PngEncoder};
use image::codecs::webp::{WebPDecoder, WebPEncoder};
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use regex::Regex;

use super::{Applicability, Compressor, CompressorContext, CompressorRef};
use crate::config::{PngLevel, RasterOptions};
use crate::format::Format;
use crate::debug;

static RASTER_EXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(png|jpe?g|webp)$").expect("valid regex"));

/// The `raster` built-in backend.
#[derive(Default)]
pub struct RasterCompressor {
    options: OnceLock<RasterOptions>,
}

impl RasterCompressor {
    pub fn create() -> CompressorRef {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Compressor for RasterCompressor {
    fn name(&self) -> &str {
        "raster"
    }

    fn applicability(&self) -> Applicability {
        Applicability::Pattern(RASTER_EXT.clone())
    }

    async fn init(&self, ctx: &CompressorContext) -> Result<()> {
        let options = ctx.config().raster.options().unwrap_or_default();
        self.options.get_or_init(|| options);
        Ok(())
    }

    async fn compress(
        &self,
        input: &[u8],
        format: &Format,
        _ctx: &CompressorContext,
    ) -> Result<Option<Vec<u8>>> {
        let Some(image_format) = format.image_format() else {
            return Ok(None);
        };
        let options = self.options.get().cloned().unwrap_or_default();
        let input = input.to_vec();

        tokio::task::spawn_blocking(move || reencode(&input, image_format, &options)).await?
    }
}

/// Decode and re-encode `input` in its own format.
fn reencode(input: &[u8], format: ImageFormat, options: &RasterOptions) -> Result<Option<Vec<u8>>> {
    let encode = match format {
        ImageFormat::Png | ImageFormat::Jpeg => true,
        ImageFormat::WebP => options.webp,
        _ => false,
    };
    if !encode {
        return Ok(None);
    }
    let Some(image) = decode_still(input, format)? else {
        return Ok(None);
    };
    match format {
        ImageFormat::Png => encode_png(&image, options.png_level).map(Some),
        ImageFormat::Jpeg => encode_jpeg(&image, options.jpeg_quality).map(Some),
        _ => encode_webp(&image).map(Some),
    }
}

/// Decode a single upright frame without a color profile.
///
/// Returns `None` for input a plain pixel re-encode would render differently.
pub(super) fn decode_still(input: &[u8], format: ImageFormat) -> Result<Option<DynamicImage>> {
    let mime = format.to_mime_type();
    let failed = || format!("Failed to decode {mime}");

    if is_animated(input, format).with_context(failed)? {
        debug!("compress"; "{mime} is animated, declining");
        return Ok(None);
    }

    let mut decoder = ImageReader::with_format(Cursor::new(input), format)
        .into_decoder()
        .with_context(failed)?;
    if decoder.icc_profile().with_context(failed)?.is_some() {
        debug!("compress"; "{mime} carries an ICC profile, declining");
        return Ok(None);
    }
    if decoder.orientation().with_context(failed)? != Orientation::NoTransforms {
        debug!("compress"; "{mime} has an EXIF orientation, declining");
        return Ok(None);
    }

    DynamicImage::from_decoder(decoder)
        .map(Some)
        .with_context(failed)
}

fn is_animated(input: &[u8], format: ImageFormat) -> image::ImageResult<bool> {
    match format {
        ImageFormat::Png => PngDecoder::new(Cursor::new(input))?.is_apng(),
        ImageFormat::WebP => Ok(WebPDecoder::new(Cursor::new(input))?.has_animation()),
        _ => Ok(false),
    }
}

fn encode_png(image: &DynamicImage, level: PngLevel) -> Result<Vec<u8>> {
    let compression = match level {
        PngLevel::Fast => CompressionType::Fast,
        PngLevel::Default => CompressionType::Default,
        PngLevel::Best => CompressionType::Best,
    };
    let mut buf = Vec::new();
    let encoder = PngEncoder::new_with_quality(&mut buf, compression, FilterType::Adaptive);
    image
        .write_with_encoder(encoder)
        .context("Failed to encode PNG")?;
    Ok(buf)
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    // JPEG has no alpha channel
    let rgb = match image {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => image.clone(),
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    };
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    rgb.write_with_encoder(encoder)
        .context("Failed to encode JPEG")?;
    Ok(buf)
}

fn encode_webp(image: &DynamicImage) -> Result<Vec<u8>> {
    let rgba = match image {
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => image.clone(),
        other => DynamicImage::ImageRgba8(other.to_rgba8()),
    };
    let mut buf = Vec::new();
    let encoder = WebPEncoder::new_lossless(&mut buf);
    rgba.write_with_encoder(encoder)
        .context("Failed to encode WebP")?;
    Ok(buf)
}
