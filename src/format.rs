//! Content-based file type detection.
//!
//! Raster formats are recognized by their magic numbers, SVG by sniffing the
//! start of the document. File names and declared content types are never
//! consulted: embedded and renamed assets are common in bundles.

use image::ImageFormat;

/// Detected file format of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Format {
    mime: &'static str,
    extension: &'static str,
}

impl Format {
    pub const SVG: Self = Self::new("image/svg+xml", "svg");

    pub const fn new(mime: &'static str, extension: &'static str) -> Self {
        Self { mime, extension }
    }

    /// Mime type, e.g. `image/png`.
    pub const fn mime(&self) -> &'static str {
        self.mime
    }

    /// Canonical extension without the dot, e.g. `png`.
    pub const fn extension(&self) -> &'static str {
        self.extension
    }

    /// The `image` crate format, `None` for SVG.
    pub fn image_format(&self) -> Option<ImageFormat> {
        ImageFormat::from_mime_type(self.mime)
    }

    fn from_image_format(format: ImageFormat) -> Self {
        let extension = format.extensions_str().first().copied().unwrap_or("bin");
        Self::new(format.to_mime_type(), extension)
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mime)
    }
}

/// Identify the real format of `bytes`.
///
/// Returns `None` when no known signature matches (including empty input).
pub fn identify(bytes: &[u8]) -> Option<Format> {
    if bytes.is_empty() {
        return None;
    }
    if let Ok(format) = image::guess_format(bytes) {
        return Some(Format::from_image_format(format));
    }
    is_svg(bytes).then_some(Format::SVG)
}

/// How far into the document the `<svg` root may start.
const SVG_SNIFF_LIMIT: usize = 4096;

/// Check whether the document root is an `<svg>` element.
///
/// Skips a BOM, whitespace, an XML declaration, comments and a DOCTYPE.
fn is_svg(bytes: &[u8]) -> bool {
    let mut rest = &bytes[..bytes.len().min(SVG_SNIFF_LIMIT)];
    rest = rest.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(rest);

    loop {
        rest = rest.trim_ascii_start();
        let skipped = if rest.starts_with(b"<?") {
            skip_past(rest, b"?>")
        } else if rest.starts_with(b"<!--") {
            skip_past(rest, b"-->")
        } else if rest.starts_with(b"<!") {
            skip_past(rest, b">")
        } else {
            return rest.starts_with(b"<svg")
                && rest
                    .get(4)
                    .is_some_and(|&b| b.is_ascii_whitespace() || b == b'>' || b == b'/');
        };
        match skipped {
            Some(next) => rest = next,
            None => return false,
        }
    }
}

/// Return the slice following the first occurrence of `needle`.
#[inline]
fn skip_past<'a>(haystack: &'a [u8], needle: &[u8]) -> Option<&'a [u8]> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| &haystack[pos + needle.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn test_identify_png() {
        let format = identify(PNG_HEADER).unwrap();
        assert_eq!(format.mime(), "image/png");
        assert_eq!(format.extension(), "png");
        assert_eq!(format.image_format(), Some(ImageFormat::Png));
    }

    #[test]
    fn test_identify_jpeg_and_webp() {
        let jpeg = identify(b"\xFF\xD8\xFF\xE0\0\x10JFIF\0").unwrap();
        assert_eq!(jpeg.mime(), "image/jpeg");
        assert_eq!(jpeg.extension(), "jpg");

        let webp = identify(b"RIFF\x24\0\0\0WEBPVP8 ").unwrap();
        assert_eq!(webp.mime(), "image/webp");
    }

    #[test]
    fn test_identify_svg_with_prolog() {
        let svg = br#"
            <?xml version="1.0" encoding="UTF-8"?>
            <!-- generator: hand -->
            <!DOCTYPE svg PUBLIC "-//W3C//DTD SVG 1.1//EN" "x">
            <svg xmlns="http://www.w3.org/2000/svg"></svg>"#;
        assert_eq!(identify(svg), Some(Format::SVG));
        assert_eq!(identify(b"\xEF\xBB\xBF<svg/>"), Some(Format::SVG));
    }

    #[test]
    fn test_identify_unknown() {
        assert_eq!(identify(b""), None);
        assert_eq!(identify(&[0, 0, 0]), None);
        assert_eq!(identify(b"<html><svg></svg></html>"), None);
        assert_eq!(identify(b"<svgfoo>"), None);
        assert_eq!(identify(b"<!-- unterminated"), None);
    }

    #[test]
    fn test_extension_ignored() {
        // Content decides, not the name a bundler gave it.
        let format = identify(PNG_HEADER).unwrap();
        assert_ne!(format.extension(), "jpg");
    }
}
