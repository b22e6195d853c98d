//! Structure-preserving SVG minification.
//!
//! Streams the document through quick-xml and writes it back without what
//! renderers ignore: comments, the UTF-8 XML declaration, an external
//! DOCTYPE, inter-element whitespace, `<metadata>` and editor namespaces.
//! Every other element and attribute (`<text>`, `<style>`, `<script>`,
//! `id`, `class`, `viewBox`, links) is kept byte for byte.

use std::borrow::Cow;
use std::sync::{Arc, LazyLock, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};
use regex::Regex;

use super::{Applicability, Compressor, CompressorContext, CompressorRef};
use crate::config::SvgOptions;
use crate::format::Format;

static SVG_MIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^image/svg\+xml$").expect("valid regex"));

/// Namespace prefixes written by vector editors.
const EDITOR_PREFIXES: [&[u8]; 4] = [b"sodipodi", b"inkscape", b"sketch", b"serif"];

/// Elements whose whitespace is content.
const WHITESPACE_SENSITIVE: [&[u8]; 7] = [
    b"text",
    b"tspan",
    b"textPath",
    b"style",
    b"script",
    b"title",
    b"desc",
];

/// The `svg` built-in backend.
#[derive(Default)]
pub struct SvgCompressor {
    options: OnceLock<SvgOptions>,
}

impl SvgCompressor {
    pub fn create() -> CompressorRef {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Compressor for SvgCompressor {
    fn name(&self) -> &str {
        "svg"
    }

    fn applicability(&self) -> Applicability {
        Applicability::Pattern(SVG_MIME.clone())
    }

    async fn init(&self, ctx: &CompressorContext) -> Result<()> {
        let options = ctx.config().svg.options().unwrap_or_default();
        self.options.get_or_init(|| options);
        Ok(())
    }

    async fn compress(
        &self,
        input: &[u8],
        _format: &Format,
        _ctx: &CompressorContext,
    ) -> Result<Option<Vec<u8>>> {
        let options = self.options.get().cloned().unwrap_or_default();
        let input = input.to_vec();

        tokio::task::spawn_blocking(move || {
            minify_svg(&input, &options).context("Failed to parse SVG").map(Some)
        })
        .await?
    }
}

/// Minify an SVG document.
fn minify_svg(content: &[u8], options: &SvgOptions) -> Result<Vec<u8>> {
    let mut reader = Reader::from_reader(content);
    let mut writer = Writer::new(Vec::with_capacity(content.len()));
    // One entry per open element: whether whitespace inside it is kept.
    let mut preserve: Vec<bool> = Vec::new();

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => anyhow::bail!(
                "XML parse error at position {}: {:?}",
                reader.error_position(),
                e
            ),
        };
        match event {
            Event::Eof => break,
            Event::Start(elem) => {
                if options.remove_metadata && is_metadata(&elem) {
                    let name = elem.name().as_ref().to_vec();
                    reader.read_to_end(QName(&name))?;
                    continue;
                }
                let inherited = preserve.last().copied().unwrap_or(false);
                preserve.push(inherited || keeps_whitespace(&elem)?);
                writer.write_event(Event::Start(rebuild(&elem, options)?))?;
            }
            Event::Empty(elem) => {
                if options.remove_metadata && is_metadata(&elem) {
                    continue;
                }
                writer.write_event(Event::Empty(rebuild(&elem, options)?))?;
            }
            Event::End(elem) => {
                preserve.pop();
                writer.write_event(Event::End(elem))?;
            }
            Event::Text(text) => {
                let inside_preserved = preserve.last().copied().unwrap_or(false);
                if inside_preserved || !text.iter().all(u8::is_ascii_whitespace) {
                    writer.write_event(Event::Text(text))?;
                }
            }
            Event::Comment(comment) => {
                if options.keep_comments || comment.starts_with(b"!") {
                    writer.write_event(Event::Comment(comment))?;
                }
            }
            Event::Decl(decl) => {
                let utf8 = match decl.encoding() {
                    None => true,
                    Some(encoding) => encoding?.eq_ignore_ascii_case(b"utf-8"),
                };
                if !utf8 {
                    writer.write_event(Event::Decl(decl))?;
                }
            }
            // An internal subset may declare entities the document uses.
            Event::DocType(doctype) => {
                if doctype.contains(&b'[') {
                    writer.write_event(Event::DocType(doctype))?;
                }
            }
            event => writer.write_event(event)?,
        }
    }

    Ok(writer.into_inner())
}

fn is_metadata(elem: &BytesStart<'_>) -> bool {
    let name = elem.name();
    if name.local_name().as_ref() == b"metadata" {
        return true;
    }
    name.prefix()
        .is_some_and(|prefix| EDITOR_PREFIXES.contains(&prefix.as_ref()))
}

fn is_editor_attribute(key: QName<'_>) -> bool {
    let local = key.local_name();
    match key.prefix() {
        Some(prefix) if prefix.as_ref() == b"xmlns" => EDITOR_PREFIXES.contains(&local.as_ref()),
        Some(prefix) => EDITOR_PREFIXES.contains(&prefix.as_ref()),
        None => false,
    }
}

fn keeps_whitespace(elem: &BytesStart<'_>) -> Result<bool> {
    if WHITESPACE_SENSITIVE.contains(&elem.local_name().as_ref()) {
        return Ok(true);
    }
    Ok(elem
        .try_get_attribute("xml:space")?
        .is_some_and(|attr| attr.value.as_ref() == b"preserve"))
}

/// Re-emit `elem` with single spaces between attributes.
fn rebuild<'a>(elem: &'a BytesStart<'a>, options: &SvgOptions) -> Result<BytesStart<'a>> {
    let name = std::str::from_utf8(elem.name().into_inner())?;
    let mut out = BytesStart::new(name);
    for attr in elem.attributes() {
        let attr = attr?;
        if options.remove_metadata && is_editor_attribute(attr.key) {
            continue;
        }
        out.push_attribute(Attribute {
            key: attr.key,
            value: double_quoted(attr.value),
        });
    }
    Ok(out)
}

/// The writer always uses `"`; escape it in values taken from `'`-quoted
/// attributes.
fn double_quoted(value: Cow<'_, [u8]>) -> Cow<'_, [u8]> {
    if !value.contains(&b'"') {
        return value;
    }
    let mut escaped = Vec::with_capacity(value.len() + 8);
    for &b in value.iter() {
        if b == b'"' {
            escaped.extend_from_slice(b"&quot;");
        } else {
            escaped.push(b);
        }
    }
    Cow::Owned(escaped)
}
