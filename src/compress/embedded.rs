//! Base64 image data URIs embedded in text chunks.
//!
//! A chunk is scanned once into an ordered list of non-overlapping spans.
//! Every span compresses concurrently through the [`Orchestrator`]; the
//! output is then rebuilt in a single pass over the original text, so
//! replacements never shift the offsets of other spans.

use std::sync::LazyLock;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, PAD};
use base64::engine::{DecodePaddingMode, Engine};
use regex::Regex;

use super::{Asset, CompressionOutcome, Orchestrator};
use crate::error::CompressError;

static DATA_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"data:image/[A-Za-z0-9.+-]+;base64,[A-Za-z0-9+/]+={0,2}").expect("valid regex")
});

const BASE64_MARKER: &str = ";base64,";

/// Standard alphabet; decodes with or without `=` padding, encodes padded.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Byte range of one `data:image/...;base64,...` literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedSpan {
    pub start: usize,
    pub end: usize,
    payload_start: usize,
}

impl EmbeddedSpan {
    /// The base64 payload of this span within `text`.
    pub fn payload<'a>(&self, text: &'a str) -> &'a str {
        &text[self.payload_start..self.end]
    }

    /// Declared mime type of the literal.
    pub fn declared_mime<'a>(&self, text: &'a str) -> &'a str {
        let data = self.start + "data:".len();
        &text[data..self.payload_start - BASE64_MARKER.len()]
    }
}

/// Find all embedded image literals, left to right.
pub fn scan(text: &str) -> Vec<EmbeddedSpan> {
    DATA_URI
        .find_iter(text)
        .filter_map(|m| {
            let marker = m.as_str().find(BASE64_MARKER)?;
            Some(EmbeddedSpan {
                start: m.start(),
                end: m.end(),
                payload_start: m.start() + marker + BASE64_MARKER.len(),
            })
        })
        .collect()
}

/// Result for one literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    /// `"<chunk id> [<start>:<end>]"`
    pub id: String,
    pub span: EmbeddedSpan,
    pub outcome: CompressionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub text: String,
    /// One entry per literal, in text order.
    pub occurrences: Vec<Occurrence>,
}

impl Rewritten {
    fn unchanged(text: &str) -> Self {
        Self {
            text: text.to_string(),
            occurrences: Vec::new(),
        }
    }

    /// Whether any literal was replaced.
    pub fn changed(&self) -> bool {
        self.occurrences.iter().any(|o| o.outcome.is_improved())
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &CompressionOutcome> {
        self.occurrences.iter().map(|o| &o.outcome)
    }
}

/// Rewrites embedded literals of text chunks.
#[derive(Clone)]
pub struct Rewriter {
    orchestrator: Orchestrator,
    enabled: bool,
}

impl Rewriter {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let enabled = orchestrator.config().embedded_asset_scan;
        Self {
            orchestrator,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Compress every embedded literal of `text`.
    ///
    /// Each literal records one ledger entry. Literals that did not improve
    /// stay byte-for-byte in place.
    pub async fn rewrite(&self, id: &str, text: &str) -> Rewritten {
        if !self.enabled {
            return Rewritten::unchanged(text);
        }
        let spans = scan(text);
        if spans.is_empty() {
            return Rewritten::unchanged(text);
        }

        let handles: Vec<_> = spans
            .into_iter()
            .map(|span| {
                let occurrence_id = format!("{id} [{}:{}]", span.start, span.end);
                let orchestrator = self.orchestrator.clone();
                let payload = span.payload(text).to_string();
                let task_id = occurrence_id.clone();
                let handle = tokio::spawn(async move {
                    compress_literal(&orchestrator, task_id, &payload).await
                });
                (occurrence_id, span, handle)
            })
            .collect();

        let mut occurrences = Vec::with_capacity(handles.len());
        for (id, span, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let outcome = CompressionOutcome::failed(CompressError::Aborted(err.to_string()));
                    self.orchestrator.record(&id, &outcome);
                    outcome
                }
            };
            occurrences.push(Occurrence { id, span, outcome });
        }

        Rewritten {
            text: reconstruct(text, &occurrences),
            occurrences,
        }
    }
}

async fn compress_literal(
    orchestrator: &Orchestrator,
    id: String,
    payload: &str,
) -> CompressionOutcome {
    match LENIENT.decode(payload) {
        Ok(bytes) => orchestrator.compress(&Asset::new(id, bytes)).await,
        Err(err) => {
            let outcome = CompressionOutcome::failed(CompressError::InvalidEmbedded(err.to_string()));
            orchestrator.record(&id, &outcome);
            outcome
        }
    }
}

/// Copy `text`, swapping improved spans for re-encoded literals.
fn reconstruct(text: &str, occurrences: &[Occurrence]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for occurrence in occurrences {
        let Some(improved) = occurrence.outcome.improved() else {
            continue;
        };
        out.push_str(&text[cursor..occurrence.span.start]);
        out.push_str("data:");
        out.push_str(improved.format().mime());
        out.push_str(BASE64_MARKER);
        out.push_str(&LENIENT.encode(improved.output()));
        cursor = occurrence.span.end;
    }
    out.push_str(&text[cursor..]);
    out
}
