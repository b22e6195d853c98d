//! TinyPNG web API backend.
//!
//! Keys come from `tinypng.keys` or the comma-separated `TINYPNG_KEYS`
//! environment variable. Without keys the backend claims no format. When the
//! API rejects a key for account reasons (invalid, or monthly quota used up)
//! the next key is tried; the rotation sticks for the rest of the session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Proxy, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use super::{Applicability, Compressor, CompressorContext, CompressorRef};
use crate::config::{ApiKeys, split_keys};
use crate::format::Format;
use crate::{debug, log};

static TINYPNG_EXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(png|jpe?g|webp|avif)$").expect("valid regex"));

const KEYS_ENV: &str = "TINYPNG_KEYS";

#[derive(Debug, Error)]
enum TinifyError {
    /// Credentials rejected or quota exhausted; another key may work.
    #[error("account error ({status}): {message}")]
    Account { status: StatusCode, message: String },

    #[error("client error ({status}): {message}")]
    Client { status: StatusCode, message: String },

    #[error("server error ({status}): {message}")]
    Server { status: StatusCode, message: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct ShrinkResponse {
    output: ShrinkOutput,
}

#[derive(Deserialize)]
struct ShrinkOutput {
    url: String,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// Client state, set by `init` once keys are known.
struct Api {
    client: Client,
    api_url: String,
    keys: Vec<String>,
    current: AtomicUsize,
}

/// The `tinypng` built-in backend.
#[derive(Default)]
pub struct TinyPngCompressor {
    api: OnceLock<Api>,
}

impl TinyPngCompressor {
    pub fn create() -> CompressorRef {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Compressor for TinyPngCompressor {
    fn name(&self) -> &str {
        "tinypng"
    }

    fn applicability(&self) -> Applicability {
        Applicability::Pattern(TINYPNG_EXT.clone())
    }

    fn applies_to(&self, format: &Format) -> bool {
        self.api.get().is_some() && TINYPNG_EXT.is_match(format.extension())
    }

    async fn init(&self, ctx: &CompressorContext) -> Result<()> {
        let options = ctx.config().tinypng.options().unwrap_or_default();
        let env = std::env::var(KEYS_ENV).ok();
        let keys = resolve_keys(options.keys.as_ref(), env.as_deref());
        if keys.is_empty() {
            debug!("compress"; "no TinyPNG keys configured, tinypng disabled");
            return Ok(());
        }

        let mut builder = Client::builder().timeout(Duration::from_secs(60));
        builder = match &options.proxy {
            Some(proxy) => builder
                .proxy(Proxy::all(proxy).with_context(|| format!("Invalid proxy `{proxy}`"))?),
            None => builder.no_proxy(),
        };
        let client = builder.build().context("Failed to create HTTP client")?;

        debug!("compress"; "tinypng ready with {} key(s)", keys.len());
        self.api.get_or_init(|| Api {
            client,
            api_url: options.api_url.trim_end_matches('/').to_string(),
            keys,
            current: AtomicUsize::new(0),
        });
        Ok(())
    }

    async fn compress(
        &self,
        input: &[u8],
        _format: &Format,
        _ctx: &CompressorContext,
    ) -> Result<Option<Vec<u8>>> {
        let Some(api) = self.api.get() else {
            return Ok(None);
        };

        loop {
            let index = api.current.load(Ordering::SeqCst);
            let Some(key) = api.keys.get(index) else {
                anyhow::bail!("No TinyPNG API key available");
            };
            match api.shrink(key, input).await {
                Ok(output) => return Ok(Some(output)),
                Err(err @ TinifyError::Account { .. }) => {
                    log!("compress"; "tinypng key #{} rejected: {}", index + 1, err);
                    // Concurrent callers that failed on the same key rotate once.
                    let _ = api.current.compare_exchange(
                        index,
                        index + 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Api {
    /// Upload `input`, then download the compressed result.
    async fn shrink(&self, key: &str, input: &[u8]) -> Result<Vec<u8>, TinifyError> {
        let response = self
            .client
            .post(format!("{}/shrink", self.api_url))
            .basic_auth("api", Some(key))
            .body(input.to_vec())
            .send()
            .await?;
        let shrunk: ShrinkResponse = check(response).await?.json().await?;

        let response = self
            .client
            .get(&shrunk.output.url)
            .basic_auth("api", Some(key))
            .send()
            .await?;
        Ok(check(response).await?.bytes().await?.to_vec())
    }
}

async fn check(response: Response) -> Result<Response, TinifyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.bytes().await?;
    let message = serde_json::from_slice::<ApiError>(&body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());

    Err(match status.as_u16() {
        401 | 429 => TinifyError::Account { status, message },
        400..=499 => TinifyError::Client { status, message },
        _ => TinifyError::Server { status, message },
    })
}

/// Configured keys win; the environment is the fallback.
fn resolve_keys(configured: Option<&ApiKeys>, env: Option<&str>) -> Vec<String> {
    let keys = configured.map(ApiKeys::to_vec).unwrap_or_default();
    if !keys.is_empty() {
        return keys;
    }
    env.map(split_keys).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressConfig;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const PNG: Format = Format::new("image/png", "png");

    #[test]
    fn test_resolve_keys() {
        let configured = ApiKeys::List(vec!["a".into(), "b".into()]);
        assert_eq!(resolve_keys(Some(&configured), Some("env")), vec!["a", "b"]);
        assert_eq!(
            resolve_keys(Some(&ApiKeys::Joined(" , ".into())), Some("x, y")),
            vec!["x", "y"]
        );
        assert!(resolve_keys(None, None).is_empty());
    }

    #[test]
    fn test_claims_nothing_before_init() {
        let tinypng = TinyPngCompressor::default();
        assert!(!tinypng.applies_to(&PNG));
    }

    /// Fake TinyPNG endpoint that only accepts the key `good`.
    async fn fake_api() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(respond(stream, addr));
            }
        });
        addr
    }

    async fn respond(mut stream: TcpStream, addr: SocketAddr) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        let length = head
            .lines()
            .find_map(|line| {
                let lower = line.to_ascii_lowercase();
                lower
                    .strip_prefix("content-length:")
                    .and_then(|v| v.trim().parse::<usize>().ok())
            })
            .unwrap_or(0);
        while buf.len() < head_end + length {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        let good = STANDARD.encode("api:good");
        let (status, body) = if head.starts_with("POST /shrink") {
            if head.contains(&good) {
                let url = format!("http://{addr}/output/1");
                ("201 Created", serde_json::json!({ "output": { "url": url } }).to_string())
            } else {
                (
                    "401 Unauthorized",
                    serde_json::json!({ "error": "Unauthorized", "message": "Credentials are invalid" })
                        .to_string(),
                )
            }
        } else if head.starts_with("GET /output/1") {
            ("200 OK", "tiny".to_string())
        } else {
            ("404 Not Found", String::new())
        };

        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        let _ = stream.shutdown().await;
    }

    async fn ready(keys: &str, addr: SocketAddr) -> (TinyPngCompressor, CompressorContext) {
        let toml = format!("tinypng = {{ keys = {keys}, api_url = \"http://{addr}\" }}");
        let ctx = CompressorContext::new("tinypng", Arc::new(CompressConfig::parse(&toml).unwrap()));
        let tinypng = TinyPngCompressor::default();
        tinypng.init(&ctx).await.unwrap();
        (tinypng, ctx)
    }

    #[tokio::test]
    async fn test_rejected_key_rotates_to_next() {
        let addr = fake_api().await;
        let (tinypng, ctx) = ready(r#"["bad", "good"]"#, addr).await;
        assert!(tinypng.applies_to(&PNG));
        assert!(!tinypng.applies_to(&Format::SVG));

        let out = tinypng.compress(b"png bytes", &PNG, &ctx).await.unwrap();
        assert_eq!(out.as_deref(), Some(&b"tiny"[..]));
        assert_eq!(tinypng.api.get().unwrap().current.load(Ordering::SeqCst), 1);

        // The good key stays current.
        let out = tinypng.compress(b"png bytes", &PNG, &ctx).await.unwrap();
        assert_eq!(out.as_deref(), Some(&b"tiny"[..]));
        assert_eq!(tinypng.api.get().unwrap().current.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_keys_rejected_is_error() {
        let addr = fake_api().await;
        let (tinypng, ctx) = ready(r#""bad, worse""#, addr).await;

        let err = tinypng.compress(b"png bytes", &PNG, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("No TinyPNG API key available"));
    }
}
