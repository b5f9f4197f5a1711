//! Response compression.
//!
//! Negotiates `gzip` or `deflate` from `Accept-Encoding` (q-values honored,
//! ties go to gzip) and compresses the committed body in place. Bodies below
//! `min_size`, ineligible content types, `204`/`304` responses and responses
//! that already carry a `Content-Encoding` are sent unchanged.

use std::io::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, VARY};
use http::{HeaderValue, StatusCode};
use keel_config::{CompressionOptions, MiddlewareName};
use keel_core::{BoxFuture, Context, Handler, Middleware};
use tracing::warn;

use crate::error::FactoryError;
use crate::factory::{downcast, AnyConfig, MiddlewareFactory};
use crate::stage::Stage;

/// Supported content codings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// `gzip`
    Gzip,
    /// `deflate`
    Deflate,
}

impl Encoding {
    /// Header token.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }

    fn encode(self, body: &[u8], level: Compression) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), level);
                encoder.write_all(body)?;
                encoder.finish()
            }
            Self::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::with_capacity(body.len() / 2), level);
                encoder.write_all(body)?;
                encoder.finish()
            }
        }
    }
}

/// Picks the preferred supported coding from an `Accept-Encoding` value.
pub fn negotiate(accept: &str) -> Option<Encoding> {
    let mut best: Option<(Encoding, f32)> = None;
    for item in accept.split(',') {
        let mut parts = item.split(';');
        let token = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let q = parts
            .filter_map(|p| p.trim().strip_prefix("q="))
            .find_map(|q| q.trim().parse::<f32>().ok())
            .unwrap_or(1.0);
        if q <= 0.0 {
            continue;
        }
        let encoding = match token.as_str() {
            "gzip" | "x-gzip" | "*" => Encoding::Gzip,
            "deflate" => Encoding::Deflate,
            _ => continue,
        };
        let better = match best {
            None => true,
            Some((current, best_q)) => {
                q > best_q
                    || ((q - best_q).abs() < f32::EPSILON
                        && encoding == Encoding::Gzip
                        && current != Encoding::Gzip)
            }
        };
        if better {
            best = Some((encoding, q));
        }
    }
    best.map(|(encoding, _)| encoding)
}

/// Compresses eligible responses.
#[derive(Debug, Clone)]
pub struct CompressionStage {
    options: CompressionOptions,
}

impl Default for CompressionStage {
    fn default() -> Self {
        Self::new(CompressionOptions::default())
    }
}

impl CompressionStage {
    /// Creates the stage.
    pub fn new(options: CompressionOptions) -> Self {
        Self {
            options: options.complete(),
        }
    }
}

impl Stage for CompressionStage {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let encoding = if self.options.skip.should_skip(ctx.path()) {
                None
            } else {
                ctx.header(ACCEPT_ENCODING.as_str()).and_then(negotiate)
            };
            next(ctx.clone()).await;
            let Some(encoding) = encoding else {
                return;
            };

            let response = ctx.response();
            let status = response.status();
            if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
                return;
            }
            let level = Compression::new(self.options.level.min(9));
            let options = &self.options;
            response.transform(|headers, body| {
                if headers.contains_key(CONTENT_ENCODING) || body.len() < options.min_size {
                    return;
                }
                let eligible = headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|ct| options.is_eligible(ct));
                if !eligible {
                    return;
                }
                match encoding.encode(body, level) {
                    Ok(compressed) => {
                        *body = Bytes::from(compressed);
                        headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding.as_str()));
                        headers.append(VARY, HeaderValue::from_static("Accept-Encoding"));
                    }
                    Err(err) => warn!(error = %err, "response compression failed, sending identity"),
                }
            });
        })
    }
}

/// Builds [`CompressionStage`] from [`CompressionOptions`].
#[derive(Debug, Clone, Copy)]
pub struct CompressionFactory;

impl MiddlewareFactory for CompressionFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::Compression
    }

    fn create(&self, config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        let options: &CompressionOptions = downcast(self.name(), config)?;
        Ok(CompressionStage::new(options.clone()).into_middleware())
    }
}
