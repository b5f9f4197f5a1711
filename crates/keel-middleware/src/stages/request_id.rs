//! Request correlation id.
//!
//! Reuses the inbound id header when the client sent one; otherwise
//! generates a fresh id. The id is written to the response header before the
//! rest of the chain runs, so even a panicking request answers with it, and is
//! stored in the context as [`RequestId`] for everything downstream.
//!
//! ## Generators
//!
//! - `random-hex`: 16 bytes from the OS RNG as 32 lowercase hex characters.
//!   If the RNG fails, falls back to `unix-seconds:counter`.
//! - `ulid`: 26 Crockford base32 characters over a UUID v7, so ids sort by
//!   creation time.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use keel_config::{IdGenerator, MiddlewareName, RequestIdOptions};
use keel_core::{BoxFuture, Context, Handler, Middleware, RequestId};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::warn;
use uuid::Uuid;

use crate::error::FactoryError;
use crate::factory::{downcast, AnyConfig, MiddlewareFactory};
use crate::stage::Stage;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 32 lowercase hex characters from the OS RNG.
pub fn random_hex() -> String {
    let mut bytes = [0u8; 16];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => {
            let mut id = String::with_capacity(32);
            for byte in bytes {
                let _ = write!(id, "{byte:02x}");
            }
            id
        }
        Err(err) => {
            warn!(error = %err, "entropy source failed, using counter request id");
            fallback_id()
        }
    }
}

fn fallback_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{secs}:{}", FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Time-ordered 26-character ULID.
pub fn ulid() -> String {
    encode_crockford(Uuid::now_v7().as_u128())
}

/// Encodes 128 bits as 26 Crockford base32 characters, most significant first.
pub fn encode_crockford(value: u128) -> String {
    (0..26)
        .map(|i| {
            let shift = 125 - 5 * i;
            let index = ((value >> shift) & 0x1f) as usize;
            char::from(CROCKFORD[index])
        })
        .collect()
}

/// Generates a request id with `generator`.
pub fn generate(generator: IdGenerator) -> String {
    match generator {
        IdGenerator::RandomHex => random_hex(),
        IdGenerator::Ulid => ulid(),
    }
}

/// Assigns every request a correlation id.
#[derive(Debug, Clone, Default)]
pub struct RequestIdStage {
    options: RequestIdOptions,
}

impl RequestIdStage {
    /// Creates the stage.
    pub fn new(options: RequestIdOptions) -> Self {
        Self {
            options: options.complete(),
        }
    }
}

impl Stage for RequestIdStage {
    fn name(&self) -> &'static str {
        "request_id"
    }

    fn handle(self: Arc<Self>, mut ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let id = ctx
                .header(&self.options.header)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map_or_else(|| generate(self.options.generator), str::to_string);

            ctx.set_header(&self.options.header, &id);
            ctx.insert_value(RequestId(id));
            next(ctx).await;
        })
    }
}

/// Builds [`RequestIdStage`] from [`RequestIdOptions`].
#[derive(Debug, Clone, Copy)]
pub struct RequestIdFactory;

impl MiddlewareFactory for RequestIdFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::RequestId
    }

    fn create(&self, config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        let options: &RequestIdOptions = downcast(self.name(), config)?;
        Ok(RequestIdStage::new(options.clone()).into_middleware())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{get, run};
    use http::{Request, StatusCode};
    use keel_core::handler_fn;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn capture() -> (Handler, Arc<Mutex<Option<String>>>) {
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let handler = handler_fn(move |ctx: Context| {
            let slot = Arc::clone(&slot);
            async move {
                *slot.lock() = ctx.request_id().map(str::to_string);
                ctx.string(StatusCode::OK, "ok");
            }
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn test_generates_and_exposes_id() {
        let (endpoint, seen) = capture();
        let writer = run(RequestIdStage::default().into_middleware(), endpoint, get("/"), "").await;

        let header = writer.header("x-request-id").unwrap();
        let header = header.to_str().unwrap();
        assert_eq!(header.len(), 32);
        assert!(header.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(seen.lock().as_deref(), Some(header));
    }

    #[tokio::test]
    async fn test_reuses_inbound_id() {
        let (endpoint, seen) = capture();
        let request = Request::get("/")
            .header("X-Request-ID", "abc-123")
            .body(bytes::Bytes::new())
            .unwrap();
        let writer = run(RequestIdStage::default().into_middleware(), endpoint, request, "").await;

        assert_eq!(writer.header("x-request-id").unwrap(), "abc-123");
        assert_eq!(seen.lock().as_deref(), Some("abc-123"));
    }

    #[tokio::test]
    async fn test_custom_header_and_ulid() {
        let stage = RequestIdStage::new(RequestIdOptions {
            header: "X-Correlation-ID".to_string(),
            generator: IdGenerator::Ulid,
        });
        let (endpoint, _) = capture();
        let writer = run(stage.into_middleware(), endpoint, get("/"), "").await;

        let id = writer.header("x-correlation-id").unwrap();
        assert_eq!(id.len(), 26);
        assert!(writer.header("x-request-id").is_none());
    }

    #[test]
    fn test_random_hex_ids_are_unique() {
        let ids: HashSet<String> = (0..100_000).map(|_| random_hex()).collect();
        assert_eq!(ids.len(), 100_000);
    }

    #[test]
    fn test_ulids_are_unique_and_sortable() {
        let ids: Vec<String> = (0..100_000).map(|_| ulid()).collect();
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.iter().all(|id| id.len() == 26));
    }

    #[test]
    fn test_fallback_shape() {
        let a = fallback_id();
        let b = fallback_id();
        assert_ne!(a, b);
        assert!(a.contains(':'));
    }

    #[test]
    fn test_crockford_bounds() {
        assert_eq!(encode_crockford(0), "0".repeat(26));
        assert_eq!(encode_crockford(u128::MAX), format!("7{}", "Z".repeat(25)));
    }

    proptest! {
        #[test]
        fn prop_crockford_preserves_order(a: u128, b: u128) {
            let (ea, eb) = (encode_crockford(a), encode_crockford(b));
            prop_assert_eq!(ea.len(), 26);
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }
    }
}
