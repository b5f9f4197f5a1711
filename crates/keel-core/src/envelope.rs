//! The uniform JSON response body.
//!
//! ```json
//! {"code": 0, "http_code": 200, "message": "Success", "data": {...},
//!  "request_id": "9f2c...", "timestamp": 1718000000000}
//! ```
//!
//! `request_id` and `timestamp` are omitted when unset; `data` is omitted when
//! `None`. Envelopes are checked out of a process-wide [`Pool`] so hot paths
//! reuse their string buffers.

use crate::errno::builtin;
use crate::error::KeelError;
use crate::pool::{Pool, Pooled, Reset};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const MAX_IDLE_ENVELOPES: usize = 256;

/// Response body shared by success and error responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Numeric code, 0 on success.
    pub code: u32,
    /// HTTP status echoed into the body.
    pub http_code: u16,
    /// Human-readable message.
    pub message: String,
    /// Payload or error details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Correlation id of the request.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    /// Unix milliseconds at render time.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timestamp: i64,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl Reset for Envelope {
    fn reset(&mut self) {
        self.code = 0;
        self.http_code = 0;
        self.message.clear();
        self.data = None;
        self.request_id.clear();
        self.timestamp = 0;
    }
}

impl Envelope {
    /// Fills a success envelope.
    pub fn fill_success(&mut self, data: Option<serde_json::Value>, lang: &str) {
        self.code = builtin::OK.code();
        self.http_code = builtin::OK.http_code();
        self.message.push_str(builtin::OK.message(lang));
        self.data = data;
        self.stamp();
    }

    /// Fills an error envelope from `err`.
    pub fn fill_error(&mut self, err: &KeelError, lang: &str, production: bool) {
        self.code = err.code();
        self.http_code = err.status_code().as_u16();
        self.message.push_str(&err.public_message(lang, production));
        self.data = err.details();
        self.stamp();
    }

    /// Sets the correlation id.
    pub fn set_request_id(&mut self, request_id: &str) {
        self.request_id.clear();
        self.request_id.push_str(request_id);
    }

    fn stamp(&mut self) {
        self.timestamp = chrono::Utc::now().timestamp_millis();
    }

    /// Serializes to JSON bytes.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Process-wide envelope pool.
pub fn pool() -> &'static Pool<Envelope> {
    static POOL: OnceLock<Pool<Envelope>> = OnceLock::new();
    POOL.get_or_init(|| Pool::new(MAX_IDLE_ENVELOPES))
}

/// Checks an envelope out of the process-wide pool.
pub fn acquire() -> Pooled<'static, Envelope> {
    pool().acquire()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::FieldError;

    #[test]
    fn test_success_omits_empty_fields() {
        let mut env = Envelope::default();
        env.fill_success(None, "en");
        env.timestamp = 0;
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, r#"{"code":0,"http_code":200,"message":"Success"}"#);
    }

    #[test]
    fn test_error_envelope_carries_details() {
        let err = KeelError::validation(vec![FieldError::new("email", "invalid")]);
        let mut env = acquire();
        env.fill_error(&err, "en", false);
        env.set_request_id("abc123");
        assert_eq!(env.code, builtin::VALIDATION_FAILED.code());
        assert_eq!(env.http_code, 400);
        assert_eq!(env.request_id, "abc123");
        assert!(env.timestamp > 0);
        let value: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(value["data"][0]["field"], "email");
    }

    #[test]
    fn test_pooled_envelope_is_clean_on_reuse() {
        let pool: Pool<Envelope> = Pool::new(1);
        {
            let mut env = pool.acquire();
            env.fill_error(&KeelError::RateLimitExceeded, "en", false);
            env.set_request_id("r1");
        }
        let env = pool.acquire();
        assert_eq!(*env, Envelope::default());
    }
}
