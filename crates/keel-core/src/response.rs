//! Shared, write-once response state.
//!
//! Every clone of a [`ResponseWriter`] points at the same state, so a
//! middleware that races its handler (timeout) and the handler itself write
//! through the same slot. The first [`write`](ResponseWriter::write) commits
//! the response; later writes and header changes are ignored.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Response, StatusCode};
use http_body_util::Full;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct State {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    committed: bool,
}

/// Handle to the response being built for one request.
#[derive(Debug, Clone, Default)]
pub struct ResponseWriter {
    state: Arc<Mutex<State>>,
}

impl ResponseWriter {
    /// Creates an empty, uncommitted response.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a header. Returns `false` if the response is already committed.
    pub fn set_header(&self, name: HeaderName, value: HeaderValue) -> bool {
        let mut state = self.state.lock();
        if state.committed {
            return false;
        }
        state.headers.insert(name, value);
        true
    }

    /// Sets a header from strings. Invalid names or values are ignored.
    pub fn set_header_str(&self, name: &str, value: &str) -> bool {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => self.set_header(name, value),
            _ => false,
        }
    }

    /// Appends a header value without replacing existing ones.
    pub fn append_header(&self, name: HeaderName, value: HeaderValue) -> bool {
        let mut state = self.state.lock();
        if state.committed {
            return false;
        }
        state.headers.append(name, value);
        true
    }

    /// Current value of a response header.
    pub fn header(&self, name: &str) -> Option<HeaderValue> {
        self.state.lock().headers.get(name).cloned()
    }

    /// Commits status, content type and body.
    ///
    /// Returns `false` when a previous write already committed the response.
    pub fn write(&self, status: StatusCode, content_type: Option<&'static str>, body: Bytes) -> bool {
        let mut state = self.state.lock();
        if state.committed {
            return false;
        }
        if let Some(content_type) = content_type {
            state
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        state.status = status;
        state.body = body;
        state.committed = true;
        true
    }

    /// True once a body has been written.
    pub fn is_committed(&self) -> bool {
        self.state.lock().committed
    }

    /// Status written so far (200 until committed).
    pub fn status(&self) -> StatusCode {
        self.state.lock().status
    }

    /// Body written so far.
    pub fn body(&self) -> Bytes {
        self.state.lock().body.clone()
    }

    /// Rewrites headers and body of a committed response.
    ///
    /// Reserved for outer middlewares that post-process the final bytes, such
    /// as compression. Does nothing before the response is committed.
    pub fn transform<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut HeaderMap, &mut Bytes),
    {
        let mut state = self.state.lock();
        if !state.committed {
            return false;
        }
        let State { headers, body, .. } = &mut *state;
        f(headers, body);
        true
    }

    /// Builds the transport response, leaving the writer empty.
    pub fn take_response(&self) -> Response<Full<Bytes>> {
        let mut state = self.state.lock();
        let status = state.status;
        let mut headers = std::mem::take(&mut state.headers);
        let body = std::mem::take(&mut state.body);
        state.committed = true;
        drop(state);

        if let Ok(len) = HeaderValue::from_str(&body.len().to_string()) {
            headers.insert(CONTENT_LENGTH, len);
        }
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_write_wins() {
        let writer = ResponseWriter::new();
        assert!(writer.write(StatusCode::GATEWAY_TIMEOUT, None, Bytes::from("late")));
        let clone = writer.clone();
        assert!(!clone.write(StatusCode::OK, None, Bytes::from("ok")));
        assert_eq!(writer.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(writer.body(), Bytes::from("late"));
    }

    #[test]
    fn test_headers_frozen_after_commit() {
        let writer = ResponseWriter::new();
        assert!(writer.set_header_str("x-before", "1"));
        writer.write(StatusCode::OK, Some("text/plain"), Bytes::new());
        assert!(!writer.set_header_str("x-after", "1"));
        assert!(writer.header("x-before").is_some());
        assert!(writer.header("x-after").is_none());
        assert_eq!(writer.header("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn test_transform_requires_commit() {
        let writer = ResponseWriter::new();
        assert!(!writer.transform(|_, body| *body = Bytes::from("x")));
        writer.write(StatusCode::OK, None, Bytes::from("abc"));
        assert!(writer.transform(|headers, body| {
            headers.insert("x-len", HeaderValue::from(body.len()));
            *body = Bytes::from("cba");
        }));
        assert_eq!(writer.body(), Bytes::from("cba"));
    }

    #[test]
    fn test_take_response_sets_length() {
        let writer = ResponseWriter::new();
        writer.write(StatusCode::CREATED, Some("application/json"), Bytes::from("{}"));
        let response = writer.take_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[CONTENT_LENGTH], "2");
    }

    #[test]
    fn test_uncommitted_defaults_to_ok() {
        let writer = ResponseWriter::new();
        assert_eq!(writer.status(), StatusCode::OK);
        assert!(!writer.is_committed());
    }
}
