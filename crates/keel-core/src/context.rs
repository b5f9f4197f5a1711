//! Per-request context.
//!
//! A [`Context`] is handed by value down the middleware chain. It carries:
//!
//! - the immutable request (method, URI, headers, collected body, peer address)
//! - route parameters filled in by the router
//! - a typed value map ([`http::Extensions`]) for cross-middleware data such as
//!   [`RequestId`], [`Deadline`] or authenticated claims
//! - the negotiated response language
//! - a shared [`ResponseWriter`]
//!
//! Cloning is cheap: the request is reference counted and the writer is shared,
//! so a clone written to by a spawned task still answers the same request.
//! Values inserted by a middleware are visible to everything it calls, never
//! to its callers.

use crate::envelope::{self, Envelope};
use crate::error::{is_production, KeelError, KeelResult};
use crate::response::ResponseWriter;
use crate::validate::Validate;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, ACCEPT_LANGUAGE, CONTENT_TYPE};
use http::request::Parts;
use http::{Extensions, HeaderMap, Method, Request, StatusCode, Uri};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::time::Instant;

const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";
const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";
const DEFAULT_LANG: &str = "en";

/// Correlation id stored in the context value map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    /// Borrows the id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Route pattern that matched the request (`/users/{id}`), set by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedPath(pub String);

/// Absolute deadline for the request, set by the timeout middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(pub Instant);

#[derive(Debug)]
struct RequestData {
    parts: Parts,
    body: Bytes,
    remote_addr: String,
    tls: bool,
}

/// Request-scoped context passed to handlers and middlewares.
#[derive(Clone)]
pub struct Context {
    request: Arc<RequestData>,
    params: Arc<[(String, String)]>,
    values: Extensions,
    lang: String,
    response: ResponseWriter,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", self.method())
            .field("uri", self.uri())
            .field("remote_addr", &self.request.remote_addr)
            .field("params", &self.params)
            .field("lang", &self.lang)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Creates a context with no peer address.
    pub fn new(request: Request<Bytes>) -> Self {
        Self::from_request(request, String::new(), false)
    }

    /// Creates a context for a request received from `remote_addr`.
    pub fn from_request(request: Request<Bytes>, remote_addr: impl Into<String>, tls: bool) -> Self {
        let (parts, body) = request.into_parts();
        let lang = parts
            .headers
            .get(ACCEPT_LANGUAGE)
            .and_then(|v| v.to_str().ok())
            .and_then(primary_language)
            .unwrap_or_else(|| DEFAULT_LANG.to_string());
        Self {
            request: Arc::new(RequestData {
                parts,
                body,
                remote_addr: remote_addr.into(),
                tls,
            }),
            params: Arc::from(Vec::new()),
            values: Extensions::new(),
            lang,
            response: ResponseWriter::new(),
        }
    }

    /// Replaces the route parameters.
    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = Arc::from(params);
        self
    }

    // ---- request --------------------------------------------------------

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.request.parts.method
    }

    /// Request URI.
    pub fn uri(&self) -> &Uri {
        &self.request.parts.uri
    }

    /// Request path without query.
    pub fn path(&self) -> &str {
        self.request.parts.uri.path()
    }

    /// All request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.request.parts.headers
    }

    /// A request header as UTF-8, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.request
            .parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
    }

    /// First value of a query parameter, percent-decoded.
    pub fn query(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// All query parameters in order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.uri()
            .query()
            .and_then(|q| serde_urlencoded::from_str(q).ok())
            .unwrap_or_default()
    }

    /// A route parameter captured by the router.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// All route parameters.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Collected request body.
    pub fn body(&self) -> &Bytes {
        &self.request.body
    }

    /// Transport peer address as received (e.g. `[::1]:8080`).
    pub fn remote_addr(&self) -> &str {
        &self.request.remote_addr
    }

    /// Peer IP parsed from [`remote_addr`](Self::remote_addr).
    pub fn remote_ip(&self) -> Option<IpAddr> {
        parse_ip(&self.request.remote_addr)
    }

    /// True when the connection is TLS.
    pub fn is_tls(&self) -> bool {
        self.request.tls
    }

    /// Raw request head.
    pub fn parts(&self) -> &Parts {
        &self.request.parts
    }

    // ---- values ---------------------------------------------------------

    /// Reads a typed value.
    pub fn value<T: Clone + Send + Sync + 'static>(&self) -> Option<&T> {
        self.values.get::<T>()
    }

    /// Inserts a typed value, returning the previous one.
    pub fn insert_value<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.values.insert(value)
    }

    /// Builder form of [`insert_value`](Self::insert_value).
    pub fn with_value<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.values.insert(value);
        self
    }

    /// Correlation id, once the request id middleware has run.
    pub fn request_id(&self) -> Option<&str> {
        self.value::<RequestId>().map(RequestId::as_str)
    }

    /// Matched route pattern, falling back to the raw path.
    pub fn route_pattern(&self) -> &str {
        self.value::<MatchedPath>()
            .map_or_else(|| self.path(), |m| m.0.as_str())
    }

    /// Response language tag.
    pub fn lang(&self) -> &str {
        &self.lang
    }

    /// Overrides the response language.
    pub fn set_lang(&mut self, lang: impl Into<String>) {
        self.lang = lang.into();
    }

    // ---- cancellation ---------------------------------------------------

    /// Deadline set by the timeout middleware.
    pub fn deadline(&self) -> Option<Instant> {
        self.value::<Deadline>().map(|d| d.0)
    }

    /// Resolves when the deadline passes; never resolves without one.
    pub async fn done(&self) {
        match self.deadline() {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    // ---- response -------------------------------------------------------

    /// Shared response writer.
    pub fn response(&self) -> &ResponseWriter {
        &self.response
    }

    /// Sets a response header. Ignored after the response is committed.
    pub fn set_header(&self, name: &str, value: &str) -> bool {
        self.response.set_header_str(name, value)
    }

    /// Sets a response header from typed parts.
    pub fn set_header_typed(&self, name: HeaderName, value: HeaderValue) -> bool {
        self.response.set_header(name, value)
    }

    /// Writes `value` as JSON.
    pub fn json<T: Serialize + ?Sized>(&self, status: StatusCode, value: &T) -> bool {
        match serde_json::to_vec(value) {
            Ok(body) => self
                .response
                .write(status, Some(CONTENT_TYPE_JSON), Bytes::from(body)),
            Err(err) => self.error(&KeelError::internal_with_source(
                "failed to serialize response",
                err,
            )),
        }
    }

    /// Writes a plain-text body.
    pub fn string(&self, status: StatusCode, text: impl Into<String>) -> bool {
        self.response
            .write(status, Some(CONTENT_TYPE_TEXT), Bytes::from(text.into()))
    }

    /// Writes raw bytes with an explicit content type.
    pub fn bytes(&self, status: StatusCode, content_type: &'static str, body: Bytes) -> bool {
        self.response.write(status, Some(content_type), body)
    }

    /// Writes a success envelope around `data`.
    pub fn success<T: Serialize + ?Sized>(&self, data: &T) -> bool {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(err) => {
                return self.error(&KeelError::internal_with_source(
                    "failed to serialize response",
                    err,
                ))
            }
        };
        self.write_envelope(StatusCode::OK, |env, lang| env.fill_success(Some(data), lang))
    }

    /// Writes the error envelope for `err`.
    pub fn error(&self, err: &KeelError) -> bool {
        let production = is_production();
        self.write_envelope(err.status_code(), |env, lang| {
            env.fill_error(err, lang, production);
        })
    }

    fn write_envelope<F>(&self, status: StatusCode, fill: F) -> bool
    where
        F: FnOnce(&mut Envelope, &str),
    {
        let mut envelope = envelope::acquire();
        fill(&mut envelope, &self.lang);
        if let Some(request_id) = self.request_id() {
            envelope.set_request_id(request_id);
        }
        match envelope.to_bytes() {
            Ok(body) => self.response.write(status, Some(CONTENT_TYPE_JSON), body),
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize response envelope");
                self.response.write(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some(CONTENT_TYPE_TEXT),
                    Bytes::from_static(b"internal server error"),
                )
            }
        }
    }

    // ---- binding --------------------------------------------------------

    /// Decodes the body according to its content type.
    ///
    /// `application/x-www-form-urlencoded` bodies are decoded as forms; every
    /// other content type is treated as JSON.
    pub fn bind<T: DeserializeOwned>(&self) -> KeelResult<T> {
        let body = self.body();
        if body.is_empty() {
            return Err(KeelError::invalid_request("empty request body"));
        }
        let is_form = self
            .header(CONTENT_TYPE.as_str())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        if is_form {
            serde_urlencoded::from_bytes(body)
                .map_err(|e| KeelError::invalid_request(format!("invalid form body: {e}")))
        } else {
            serde_json::from_slice(body)
                .map_err(|e| KeelError::invalid_request(format!("invalid JSON body: {e}")))
        }
    }

    /// Decodes the query string into `T`.
    pub fn bind_query<T: DeserializeOwned>(&self) -> KeelResult<T> {
        serde_urlencoded::from_str(self.uri().query().unwrap_or(""))
            .map_err(|e| KeelError::invalid_request(format!("invalid query: {e}")))
    }

    /// Decodes the body then runs [`Validate`].
    pub fn bind_valid<T: DeserializeOwned + Validate>(&self) -> KeelResult<T> {
        let value: T = self.bind()?;
        let fields = value.validate();
        if fields.is_empty() {
            Ok(value)
        } else {
            Err(KeelError::validation(fields))
        }
    }
}

fn primary_language(header: &str) -> Option<String> {
    let tag = header.split(',').next()?.split(';').next()?.trim();
    if tag.is_empty() || tag == "*" {
        None
    } else {
        Some(tag.to_string())
    }
}

/// Extracts the IP from `ip`, `ip:port` or `[ipv6]:port`.
pub fn parse_ip(addr: &str) -> Option<IpAddr> {
    let addr = addr.trim();
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return Some(socket.ip());
    }
    addr.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
}
