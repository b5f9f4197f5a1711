//! End-to-end behaviour of an assembled chassis.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use keel::config::{
    ConfigDuration, CorsOptions, LoggerOptions, MiddlewareName, Options, RateLimitOptions, ReloadableMiddleware,
    TimeoutOptions,
};
use keel::core::errno::builtin;
use keel::core::{handler_fn, Context, ResponseWriter, Router};
use keel::middleware::stages::{client_ip, LoggerStage, RecoveryStage, RequestIdStage};
use keel::middleware::{Limiter, MemoryLimiter, Registrar, Stage};
use keel::server::HttpRouter;
use keel::Chassis;
use parking_lot::Mutex;

async fn send(router: &HttpRouter, request: Request<Bytes>) -> ResponseWriter {
    let ctx = Context::new(request);
    let writer = ctx.response().clone();
    router.dispatch(ctx).await;
    writer
}

fn header(writer: &ResponseWriter, name: &str) -> Option<String> {
    writer
        .header(name)
        .and_then(|v| v.to_str().ok().map(str::to_string))
}

async fn explode(_ctx: Context) {
    panic!("boom");
}

#[tokio::test]
async fn test_panic_is_recovered_with_request_id() {
    let captured: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&captured);
    let recovery = RecoveryStage::default().on_panic(move |ctx, message, _stack| {
        assert_eq!(message, "boom");
        *sink.lock() = ctx
            .response()
            .header("X-Request-ID")
            .and_then(|v| v.to_str().ok().map(str::to_string));
    });

    let mut registrar = Registrar::new();
    registrar
        .register_named(
            MiddlewareName::Logger,
            LoggerStage::new(LoggerOptions::default()).into_middleware(),
        )
        .unwrap()
        .register_named(MiddlewareName::Recovery, recovery.into_middleware())
        .unwrap()
        .register_named(MiddlewareName::RequestId, RequestIdStage::default().into_middleware())
        .unwrap();

    let mut router = HttpRouter::new();
    registrar.apply(&mut router);
    router.get("/x", handler_fn(explode)).unwrap();

    let writer = send(&router, Request::get("/x").body(Bytes::new()).unwrap()).await;
    assert_eq!(writer.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body: serde_json::Value = serde_json::from_slice(&writer.body()).unwrap();
    assert_eq!(body["code"], builtin::PANIC.code());
    assert_eq!(body["http_code"], 500);
    assert!(body["message"].as_str().unwrap().contains("boom"), "{body}");

    let id = header(&writer, "X-Request-ID").unwrap();
    assert!(!id.is_empty());
    assert_eq!(body["request_id"], id.as_str());
    assert_eq!(captured.lock().as_deref(), Some(id.as_str()));
}

#[tokio::test]
async fn test_cors_preflight_short_circuits() {
    let options = Options::empty().with_cors(CorsOptions {
        allow_origins: vec!["https://example.com".into()],
        allow_methods: vec!["GET".into(), "POST".into()],
        allow_headers: vec!["Content-Type".into()],
        expose_headers: Vec::new(),
        allow_credentials: true,
        max_age: 3600,
    });
    let service = Chassis::new(options).build().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut router = service.router();
    router
        .handle(
            Method::OPTIONS,
            "/x",
            handler_fn(move |ctx: Context| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    ctx.response().write(StatusCode::OK, None, Bytes::new());
                }
            }),
        )
        .unwrap();

    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/x")
        .header("Origin", "https://example.com")
        .header("Access-Control-Request-Method", "POST")
        .body(Bytes::new())
        .unwrap();
    let writer = send(&router, request).await;

    assert_eq!(writer.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        header(&writer, "Access-Control-Allow-Origin").as_deref(),
        Some("https://example.com")
    );
    assert_eq!(
        header(&writer, "Access-Control-Allow-Methods").as_deref(),
        Some("GET, POST")
    );
    assert_eq!(
        header(&writer, "Access-Control-Allow-Headers").as_deref(),
        Some("Content-Type")
    );
    assert_eq!(
        header(&writer, "Access-Control-Allow-Credentials").as_deref(),
        Some("true")
    );
    assert_eq!(header(&writer, "Access-Control-Max-Age").as_deref(), Some("3600"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_wildcard_origin_with_credentials_is_rejected() {
    let options = Options::empty().with_cors(CorsOptions {
        allow_origins: vec!["*".into()],
        allow_credentials: true,
        ..CorsOptions::default()
    });
    let err = Chassis::new(options).build().unwrap_err();
    let text = err.to_string();
    assert!(text.contains("wildcard"), "{text}");
    assert!(text.contains("credentials"), "{text}");
}

#[tokio::test(start_paused = true)]
async fn test_sliding_window_admits_after_window() {
    let limiter = MemoryLimiter::new(3, Duration::from_secs(1));
    for _ in 0..3 {
        assert!(limiter.allow("client").await.unwrap());
    }
    assert!(!limiter.allow("client").await.unwrap());
    assert!(!limiter.allow("client").await.unwrap());

    tokio::time::advance(Duration::from_millis(1010)).await;
    assert!(limiter.allow("client").await.unwrap());
    limiter.stop();
}

#[test]
fn test_forwarded_for_trusted_only_from_proxies() {
    let trusted = RateLimitOptions {
        trust_proxy_headers: true,
        trusted_proxies: vec!["10.0.0.0/8".into()],
        ..RateLimitOptions::default()
    }
    .trusted_networks();

    let from = |peer: &str| {
        let request = Request::get("/")
            .header("X-Forwarded-For", "203.0.113.1, 198.51.100.1")
            .body(Bytes::new())
            .unwrap();
        Context::from_request(request, peer, false)
    };

    assert_eq!(client_ip(&from("10.0.1.50:51234"), true, &trusted), "203.0.113.1");
    assert_eq!(
        client_ip(&from("192.168.1.100:51234"), true, &trusted),
        "192.168.1.100"
    );
}

#[test]
fn test_invalid_reload_keeps_running_options() {
    let initial = Options::empty()
        .with_timeout(TimeoutOptions {
            timeout: ConfigDuration::from_secs(30),
            ..TimeoutOptions::default()
        })
        .with_cors(CorsOptions::default());
    let live = ReloadableMiddleware::new(initial.complete());

    let mut next = live.get_options();
    next.timeout.timeout = ConfigDuration::from_millis(-1);
    next.cors.allow_origins = Vec::new();

    let err = live.reload(next).unwrap_err();
    let text = err.to_string();
    assert!(text.contains("timeout"), "{text}");
    assert!(text.contains("cors"), "{text}");
    assert_eq!(live.get_options().timeout.timeout, ConfigDuration::from_secs(30));
    assert_eq!(live.get_options().cors.allow_origins, ["*"]);
}
