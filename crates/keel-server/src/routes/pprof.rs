//! Profiling endpoints.
//!
//! Rust has no built-in sampling profiler runtime, so only the endpoints that
//! can be answered from the process itself return data:
//!
//! | Path                 | Answer                                  |
//! |----------------------|-----------------------------------------|
//! | `<prefix>/`          | enabled endpoints                       |
//! | `<prefix>/cmdline`   | NUL-separated command line              |
//! | `<prefix>/runtime`   | tokio worker and task counts            |
//! | `<prefix>/profile`   | `501`                                   |
//! | `<prefix>/symbol`    | `501`                                   |
//! | `<prefix>/trace`     | `501`                                   |
//!
//! Each endpoint is only routed when its `enable_*` flag is set.

use bytes::Bytes;
use http::StatusCode;
use keel_config::{MiddlewareName, PprofOptions};
use keel_core::errno::builtin;
use keel_core::{handler_fn, Context, Handler, KeelError, Router};
use keel_middleware::factory::downcast;
use keel_middleware::{AnyConfig, FactoryError, RouteRegistrar};
use serde::Serialize;

use crate::router::join_path;

/// Snapshot of the async runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeSnapshot {
    /// Runtime flavor.
    pub flavor: String,
    /// Worker threads.
    pub workers: usize,
    /// Tasks currently alive.
    pub alive_tasks: usize,
}

impl RuntimeSnapshot {
    /// Reads the current runtime, if any.
    pub fn capture() -> Option<Self> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let metrics = handle.metrics();
        Some(Self {
            flavor: format!("{:?}", handle.runtime_flavor()),
            workers: metrics.num_workers(),
            alive_tasks: metrics.num_alive_tasks(),
        })
    }
}

fn cmdline() -> Handler {
    handler_fn(|ctx: Context| async move {
        let line = std::env::args().collect::<Vec<_>>().join("\0");
        ctx.bytes(StatusCode::OK, "text/plain; charset=utf-8", Bytes::from(line));
    })
}

fn runtime() -> Handler {
    handler_fn(|ctx: Context| async move {
        match RuntimeSnapshot::capture() {
            Some(snapshot) => {
                ctx.json(StatusCode::OK, &snapshot);
            }
            None => {
                ctx.error(&KeelError::unavailable("no async runtime"));
            }
        }
    })
}

fn not_implemented(what: &'static str) -> Handler {
    handler_fn(move |ctx: Context| async move {
        ctx.error(&KeelError::coded_with_message(
            builtin::NOT_IMPLEMENTED,
            format!("{what} profiling is not available"),
        ));
    })
}

/// Registers the profiling endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct PprofRegistrar;

impl RouteRegistrar for PprofRegistrar {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::Pprof
    }

    fn register_routes(&self, router: &mut dyn Router, config: &dyn AnyConfig) -> Result<(), FactoryError> {
        let options: &PprofOptions = downcast(self.name(), config)?;
        let options = options.clone().complete();

        let mut endpoints: Vec<(&'static str, Handler)> = Vec::new();
        if options.enable_cmdline {
            endpoints.push(("cmdline", cmdline()));
        }
        if options.enable_runtime {
            endpoints.push(("runtime", runtime()));
        }
        if options.enable_profile {
            endpoints.push(("profile", not_implemented("CPU")));
        }
        if options.enable_symbol {
            endpoints.push(("symbol", not_implemented("symbol")));
        }
        if options.enable_trace {
            endpoints.push(("trace", not_implemented("execution trace")));
        }

        let names: Vec<&'static str> = endpoints.iter().map(|(name, _)| *name).collect();
        let index = handler_fn(move |ctx: Context| {
            let names = names.clone();
            async move {
                ctx.json(StatusCode::OK, &serde_json::json!({ "endpoints": names }));
            }
        });
        router.get(&join_path(&options.prefix, "/"), index)?;
        for (name, handler) in endpoints {
            router.get(&join_path(&options.prefix, name), handler)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::tests::fetch;
    use crate::HttpRouter;

    fn router(options: &PprofOptions) -> HttpRouter {
        let mut router = HttpRouter::new();
        PprofRegistrar.register_routes(&mut router, options).unwrap();
        router
    }

    #[tokio::test]
    async fn test_index_lists_enabled() {
        let options = PprofOptions {
            enable_trace: false,
            ..PprofOptions::default()
        };
        let router = router(&options);
        let writer = fetch(&router, "/debug/pprof").await;
        let body: serde_json::Value = serde_json::from_slice(&writer.body()).unwrap();
        assert_eq!(
            body["endpoints"],
            serde_json::json!(["cmdline", "runtime", "profile", "symbol"])
        );
        assert_eq!(fetch(&router, "/debug/pprof/trace").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_runtime_snapshot() {
        let router = router(&PprofOptions::default());
        let writer = fetch(&router, "/debug/pprof/runtime").await;
        assert_eq!(writer.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&writer.body()).unwrap();
        assert!(body["workers"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_profile_is_501_envelope() {
        let router = router(&PprofOptions::default());
        let writer = fetch(&router, "/debug/pprof/profile").await;
        assert_eq!(writer.status(), StatusCode::NOT_IMPLEMENTED);
        let body: serde_json::Value = serde_json::from_slice(&writer.body()).unwrap();
        assert_eq!(body["code"], builtin::NOT_IMPLEMENTED.code());
    }

    #[tokio::test]
    async fn test_cmdline_is_text() {
        let router = router(&PprofOptions::default());
        let writer = fetch(&router, "/debug/pprof/cmdline").await;
        assert_eq!(writer.status(), StatusCode::OK);
        assert!(!writer.body().is_empty());
    }
}
