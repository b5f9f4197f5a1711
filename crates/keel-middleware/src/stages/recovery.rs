//! Panic recovery.
//!
//! Catches panics raised anywhere below it in the chain, logs them with the
//! stack of the panic site, and answers with the `Panic` error envelope.
//! The stack is only shown to clients when `enable_stack_trace` is set and
//! `APP_ENV` is not production.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};

use futures_util::FutureExt;
use keel_config::{MiddlewareName, RecoveryOptions, ReloadableMiddleware, DEFAULT_REQUEST_ID_HEADER};
use keel_core::{is_production, BoxFuture, Context, Handler, KeelError, Middleware, RequestId};
use parking_lot::RwLock;
use tracing::error;

use crate::error::FactoryError;
use crate::factory::{downcast, AnyConfig, MiddlewareFactory};
use crate::stage::Stage;

/// Callback fired with the context, panic message and stack before the
/// error response is written.
pub type PanicCallback = Arc<dyn Fn(&Context, &str, &str) + Send + Sync>;

thread_local! {
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Installs a process-wide hook recording the stack of each panic on the
/// panicking thread. The previous hook still runs.
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = Backtrace::force_capture().to_string();
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

/// Stack recorded for the latest panic on this thread, if any.
pub fn take_panic_stack() -> Option<String> {
    LAST_PANIC.with(|slot| slot.borrow_mut().take())
}

/// Text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Converts panics into `500` error responses.
pub struct RecoveryStage {
    options: Arc<RwLock<RecoveryOptions>>,
    on_panic: Option<PanicCallback>,
    request_id_header: String,
}

impl RecoveryStage {
    /// Creates the stage and installs the panic hook.
    pub fn new(options: RecoveryOptions) -> Self {
        install_panic_hook();
        Self {
            options: Arc::new(RwLock::new(options)),
            on_panic: None,
            request_id_header: DEFAULT_REQUEST_ID_HEADER.to_string(),
        }
    }

    /// Sets the callback fired for each recovered panic.
    pub fn on_panic<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Context, &str, &str) + Send + Sync + 'static,
    {
        self.on_panic = Some(Arc::new(callback));
        self
    }

    /// Response header the request id stage writes, used to correlate the
    /// panic log with the response.
    pub fn request_id_header(mut self, header: &str) -> Self {
        self.request_id_header = header.to_string();
        self
    }

    /// Shared options, updated in place on reload.
    pub fn options(&self) -> Arc<RwLock<RecoveryOptions>> {
        Arc::clone(&self.options)
    }

    fn request_id(&self, ctx: &Context) -> Option<String> {
        ctx.request_id().map(str::to_string).or_else(|| {
            ctx.response()
                .header(&self.request_id_header)
                .and_then(|v| v.to_str().ok().map(str::to_string))
        })
    }
}

impl Default for RecoveryStage {
    fn default() -> Self {
        Self::new(RecoveryOptions::default())
    }
}

impl Stage for RecoveryStage {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Err(payload) = AssertUnwindSafe(next(ctx.clone())).catch_unwind().await else {
                return;
            };

            let message = panic_message(payload.as_ref());
            let stack = take_panic_stack()
                .unwrap_or_else(|| Backtrace::force_capture().to_string());
            let request_id = self.request_id(&ctx);

            error!(
                panic_value = %message,
                stack = %stack,
                path = %ctx.path(),
                method = %ctx.method(),
                request_id = request_id.as_deref().unwrap_or(""),
                "panic recovered"
            );

            if let Some(callback) = &self.on_panic {
                callback(&ctx, &message, &stack);
            }

            let show_stack = self.options.read().enable_stack_trace && !is_production();
            let client_message = if show_stack {
                format!("{message}\n{stack}")
            } else {
                message
            };

            let mut ctx = ctx;
            if let Some(id) = request_id {
                ctx.insert_value(RequestId(id));
            }
            ctx.error(&KeelError::Panic {
                message: client_message,
            });
        })
    }
}

/// Builds [`RecoveryStage`] from [`RecoveryOptions`].
#[derive(Debug, Clone, Copy)]
pub struct RecoveryFactory;

impl MiddlewareFactory for RecoveryFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::Recovery
    }

    fn create(&self, config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        let options: &RecoveryOptions = downcast(self.name(), config)?;
        Ok(RecoveryStage::new(options.clone()).into_middleware())
    }

    fn create_live(
        &self,
        config: &dyn AnyConfig,
        live: &ReloadableMiddleware,
    ) -> Result<Middleware, FactoryError> {
        let options: &RecoveryOptions = downcast(self.name(), config)?;
        let stage = RecoveryStage::new(options.clone())
            .request_id_header(&live.get_options().request_id.header);
        let shared = stage.options();
        live.on_recovery_change(move |next| {
            *shared.write() = next.clone();
            Ok(())
        });
        Ok(stage.into_middleware())
    }
}
