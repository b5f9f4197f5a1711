//! Request authorization.
//!
//! Each request is reduced to a `(subject, resource, action)` triple and
//! handed to an [`Authorizer`]. By default the subject comes from the
//! [`Claims`] left by the authentication stage, the resource is the first
//! path segment after the longest matching API prefix (`/api/v1/orders/7`
//! gives `orders`), and the action is derived from the method.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::USER_AGENT;
use http::Method;
use keel_config::{AuthzOptions, MiddlewareName, PathMatcher};
use keel_core::{BoxFuture, Context, Handler, KeelError, Middleware};
use keel_telemetry::AUDIT_TARGET;
use tracing::warn;

use super::auth::Claims;
use crate::error::FactoryError;
use crate::factory::{AnyConfig, MiddlewareFactory};
use crate::stage::Stage;

/// Decides whether a subject may perform an action on a resource.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Returns `Ok(true)` to allow the request.
    async fn authorize(
        &self,
        ctx: &Context,
        subject: &str,
        resource: &str,
        action: &str,
    ) -> Result<bool, KeelError>;
}

/// Derives one element of the authorization triple.
pub type Extractor = Arc<dyn Fn(&Context) -> String + Send + Sync>;

/// Action for `method`: reads, creates, updates and deletes map to CRUD verbs.
pub fn action_for(method: &Method) -> String {
    match *method {
        Method::GET | Method::HEAD => "read".to_string(),
        Method::POST => "create".to_string(),
        Method::PUT | Method::PATCH => "update".to_string(),
        Method::DELETE => "delete".to_string(),
        ref other => other.as_str().to_ascii_lowercase(),
    }
}

/// First path segment after the longest matching prefix, or `/`.
pub fn resource_for(path: &str, prefixes: &[String]) -> String {
    let rest = prefixes
        .iter()
        .filter(|prefix| {
            path == prefix.as_str()
                || path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
        .max_by_key(|prefix| prefix.len())
        .map_or(path, |prefix| &path[prefix.len()..]);
    rest.split('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("/")
        .to_string()
}

/// Enforces an [`Authorizer`] decision on every request.
pub struct AuthzStage {
    authorizer: Arc<dyn Authorizer>,
    prefixes: Vec<String>,
    skip: PathMatcher,
    subject: Option<Extractor>,
    resource: Option<Extractor>,
    action: Option<Extractor>,
}

impl std::fmt::Debug for AuthzStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthzStage")
            .field("prefixes", &self.prefixes)
            .field("skip", &self.skip)
            .finish_non_exhaustive()
    }
}

impl AuthzStage {
    /// Creates the stage.
    pub fn new(authorizer: Arc<dyn Authorizer>, options: AuthzOptions) -> Self {
        let options = options.complete();
        Self {
            authorizer,
            prefixes: options.api_prefixes,
            skip: options.skip,
            subject: None,
            resource: None,
            action: None,
        }
    }

    /// Overrides how the subject is found.
    #[must_use]
    pub fn subject_extractor<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> String + Send + Sync + 'static,
    {
        self.subject = Some(Arc::new(f));
        self
    }

    /// Overrides how the resource is found.
    #[must_use]
    pub fn resource_extractor<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> String + Send + Sync + 'static,
    {
        self.resource = Some(Arc::new(f));
        self
    }

    /// Overrides how the action is found.
    #[must_use]
    pub fn action_extractor<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> String + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(f));
        self
    }

    fn triple(&self, ctx: &Context) -> (String, String, String) {
        let subject = self.subject.as_ref().map_or_else(
            || {
                ctx.value::<Claims>()
                    .map(|c| c.subject.clone())
                    .unwrap_or_default()
            },
            |f| f(ctx),
        );
        let resource = self
            .resource
            .as_ref()
            .map_or_else(|| resource_for(ctx.path(), &self.prefixes), |f| f(ctx));
        let action = self
            .action
            .as_ref()
            .map_or_else(|| action_for(ctx.method()), |f| f(ctx));
        (subject, resource, action)
    }
}

fn audit_denied(ctx: &Context, subject: &str, resource: &str, action: &str, reason: &str) {
    warn!(
        target: AUDIT_TARGET,
        event = "authorization_denied",
        subject,
        resource,
        action,
        reason,
        remote_addr = %ctx.remote_addr(),
        path = %ctx.path(),
        method = %ctx.method(),
        user_agent = ctx.header(USER_AGENT.as_str()).unwrap_or(""),
        request_id = ctx.request_id().unwrap_or(""),
        "authorization denied"
    );
}

impl Stage for AuthzStage {
    fn name(&self) -> &'static str {
        "authz"
    }

    fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if self.skip.should_skip(ctx.path()) {
                next(ctx).await;
                return;
            }

            let (subject, resource, action) = self.triple(&ctx);
            if subject.is_empty() {
                audit_denied(&ctx, &subject, &resource, &action, "no subject");
                ctx.error(&KeelError::unauthorized("authentication required"));
                return;
            }

            match self
                .authorizer
                .authorize(&ctx, &subject, &resource, &action)
                .await
            {
                Ok(true) => next(ctx).await,
                Ok(false) => {
                    audit_denied(&ctx, &subject, &resource, &action, "policy denied");
                    ctx.error(&KeelError::no_permission(format!(
                        "{subject} may not {action} {resource}"
                    )));
                }
                Err(err) => {
                    audit_denied(&ctx, &subject, &resource, &action, &err.to_string());
                    ctx.error(&KeelError::no_permission("authorization check failed"));
                }
            }
        })
    }
}

/// Placeholder factory: authorization needs an [`Authorizer`], so the stage
/// is built by the host with [`AuthzStage::new`].
#[derive(Debug, Clone, Copy)]
pub struct AuthzFactory;

impl MiddlewareFactory for AuthzFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::Authz
    }

    fn needs_runtime(&self) -> bool {
        true
    }

    fn create(&self, _config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        Err(FactoryError::NeedsRuntime(self.name().as_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{counting_endpoint, envelope, run};
    use bytes::Bytes;
    use http::{Request, StatusCode};
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;

    /// Allows `admin` everything and everyone else `read`, recording calls.
    #[derive(Default)]
    struct RolePolicy {
        seen: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl Authorizer for RolePolicy {
        async fn authorize(
            &self,
            _ctx: &Context,
            subject: &str,
            resource: &str,
            action: &str,
        ) -> Result<bool, KeelError> {
            self.seen
                .lock()
                .push((subject.to_string(), resource.to_string(), action.to_string()));
            if resource == "broken" {
                return Err(KeelError::internal("policy store down"));
            }
            Ok(subject == "admin" || action == "read")
        }
    }

    fn request(method: Method, path: &str, subject: Option<&str>) -> Context {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .body(Bytes::new())
            .unwrap();
        let ctx = Context::from_request(request, "192.0.2.1:1", false);
        match subject {
            Some(subject) => ctx.with_value(Claims::new(subject)),
            None => ctx,
        }
    }

    async fn call(stage: Middleware, ctx: Context) -> keel_core::ResponseWriter {
        let (endpoint, _) = counting_endpoint();
        let handler = keel_core::chain(&[stage], endpoint);
        let writer = ctx.response().clone();
        handler(ctx).await;
        writer
    }

    #[test]
    fn test_action_mapping() {
        assert_eq!(action_for(&Method::GET), "read");
        assert_eq!(action_for(&Method::HEAD), "read");
        assert_eq!(action_for(&Method::POST), "create");
        assert_eq!(action_for(&Method::PATCH), "update");
        assert_eq!(action_for(&Method::DELETE), "delete");
        assert_eq!(action_for(&Method::OPTIONS), "options");
    }

    #[test]
    fn test_resource_uses_longest_prefix() {
        let prefixes = AuthzOptions::default().api_prefixes;
        assert_eq!(resource_for("/api/v1/orders/7", &prefixes), "orders");
        assert_eq!(resource_for("/api/users", &prefixes), "users");
        assert_eq!(resource_for("/v2/items", &prefixes), "items");
        assert_eq!(resource_for("/apiary/bees", &prefixes), "apiary");
        assert_eq!(resource_for("/api/v1", &prefixes), "/");
        assert_eq!(resource_for("/", &prefixes), "/");
    }

    #[tokio::test]
    async fn test_allow_and_deny() {
        let policy = Arc::new(RolePolicy::default());
        let stage = AuthzStage::new(Arc::clone(&policy) as Arc<dyn Authorizer>, AuthzOptions::default())
            .into_middleware();

        let read = call(stage.clone(), request(Method::GET, "/api/v1/orders", Some("bob"))).await;
        assert_eq!(read.status(), StatusCode::OK);

        let write = call(stage.clone(), request(Method::POST, "/api/v1/orders", Some("bob"))).await;
        assert_eq!(write.status(), StatusCode::FORBIDDEN);
        assert_eq!(envelope(&write)["http_code"], 403);

        let admin = call(stage, request(Method::DELETE, "/api/v1/orders/1", Some("admin"))).await;
        assert_eq!(admin.status(), StatusCode::OK);

        let seen = policy.seen.lock();
        assert_eq!(
            seen[1],
            ("bob".to_string(), "orders".to_string(), "create".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_subject_is_401() {
        let stage = AuthzStage::new(Arc::new(RolePolicy::default()), AuthzOptions::default())
            .into_middleware();
        let writer = call(stage, request(Method::GET, "/api/v1/orders", None)).await;
        assert_eq!(writer.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_policy_error_is_forbidden() {
        let stage = AuthzStage::new(Arc::new(RolePolicy::default()), AuthzOptions::default())
            .into_middleware();
        let writer = call(stage, request(Method::GET, "/api/broken", Some("admin"))).await;
        assert_eq!(writer.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_custom_extractors_and_skip() {
        let policy = Arc::new(RolePolicy::default());
        let stage = AuthzStage::new(
            Arc::clone(&policy) as Arc<dyn Authorizer>,
            AuthzOptions {
                skip: PathMatcher::paths(["/health"]),
                ..AuthzOptions::default()
            },
        )
        .subject_extractor(|ctx| ctx.header("x-user").unwrap_or_default().to_string())
        .resource_extractor(|_| "reports".to_string())
        .action_extractor(|_| "export".to_string())
        .into_middleware();

        let (endpoint, calls) = counting_endpoint();
        run(stage.clone(), endpoint, Request::get("/health").body(Bytes::new()).unwrap(), "").await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(policy.seen.lock().is_empty());

        let request = Request::get("/anything")
            .header("x-user", "admin")
            .body(Bytes::new())
            .unwrap();
        let (endpoint, _) = counting_endpoint();
        let writer = run(stage, endpoint, request, "").await;
        assert_eq!(writer.status(), StatusCode::OK);
        assert_eq!(
            policy.seen.lock()[0],
            ("admin".to_string(), "reports".to_string(), "export".to_string())
        );
    }
}
