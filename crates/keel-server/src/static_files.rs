//! Static directory serving.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use keel_core::{handler_fn, Context, Handler, KeelError, RouteError};
use tracing::warn;

const INDEX_FILE: &str = "index.html";

/// A directory whose files are served read-only.
#[derive(Debug, Clone)]
pub(crate) struct StaticDir {
    root: Arc<PathBuf>,
}

impl StaticDir {
    /// Opens `root`, which must be an existing directory.
    pub(crate) fn open(root: &Path) -> Result<Self, RouteError> {
        let invalid = |reason: String| RouteError::InvalidRoot {
            root: root.display().to_string(),
            reason,
        };
        let metadata = std::fs::metadata(root).map_err(|err| invalid(err.to_string()))?;
        if !metadata.is_dir() {
            return Err(invalid("not a directory".to_string()));
        }
        let root = root.canonicalize().map_err(|err| invalid(err.to_string()))?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    pub(crate) fn into_handler(self) -> Handler {
        handler_fn(move |ctx: Context| {
            let dir = self.clone();
            async move { dir.serve(&ctx).await }
        })
    }

    async fn serve(&self, ctx: &Context) {
        let requested = ctx.param("filepath").unwrap_or("");
        let Some(mut path) = self.resolve(requested) else {
            warn!(path = %ctx.path(), "rejected static path");
            ctx.error(&KeelError::not_found(ctx.path()));
            return;
        };
        if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            path.push(INDEX_FILE);
        }
        match tokio::fs::read(&path).await {
            Ok(content) => {
                let body = if ctx.method() == http::Method::HEAD {
                    Bytes::new()
                } else {
                    Bytes::from(content)
                };
                ctx.bytes(StatusCode::OK, content_type(&path), body);
            }
            Err(_) => {
                ctx.error(&KeelError::not_found(ctx.path()));
            }
        }
    }

    /// Maps a request sub-path onto the root, refusing anything that could
    /// climb out of it.
    fn resolve(&self, requested: &str) -> Option<PathBuf> {
        let mut path = self.root.as_ref().clone();
        for component in Path::new(requested).components() {
            match component {
                Component::Normal(part) => {
                    if part.to_str().is_some_and(|p| p.contains('\\')) {
                        return None;
                    }
                    path.push(part);
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(path)
    }
}

/// Content type by file extension.
pub(crate) fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpRouter;
    use http::Request;
    use keel_core::Router;

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::create_dir(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("css/site.css"), "body{}").unwrap();
        dir
    }

    async fn fetch(router: &HttpRouter, path: &str) -> keel_core::ResponseWriter {
        let ctx = Context::new(Request::get(path).body(Bytes::new()).unwrap());
        let writer = ctx.response().clone();
        router.dispatch(ctx).await;
        writer
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(Path::new("a/b.CSS")), "text/css; charset=utf-8");
        assert_eq!(content_type(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn test_missing_root_rejected() {
        let err = StaticDir::open(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, RouteError::InvalidRoot { .. }));
    }

    #[test]
    fn test_parent_components_rejected() {
        let dir = site();
        let stat = StaticDir::open(dir.path()).unwrap();
        assert!(stat.resolve("../etc/passwd").is_none());
        assert!(stat.resolve("css/../../x").is_none());
        assert!(stat.resolve("css/site.css").is_some());
    }

    #[tokio::test]
    async fn test_serves_files_and_index() {
        let dir = site();
        let mut router = HttpRouter::new();
        router.static_files("/assets", dir.path()).unwrap();

        let css = fetch(&router, "/assets/css/site.css").await;
        assert_eq!(css.status(), StatusCode::OK);
        assert_eq!(css.body(), Bytes::from("body{}"));
        assert_eq!(css.header("content-type").unwrap(), "text/css; charset=utf-8");

        let index = fetch(&router, "/assets").await;
        assert_eq!(index.body(), Bytes::from("<h1>home</h1>"));

        let missing = fetch(&router, "/assets/nope.js").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
