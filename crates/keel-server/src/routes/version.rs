//! Build information endpoint.

use http::StatusCode;
use keel_config::{MiddlewareName, VersionOptions};
use keel_core::{handler_fn, Context, Router};
use keel_middleware::factory::downcast;
use keel_middleware::{AnyConfig, FactoryError, RouteRegistrar};
use serde::Serialize;

/// Build information.
///
/// The defaults come from `KEEL_GIT_VERSION`, `KEEL_GIT_COMMIT`,
/// `KEEL_BUILD_DATE` and `KEEL_RUSTC_VERSION` when they are set at compile
/// time, and fall back to the crate version and `unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    /// Release tag or version.
    pub git_version: String,
    /// Commit hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    /// Build timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_date: Option<String>,
    /// Compiler version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rust_version: Option<String>,
    /// `os/arch`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        let unknown = || "unknown".to_string();
        Self {
            git_version: option_env!("KEEL_GIT_VERSION")
                .unwrap_or(env!("CARGO_PKG_VERSION"))
                .to_string(),
            git_commit: Some(option_env!("KEEL_GIT_COMMIT").map_or_else(unknown, str::to_string)),
            build_date: Some(option_env!("KEEL_BUILD_DATE").map_or_else(unknown, str::to_string)),
            rust_version: Some(option_env!("KEEL_RUSTC_VERSION").map_or_else(unknown, str::to_string)),
            platform: Some(format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)),
        }
    }
}

impl VersionInfo {
    /// Info reporting only `version`.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            git_version: version.into(),
            ..Self::default()
        }
    }

    /// Copy with everything but the version removed.
    pub fn redacted(&self) -> Self {
        Self {
            git_version: self.git_version.clone(),
            git_commit: None,
            build_date: None,
            rust_version: None,
            platform: None,
        }
    }
}

/// Registers the version endpoint.
#[derive(Debug, Clone, Default)]
pub struct VersionRegistrar {
    info: VersionInfo,
}

impl VersionRegistrar {
    /// Serves `info`.
    pub fn new(info: VersionInfo) -> Self {
        Self { info }
    }
}

impl RouteRegistrar for VersionRegistrar {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::Version
    }

    fn register_routes(&self, router: &mut dyn Router, config: &dyn AnyConfig) -> Result<(), FactoryError> {
        let options: &VersionOptions = downcast(self.name(), config)?;
        let options = options.clone().complete();
        let info = if options.hide_details {
            self.info.redacted()
        } else {
            self.info.clone()
        };
        router.get(
            &options.path,
            handler_fn(move |ctx: Context| {
                let info = info.clone();
                async move {
                    ctx.json(StatusCode::OK, &info);
                }
            }),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::tests::fetch;
    use crate::HttpRouter;

    #[test]
    fn test_default_has_platform() {
        let info = VersionInfo::default();
        assert!(!info.git_version.is_empty());
        assert!(info.platform.unwrap().contains('/'));
    }

    #[tokio::test]
    async fn test_full_details() {
        let mut router = HttpRouter::new();
        VersionRegistrar::new(VersionInfo::new("v1.4.0"))
            .register_routes(&mut router, &VersionOptions::default())
            .unwrap();
        let writer = fetch(&router, "/version").await;
        let body: serde_json::Value = serde_json::from_slice(&writer.body()).unwrap();
        assert_eq!(body["git_version"], "v1.4.0");
        assert!(body.get("platform").is_some());
    }

    #[tokio::test]
    async fn test_hide_details() {
        let mut router = HttpRouter::new();
        let options = VersionOptions {
            hide_details: true,
            ..VersionOptions::default()
        };
        VersionRegistrar::new(VersionInfo::new("v1.4.0"))
            .register_routes(&mut router, &options)
            .unwrap();
        let writer = fetch(&router, "/version").await;
        let body: serde_json::Value = serde_json::from_slice(&writer.body()).unwrap();
        assert_eq!(body, serde_json::json!({ "git_version": "v1.4.0" }));
    }
}
