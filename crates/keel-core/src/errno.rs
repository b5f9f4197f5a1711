//! Numeric error codes.
//!
//! Every error surfaced to clients carries a stable integer code built from
//! three parts:
//!
//! ```text
//! code = service * 100_000 + category * 1_000 + sequence
//! ```
//!
//! | Part | Range | Meaning |
//! |------|-------|---------|
//! | service | 0-99 | Owning service; [`SERVICE_COMMON`] is reserved for the chassis |
//! | category | 0-99 | A [`Category`] such as `Request` or `Timeout` |
//! | sequence | 0-999 | Position inside the category |
//!
//! The chassis ships a built-in table (see [`builtin`]) that is seeded into a
//! process-wide registry on first use. Applications add their own codes with
//! [`register_service`] and [`Errno::register`]; both reject conflicts.

use http::StatusCode;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Service code reserved for errors defined by the chassis itself.
pub const SERVICE_COMMON: u32 = 10;

const MAX_SERVICE: u32 = 99;
const MAX_CATEGORY: u32 = 99;
const MAX_SEQUENCE: u32 = 999;

/// Error category, the middle component of an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Success (code 0 only).
    Success,
    /// Malformed or invalid requests.
    Request,
    /// Authentication failures.
    Auth,
    /// Authorization failures.
    Permission,
    /// Missing resources.
    Resource,
    /// State conflicts.
    Conflict,
    /// Rate limiting and quotas.
    RateLimit,
    /// Internal failures.
    Internal,
    /// Database failures.
    Database,
    /// Cache failures.
    Cache,
    /// Network and upstream failures.
    Network,
    /// Deadlines and cancellation.
    Timeout,
    /// Configuration problems.
    Config,
}

impl Category {
    /// Numeric value used when building codes.
    pub const fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::Request => 1,
            Self::Auth => 2,
            Self::Permission => 3,
            Self::Resource => 4,
            Self::Conflict => 5,
            Self::RateLimit => 6,
            Self::Internal => 7,
            Self::Database => 8,
            Self::Cache => 9,
            Self::Network => 10,
            Self::Timeout => 11,
            Self::Config => 12,
        }
    }

    /// Reverse of [`Category::code`].
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            1 => Self::Request,
            2 => Self::Auth,
            3 => Self::Permission,
            4 => Self::Resource,
            5 => Self::Conflict,
            6 => Self::RateLimit,
            7 => Self::Internal,
            8 => Self::Database,
            9 => Self::Cache,
            10 => Self::Network,
            11 => Self::Timeout,
            12 => Self::Config,
            _ => return None,
        })
    }

    /// Status used for codes that are not in the registry.
    pub const fn fallback_status(self) -> StatusCode {
        match self {
            Self::Success => StatusCode::OK,
            Self::Request => StatusCode::BAD_REQUEST,
            Self::Auth => StatusCode::UNAUTHORIZED,
            Self::Permission => StatusCode::FORBIDDEN,
            Self::Resource => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::Network => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal | Self::Database | Self::Cache | Self::Config => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Builds a numeric code from its parts without range checks.
pub const fn make_code(service: u32, category: Category, sequence: u32) -> u32 {
    service * 100_000 + category.code() * 1_000 + sequence
}

/// Errors from building or registering codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrnoError {
    /// A code component is out of range.
    #[error("{part} must be 0-{max}, got {value}")]
    OutOfRange {
        /// Which component.
        part: &'static str,
        /// Supplied value.
        value: u32,
        /// Inclusive maximum.
        max: u32,
    },

    /// HTTP status outside 100-599.
    #[error("invalid HTTP status {0}")]
    InvalidStatus(u16),

    /// The code is already registered.
    #[error("error code {code} already registered as '{existing}'")]
    Duplicate {
        /// Conflicting code.
        code: u32,
        /// English message of the existing entry.
        existing: &'static str,
    },

    /// The service code belongs to another service.
    #[error("service code {code} already registered by '{existing}', cannot register for '{requested}'")]
    ServiceConflict {
        /// Service code.
        code: u32,
        /// Current owner.
        existing: String,
        /// Name that tried to claim it.
        requested: String,
    },
}

/// A registered error code with its HTTP status and localized messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno {
    code: u32,
    http: u16,
    message_en: &'static str,
    message_zh: &'static str,
}

impl Errno {
    const fn builtin(
        category: Category,
        sequence: u32,
        http: u16,
        message_en: &'static str,
        message_zh: &'static str,
    ) -> Self {
        Self {
            code: make_code(SERVICE_COMMON, category, sequence),
            http,
            message_en,
            message_zh,
        }
    }

    /// Builds a code after checking every component range.
    pub fn new(
        service: u32,
        category: Category,
        sequence: u32,
        http: StatusCode,
        message_en: &'static str,
        message_zh: &'static str,
    ) -> Result<Self, ErrnoError> {
        check_range("service", service, MAX_SERVICE)?;
        check_range("category", category.code(), MAX_CATEGORY)?;
        check_range("sequence", sequence, MAX_SEQUENCE)?;
        Ok(Self {
            code: make_code(service, category, sequence),
            http: http.as_u16(),
            message_en,
            message_zh,
        })
    }

    /// Adds this code to the process-wide registry.
    pub fn register(self) -> Result<Self, ErrnoError> {
        let mut codes = registry().codes.write();
        if let Some(existing) = codes.get(&self.code) {
            return Err(ErrnoError::Duplicate {
                code: self.code,
                existing: existing.message_en,
            });
        }
        codes.insert(self.code, self);
        Ok(self)
    }

    /// Numeric code.
    pub const fn code(&self) -> u32 {
        self.code
    }

    /// Service component.
    pub const fn service(&self) -> u32 {
        self.code / 100_000
    }

    /// Category component, if it is a known category.
    pub const fn category(&self) -> Option<Category> {
        Category::from_code((self.code / 1_000) % 100)
    }

    /// Sequence component.
    pub const fn sequence(&self) -> u32 {
        self.code % 1_000
    }

    /// HTTP status for this code.
    ///
    /// Non-standard statuses such as 499 are preserved.
    pub fn http_status(&self) -> StatusCode {
        StatusCode::from_u16(self.http).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Raw HTTP status number.
    pub const fn http_code(&self) -> u16 {
        self.http
    }

    /// English message.
    pub const fn message_en(&self) -> &'static str {
        self.message_en
    }

    /// Message for a language tag. Tags starting with `zh` select Chinese.
    pub fn message(&self, lang: &str) -> &'static str {
        if lang.to_ascii_lowercase().starts_with("zh") && !self.message_zh.is_empty() {
            self.message_zh
        } else {
            self.message_en
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message_en)
    }
}

fn check_range(part: &'static str, value: u32, max: u32) -> Result<(), ErrnoError> {
    if value > max {
        return Err(ErrnoError::OutOfRange { part, value, max });
    }
    Ok(())
}

macro_rules! builtin_codes {
    ($( $(#[$meta:meta])* $name:ident = ($cat:ident, $seq:expr, $http:expr, $en:expr, $zh:expr); )*) => {
        $(
            $(#[$meta])*
            pub const $name: Errno = Errno::builtin(Category::$cat, $seq, $http, $en, $zh);
        )*

        /// Every chassis-defined code, in declaration order.
        pub const ALL: &[Errno] = &[$($name),*];
    };
}

/// Built-in chassis codes (service [`SERVICE_COMMON`]).
pub mod builtin {
    use super::{Category, Errno};

    /// Success (code 0).
    pub const OK: Errno = Errno {
        code: 0,
        http: 200,
        message_en: "Success",
        message_zh: "成功",
    };

    builtin_codes! {
        /// Generic bad request.
        BAD_REQUEST = (Request, 0, 400, "Bad request", "请求错误");
        /// Invalid parameter.
        INVALID_PARAM = (Request, 1, 400, "Invalid parameter", "参数无效");
        /// Missing parameter.
        MISSING_PARAM = (Request, 2, 400, "Missing required parameter", "缺少必需参数");
        /// Malformed payload.
        INVALID_FORMAT = (Request, 3, 400, "Invalid format", "格式无效");
        /// Field validation failed.
        VALIDATION_FAILED = (Request, 4, 400, "Validation failed", "验证失败");
        /// Body exceeds limit.
        REQUEST_TOO_LARGE = (Request, 5, 413, "Request entity too large", "请求体过大");
        /// Unsupported content type.
        UNSUPPORTED_MEDIA_TYPE = (Request, 6, 415, "Unsupported media type", "不支持的媒体类型");

        /// Missing or failed authentication.
        UNAUTHORIZED = (Auth, 0, 401, "Unauthorized", "未认证");
        /// Token could not be verified.
        INVALID_TOKEN = (Auth, 1, 401, "Invalid token", "令牌无效");
        /// Token past expiry.
        TOKEN_EXPIRED = (Auth, 2, 401, "Token expired", "令牌已过期");
        /// Bad credentials.
        INVALID_CREDENTIALS = (Auth, 3, 401, "Invalid credentials", "凭证无效");
        /// Token revoked.
        TOKEN_REVOKED = (Auth, 4, 401, "Token revoked", "令牌已撤销");
        /// Session expired.
        SESSION_EXPIRED = (Auth, 5, 401, "Session expired", "会话已过期");

        /// Forbidden.
        FORBIDDEN = (Permission, 0, 403, "Forbidden", "禁止访问");
        /// Caller lacks permission.
        NO_PERMISSION = (Permission, 1, 403, "No permission", "无权限");
        /// Resource locked.
        RESOURCE_LOCKED = (Permission, 2, 423, "Resource locked", "资源已锁定");
        /// Account disabled.
        ACCOUNT_DISABLED = (Permission, 3, 403, "Account disabled", "账号已禁用");
        /// Client IP blocked.
        IP_BLOCKED = (Permission, 4, 403, "IP blocked", "IP 已被封禁");

        /// Resource not found.
        NOT_FOUND = (Resource, 0, 404, "Resource not found", "资源不存在");
        /// User not found.
        USER_NOT_FOUND = (Resource, 1, 404, "User not found", "用户不存在");
        /// Record not found.
        RECORD_NOT_FOUND = (Resource, 2, 404, "Record not found", "记录不存在");
        /// File not found.
        FILE_NOT_FOUND = (Resource, 3, 404, "File not found", "文件不存在");
        /// No route matched.
        ROUTE_NOT_FOUND = (Resource, 4, 404, "Route not found", "路由不存在");

        /// Resource conflict.
        CONFLICT = (Conflict, 0, 409, "Resource conflict", "资源冲突");
        /// Resource already exists.
        ALREADY_EXISTS = (Conflict, 1, 409, "Resource already exists", "资源已存在");
        /// Duplicate key.
        DUPLICATE_KEY = (Conflict, 2, 409, "Duplicate key", "键值重复");
        /// Optimistic concurrency failure.
        VERSION_CONFLICT = (Conflict, 3, 409, "Version conflict", "版本冲突");

        /// Too many requests.
        TOO_MANY_REQUESTS = (RateLimit, 0, 429, "Too many requests", "请求过于频繁");
        /// Rate limit exceeded.
        RATE_LIMIT_EXCEEDED = (RateLimit, 1, 429, "Rate limit exceeded", "超出速率限制");
        /// Quota exhausted.
        QUOTA_EXCEEDED = (RateLimit, 2, 429, "Quota exceeded", "配额已用尽");

        /// Internal failure.
        INTERNAL = (Internal, 0, 500, "Internal server error", "服务器内部错误");
        /// Unknown failure.
        UNKNOWN = (Internal, 1, 500, "Unknown error", "未知错误");
        /// Recovered panic.
        PANIC = (Internal, 2, 500, "Service panic", "服务崩溃");
        /// Not implemented.
        NOT_IMPLEMENTED = (Internal, 3, 501, "Not implemented", "功能未实现");

        /// Database failure.
        DATABASE = (Database, 0, 500, "Database error", "数据库错误");
        /// Database connection failure.
        DB_CONNECTION = (Database, 1, 500, "Database connection failed", "数据库连接失败");
        /// Database query failure.
        DB_QUERY = (Database, 2, 500, "Database query failed", "数据库查询失败");
        /// Database transaction failure.
        DB_TRANSACTION = (Database, 3, 500, "Database transaction failed", "数据库事务失败");
        /// Database deadlock.
        DB_DEADLOCK = (Database, 4, 500, "Database deadlock", "数据库死锁");

        /// Cache failure.
        CACHE = (Cache, 0, 500, "Cache error", "缓存错误");
        /// Cache connection failure.
        CACHE_CONNECTION = (Cache, 1, 500, "Cache connection failed", "缓存连接失败");
        /// Cache miss.
        CACHE_MISS = (Cache, 2, 500, "Cache miss", "缓存未命中");
        /// Cache entry expired.
        CACHE_EXPIRED = (Cache, 3, 500, "Cache expired", "缓存已过期");

        /// Network failure.
        NETWORK = (Network, 0, 502, "Network error", "网络错误");
        /// Dependency unavailable.
        SERVICE_UNAVAILABLE = (Network, 1, 503, "Service unavailable", "服务不可用");
        /// Connection refused.
        CONNECTION_REFUSED = (Network, 2, 502, "Connection refused", "连接被拒绝");
        /// DNS failure.
        DNS_RESOLUTION = (Network, 3, 502, "DNS resolution failed", "DNS 解析失败");

        /// Operation deadline exceeded.
        TIMEOUT = (Timeout, 0, 504, "Operation timeout", "操作超时");
        /// Client-side request timeout.
        REQUEST_TIMEOUT = (Timeout, 1, 408, "Request timeout", "请求超时");
        /// Upstream gateway timeout.
        GATEWAY_TIMEOUT = (Timeout, 2, 504, "Gateway timeout", "网关超时");
        /// Client closed the request.
        CONTEXT_CANCELED = (Timeout, 3, 499, "Context canceled", "上下文已取消");

        /// Configuration failure.
        CONFIG = (Config, 0, 500, "Configuration error", "配置错误");
        /// Missing configuration.
        CONFIG_NOT_FOUND = (Config, 1, 500, "Configuration not found", "配置不存在");
        /// Invalid configuration.
        CONFIG_INVALID = (Config, 2, 500, "Invalid configuration", "配置无效");
    }
}

struct Registry {
    codes: RwLock<HashMap<u32, Errno>>,
    services: RwLock<HashMap<u32, String>>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut codes = HashMap::with_capacity(builtin::ALL.len() + 1);
        codes.insert(builtin::OK.code, builtin::OK);
        for errno in builtin::ALL {
            codes.insert(errno.code, *errno);
        }
        let mut services = HashMap::new();
        services.insert(SERVICE_COMMON, "common".to_string());
        Registry {
            codes: RwLock::new(codes),
            services: RwLock::new(services),
        }
    })
}

/// Claims a service code for `name`.
///
/// Re-registering the same name is a no-op; a different name is rejected.
pub fn register_service(code: u32, name: &str) -> Result<(), ErrnoError> {
    check_range("service", code, MAX_SERVICE)?;
    let mut services = registry().services.write();
    match services.get(&code) {
        Some(existing) if existing == name => Ok(()),
        Some(existing) => Err(ErrnoError::ServiceConflict {
            code,
            existing: existing.clone(),
            requested: name.to_string(),
        }),
        None => {
            services.insert(code, name.to_string());
            Ok(())
        }
    }
}

/// Name registered for a service code.
pub fn service_name(code: u32) -> Option<String> {
    registry().services.read().get(&code).cloned()
}

/// Looks up a registered code.
pub fn lookup(code: u32) -> Option<Errno> {
    registry().codes.read().get(&code).copied()
}

/// HTTP status for any code: the registered status, else the category fallback, else 500.
pub fn status_for_code(code: u32) -> StatusCode {
    if let Some(errno) = lookup(code) {
        return errno.http_status();
    }
    Category::from_code((code / 1_000) % 100)
        .map_or(StatusCode::INTERNAL_SERVER_ERROR, Category::fallback_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_code_layout() {
        assert_eq!(builtin::BAD_REQUEST.code(), 1_001_000);
        assert_eq!(builtin::ROUTE_NOT_FOUND.code(), 1_004_004);
        assert_eq!(builtin::CONTEXT_CANCELED.code(), 1_011_003);
        assert_eq!(builtin::CONTEXT_CANCELED.service(), SERVICE_COMMON);
        assert_eq!(builtin::CONTEXT_CANCELED.category(), Some(Category::Timeout));
        assert_eq!(builtin::CONTEXT_CANCELED.sequence(), 3);
    }

    #[test]
    fn test_builtin_codes_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for errno in builtin::ALL {
            assert!(seen.insert(errno.code()), "duplicate code {}", errno.code());
        }
    }

    #[test]
    fn test_lookup_seeds_builtins() {
        assert_eq!(lookup(0), Some(builtin::OK));
        assert_eq!(lookup(builtin::PANIC.code()), Some(builtin::PANIC));
        assert_eq!(
            status_for_code(builtin::RESOURCE_LOCKED.code()),
            StatusCode::LOCKED
        );
    }

    #[test]
    fn test_non_standard_status_preserved() {
        assert_eq!(builtin::CONTEXT_CANCELED.http_status().as_u16(), 499);
    }

    #[test]
    fn test_category_fallback_for_unknown_code() {
        let code = make_code(42, Category::RateLimit, 777);
        assert_eq!(status_for_code(code), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for_code(4_299_999), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_localized_message() {
        assert_eq!(builtin::NOT_FOUND.message("zh-CN"), "资源不存在");
        assert_eq!(builtin::NOT_FOUND.message("en"), "Resource not found");
        assert_eq!(builtin::NOT_FOUND.message(""), "Resource not found");
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let errno = Errno::new(
            31,
            Category::Resource,
            12,
            StatusCode::NOT_FOUND,
            "Order not found",
            "订单不存在",
        )
        .unwrap();
        assert!(errno.register().is_ok());
        assert!(matches!(
            errno.register(),
            Err(ErrnoError::Duplicate { code, .. }) if code == errno.code()
        ));
        assert!(matches!(
            builtin::INTERNAL.register(),
            Err(ErrnoError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_new_rejects_out_of_range() {
        let err = Errno::new(100, Category::Request, 0, StatusCode::BAD_REQUEST, "x", "")
            .unwrap_err();
        assert_eq!(
            err,
            ErrnoError::OutOfRange {
                part: "service",
                value: 100,
                max: 99
            }
        );
        assert!(Errno::new(1, Category::Request, 1000, StatusCode::BAD_REQUEST, "x", "").is_err());
    }

    #[test]
    fn test_register_service_conflict() {
        register_service(57, "orders").unwrap();
        register_service(57, "orders").unwrap();
        assert!(matches!(
            register_service(57, "billing"),
            Err(ErrnoError::ServiceConflict { code: 57, .. })
        ));
        assert_eq!(service_name(57).as_deref(), Some("orders"));
        assert!(register_service(SERVICE_COMMON, "other").is_err());
    }
}
