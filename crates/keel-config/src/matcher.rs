//! Skip lists shared by path-aware middlewares.

use serde::{Deserialize, Serialize};

/// Exact paths plus path prefixes that bypass a middleware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PathMatcher {
    /// Paths matched exactly.
    pub skip_paths: Vec<String>,
    /// Paths matched by prefix.
    pub skip_path_prefixes: Vec<String>,
}

impl PathMatcher {
    /// Creates a matcher from exact paths only.
    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            skip_paths: paths.into_iter().map(Into::into).collect(),
            skip_path_prefixes: Vec::new(),
        }
    }

    /// Adds prefixes.
    pub fn with_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_path_prefixes
            .extend(prefixes.into_iter().map(Into::into));
        self
    }

    /// True when `path` should bypass the middleware.
    pub fn should_skip(&self, path: &str) -> bool {
        should_skip(path, &self.skip_paths, &self.skip_path_prefixes)
    }

    /// True when nothing is skipped.
    pub fn is_empty(&self) -> bool {
        self.skip_paths.is_empty() && self.skip_path_prefixes.is_empty()
    }
}

/// Exact match against `paths` or prefix match against `prefixes`.
pub fn should_skip(path: &str, paths: &[String], prefixes: &[String]) -> bool {
    paths.iter().any(|p| p == path)
        || prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && path.starts_with(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exact_and_prefix() {
        let m = PathMatcher::paths(["/health"]).with_prefixes(["/internal/"]);
        assert!(m.should_skip("/health"));
        assert!(!m.should_skip("/health/deep"));
        assert!(m.should_skip("/internal/debug"));
        assert!(!m.should_skip("/api/users"));
    }

    #[test]
    fn test_empty_prefix_never_matches() {
        let m = PathMatcher::default().with_prefixes([""]);
        assert!(!m.should_skip("/anything"));
        assert!(PathMatcher::default().is_empty());
    }

    proptest! {
        #[test]
        fn prop_should_skip_is_pure(
            path in "/[a-z/]{0,12}",
            paths in proptest::collection::vec("/[a-z]{0,6}", 0..4),
            prefixes in proptest::collection::vec("/[a-z]{0,4}", 0..4),
        ) {
            let first = should_skip(&path, &paths, &prefixes);
            let second = should_skip(&path, &paths, &prefixes);
            prop_assert_eq!(first, second);
            let expected = paths.contains(&path)
                || prefixes.iter().any(|p| !p.is_empty() && path.starts_with(p.as_str()));
            prop_assert_eq!(first, expected);
        }
    }
}
