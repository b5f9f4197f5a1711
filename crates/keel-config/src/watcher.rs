//! File watching for configuration hot-reload.
//!
//! [`ConfigWatcher`] follows one options file and feeds every change through
//! [`ReloadableMiddleware::reload`]. The parent directory is watched rather
//! than the file itself so that editors which replace the file on save are
//! still observed.
//!
//! # Example
//!
//! ```no_run
//! use keel_config::{ConfigWatcher, Options, ReloadableMiddleware};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), keel_config::ConfigError> {
//! let live = Arc::new(ReloadableMiddleware::new(Options::default()));
//! let watcher = ConfigWatcher::new("keel.toml", Arc::clone(&live))?
//!     .with_debounce(Duration::from_millis(250))
//!     .with_env_prefix("KEEL");
//!
//! tokio::spawn(watcher.run());
//! # Ok(())
//! # }
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{ConfigError, ConfigLoader, ReloadReport, ReloadableMiddleware};

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Reloads options whenever the watched file changes.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<Event>,
    path: PathBuf,
    file_name: OsString,
    target: Arc<ReloadableMiddleware>,
    env_prefix: Option<String>,
    debounce: Duration,
    last_event: Option<Instant>,
}

impl ConfigWatcher {
    /// Starts watching `path`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file does not exist or the platform
    /// watcher cannot be attached.
    pub fn new<P: AsRef<Path>>(
        path: P,
        target: Arc<ReloadableMiddleware>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(ConfigError::file_not_found(&path));
        }
        let file_name = path
            .file_name()
            .map(ToOwned::to_owned)
            .ok_or_else(|| ConfigError::watch(format!("{} is not a file", path.display())))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                // Receiver gone means the watcher is shutting down.
                let _ = tx.blocking_send(event);
            }
        })
        .map_err(|e| ConfigError::watch(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::watch(format!("failed to watch {}: {e}", dir.display())))?;

        Ok(Self {
            _watcher: watcher,
            rx,
            path,
            file_name,
            target,
            env_prefix: None,
            debounce: DEFAULT_DEBOUNCE,
            last_event: None,
        })
    }

    /// Sets the debounce window. Changes closer together than this collapse
    /// into one reload.
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Applies `PREFIX__SECTION__FIELD` overrides on every reload.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self
    }

    /// Watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file and reloads it into the target.
    pub fn reload_now(&self) -> Result<ReloadReport, ConfigError> {
        let mut loader = ConfigLoader::new().with_file(&self.path)?;
        if let Some(prefix) = &self.env_prefix {
            loader = loader.with_env_prefix(prefix);
        }
        let options = loader.load_unvalidated()?;
        Ok(self.target.reload(options)?)
    }

    /// Waits for the next relevant change and reloads.
    ///
    /// Returns `None` once the platform watcher has stopped.
    pub async fn next_reload(&mut self) -> Option<Result<ReloadReport, ConfigError>> {
        loop {
            let event = self.rx.recv().await?;
            if self.process_event(&event, Instant::now()) {
                return Some(self.reload_now());
            }
        }
    }

    /// Reloads on every change until the watcher stops. Failures are logged
    /// and the previous options stay active.
    pub async fn run(mut self) {
        info!(path = %self.path.display(), "watching configuration file");
        while let Some(result) = self.next_reload().await {
            match result {
                Ok(report) if report.restart_required => {
                    warn!(path = %self.path.display(), "configuration reloaded; enabled list needs a restart");
                }
                Ok(_) => {}
                Err(e) => warn!(path = %self.path.display(), error = %e, "configuration reload failed"),
            }
        }
    }

    /// True when `event` touches the watched file and passes the debounce.
    fn process_event(&mut self, event: &Event, now: Instant) -> bool {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {}
            _ => return false,
        }

        let touches = event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(self.file_name.as_os_str()));
        if !touches {
            return false;
        }

        if let Some(last) = self.last_event {
            if now.duration_since(last) < self.debounce {
                return false;
            }
        }
        self.last_event = Some(now);
        true
    }
}
