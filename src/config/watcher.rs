//! Reloads the configuration file when it changes on disk.
//!
//! A single save usually fires several notify events; reloads whose file
//! content is unchanged since the last published config are dropped.

use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHasher;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::loader::{parse_config, ConfigError};
use crate::config::schema::PolarisConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

fn fingerprint(content: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(content.as_bytes());
    hasher.finish()
}

/// Parses the file and remembers what was last published.
#[derive(Debug)]
struct Reloader {
    path: PathBuf,
    last: Mutex<Option<u64>>,
    updates: mpsc::UnboundedSender<PolarisConfig>,
}

impl Reloader {
    /// `Ok(None)` when the content did not change.
    fn reload(&self) -> Result<Option<PolarisConfig>, ConfigError> {
        let content = std::fs::read_to_string(&self.path).map_err(ConfigError::Io)?;
        let print = fingerprint(&content);
        let mut last = self.last.lock();
        if *last == Some(print) {
            return Ok(None);
        }
        let config = parse_config(&content)?;
        *last = Some(print);
        Ok(Some(config))
    }

    fn on_event(&self, event: notify::Result<Event>) {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = ?e, "Config watch error");
                return;
            }
        };
        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            return;
        }
        match self.reload() {
            Ok(Some(config)) => {
                tracing::info!(path = %self.path.display(), services = config.services.len(), "Config file changed, reloading");
                if self.updates.send(config).is_err() {
                    tracing::debug!("Config update receiver gone");
                }
            }
            Ok(None) => tracing::trace!(path = %self.path.display(), "Config file content unchanged"),
            Err(e) => tracing::error!(error = %e, "Failed to reload config, keeping current services"),
        }
    }
}

/// Watches one configuration file and sends every new valid config.
pub struct ConfigWatcher {
    reloader: Arc<Reloader>,
}

impl ConfigWatcher {
    /// The receiver yields reloaded configs until the watcher is dropped.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<PolarisConfig>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let content = std::fs::read_to_string(path).ok();
        let reloader = Reloader {
            path: path.to_path_buf(),
            last: Mutex::new(content.as_deref().map(fingerprint)),
            updates,
        };
        (
            Self {
                reloader: Arc::new(reloader),
            },
            rx,
        )
    }

    /// Start watching. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let reloader = self.reloader.clone();
        let mut watcher = RecommendedWatcher::new(
            move |event| reloader.on_event(event),
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;
        watcher.watch(&self.reloader.path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %self.reloader.path.display(), "Config watcher started");
        Ok(watcher)
    }
}
