//! File-backed config watcher
//!
//! Loads a JSON document, writes a default one if the file is missing, and
//! reloads on filesystem notifications. Notifications are debounced: every
//! event resets the timer, and a single task performs reloads, so bursts of
//! writes coalesce into one reload and reloads never overlap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ConfigError;
use crate::model::{RegistryConfig, default_config};
use crate::watcher::{ConfigEvent, ConfigState, ConfigWatcher};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct FileWatcherOptions {
    /// Quiet period required after the last filesystem event before reloading
    pub debounce: Duration,
    /// Reload on a fixed interval as well (for filesystems without notifications)
    pub poll_interval: Option<Duration>,
}

impl Default for FileWatcherOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            poll_interval: None,
        }
    }
}

struct WatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    // Dropping the notify watcher unregisters the OS watch
    _fs_watcher: Option<RecommendedWatcher>,
}

pub struct FileConfigWatcher {
    path: PathBuf,
    options: FileWatcherOptions,
    state: Arc<ConfigState>,
    task: Mutex<Option<WatchTask>>,
}

impl FileConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_options(path, FileWatcherOptions::default())
    }

    pub fn with_options(path: impl Into<PathBuf>, options: FileWatcherOptions) -> Self {
        Self {
            path: path.into(),
            options,
            state: Arc::new(ConfigState::default()),
            task: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Reload the file immediately, outside the debounce loop
    pub async fn reload(&self) -> bool {
        reload(&self.path, &self.state).await
    }

    fn spawn_fs_watcher(&self, tx: mpsc::UnboundedSender<()>) -> Result<RecommendedWatcher, ConfigError> {
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let mut fs_watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let relevant = !(event.kind.is_access() || event.kind.is_other())
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant && tx.send(()).is_err() {
                        debug!("Config reload loop has exited, dropping file event");
                    }
                }
                Err(e) => error!("Config file watch error: {:?}", e),
            }
        })?;

        // Watch the directory so editors that write-and-rename are still seen
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs_watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(fs_watcher)
    }
}

#[async_trait]
impl ConfigWatcher for FileConfigWatcher {
    async fn start(&self) -> Result<(), ConfigError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("Config watcher for {} is already running", self.path.display());
            return Ok(());
        }

        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            write_config_file(&self.path, &default_config()).await?;
            info!("Wrote default provider configuration to {}", self.path.display());
        }

        let config = load_config_file(&self.path).await?;
        self.state.replace(config);

        let (tx, rx) = mpsc::unbounded_channel();
        let fs_watcher = match self.spawn_fs_watcher(tx) {
            Ok(w) => Some(w),
            Err(e) if self.options.poll_interval.is_some() => {
                warn!("File notifications unavailable ({}), relying on polling", e);
                None
            }
            Err(e) => return Err(e),
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reload_loop(
            self.path.clone(),
            Arc::clone(&self.state),
            self.options.clone(),
            rx,
            cancel.clone(),
        ));

        info!("Watching provider configuration: {}", self.path.display());
        *task = Some(WatchTask {
            cancel,
            handle,
            _fs_watcher: fs_watcher,
        });
        Ok(())
    }

    async fn stop(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!("Config reload task ended abnormally: {}", e);
        }
        info!("Stopped watching {}", self.path.display());
    }

    fn current(&self) -> Arc<RegistryConfig> {
        self.state.current()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.state.subscribe()
    }
}

async fn reload_loop(
    path: PathBuf,
    state: Arc<ConfigState>,
    options: FileWatcherOptions,
    mut rx: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
) {
    let mut poll = options
        .poll_interval
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(()) = rx.recv() => {
                // Debounce: wait until no event has arrived for the full delay
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(options.debounce) => break,
                        Some(()) = rx.recv() => continue,
                    }
                }
                reload(&path, &state).await;
            }
            _ = next_poll(&mut poll) => {
                reload(&path, &state).await;
            }
        }
    }
    debug!("Config reload loop for {} exited", path.display());
}

async fn next_poll(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn reload(path: &Path, state: &ConfigState) -> bool {
    match load_config_file(path).await {
        Ok(config) => {
            let changed = state.replace(config);
            if changed {
                info!("Provider configuration reloaded from {}", path.display());
            } else {
                debug!("Provider configuration unchanged after reload");
            }
            changed
        }
        Err(e) => {
            state.report_error(format!("failed to reload {}: {}", path.display(), e));
            false
        }
    }
}

/// Read and validate a configuration file
pub async fn load_config_file(path: &Path) -> Result<RegistryConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    RegistryConfig::from_json_str(&content)
}

/// Write a configuration file with stable formatting, creating parent directories
pub async fn write_config_file(path: &Path, config: &RegistryConfig) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::write(path, config.to_pretty_json()?)
        .await
        .map_err(io_err)
}
