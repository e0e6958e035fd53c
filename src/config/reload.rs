//! Hot reload for configuration file changes

use super::ConfigStore;
use crate::error::Result;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Quiet period after the last file event before a reload runs
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

/// Running configuration watcher
///
/// Dropping it does not stop the watch; call [`ConfigWatcher::stop`].
pub struct ConfigWatcher {
    handle: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Stop watching
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl ConfigStore {
    /// Start watching the root directory for changes to the base or overlay file
    ///
    /// Bursts of events are coalesced: a reload runs once no event has arrived for
    /// [`RELOAD_DEBOUNCE`]. Must be called from within a tokio runtime.
    pub fn start_watcher(self: Arc<Self>) -> Result<ConfigWatcher> {
        let (tx, mut rx) = mpsc::channel::<()>(16);
        let watched = self.watched_file_names();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if is_relevant(&event, &watched) {
                        // A full channel already guarantees a pending reload
                        let _ = tx.try_send(());
                    }
                }
            },
            NotifyConfig::default(),
        )?;

        watcher.watch(self.root_dir(), RecursiveMode::NonRecursive)?;
        info!("Watching configuration directory: {:?}", self.root_dir());

        let store = self;
        let handle = tokio::spawn(async move {
            // Keep the OS watcher alive for the lifetime of the task
            let _watcher = watcher;

            while rx.recv().await.is_some() {
                loop {
                    tokio::select! {
                        more = rx.recv() => {
                            if more.is_none() {
                                return;
                            }
                            debug!("Debouncing config change");
                        }
                        _ = tokio::time::sleep(RELOAD_DEBOUNCE) => break,
                    }
                }

                info!("Configuration file changed, reloading...");
                let reloading = store.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || reloading.reload_or_keep()).await {
                    warn!("Configuration reload task failed: {}", e);
                }
            }
        });

        Ok(ConfigWatcher { handle })
    }
}

/// Whether a file event touches one of the watched names
fn is_relevant(event: &Event, watched: &[String; 2]) -> bool {
    let writes = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    );

    writes
        && event
            .paths
            .iter()
            .any(|path| matches_watched_name(path, watched))
}

fn matches_watched_name(path: &Path, watched: &[String; 2]) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| watched.iter().any(|w| w.eq_ignore_ascii_case(name)))
        .unwrap_or(false)
}
