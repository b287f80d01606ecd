// Config file watcher - hot reload with trailing debounce
//
// Watches the config file's parent directory (non-recursive) so editors
// that replace-by-rename and Kubernetes ConfigMap updates (which appear as
// a `..data` sibling swap) are both caught. Raw notifications are bridged
// into a tokio channel and collapsed with a 1 s trailing debounce before a
// reload is attempted. A config that fails validation aborts the reload and
// the current snapshot stays in force.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config;
use crate::manager::Manager;

/// Trailing debounce applied to bursts of file events
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Keeps the underlying watcher alive; dropping this stops watching
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

/// Start watching `path` and reload `manager` on changes
pub fn watch(path: &Path, manager: Arc<Manager>) -> Result<ConfigWatcher> {
    let config_path = path.to_path_buf();
    let watch_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let (tx, rx) = mpsc::unbounded_channel();
    let filter_path = config_path.clone();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        let Ok(event) = result else { return };
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }
        let relevant = event.paths.iter().any(|p| {
            p == &filter_path || p.file_name().is_some_and(|name| name == "..data")
        });
        if relevant {
            let _ = tx.send(());
        }
    })
    .context("Failed to create file watcher")?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", watch_dir.display()))?;
    tracing::info!("watching {} for changes", config_path.display());

    tokio::spawn(debounce_loop(rx, config_path, manager));
    Ok(ConfigWatcher { _watcher: watcher })
}

async fn debounce_loop(
    mut rx: mpsc::UnboundedReceiver<()>,
    path: PathBuf,
    manager: Arc<Manager>,
) {
    while rx.recv().await.is_some() {
        // Collapse the burst: wait until the file has been quiet for the
        // debounce window
        loop {
            match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        reload_from_disk(&path, &manager).await;
    }
}

async fn reload_from_disk(path: &Path, manager: &Arc<Manager>) {
    tracing::info!("config file changed, reloading");
    // The start phase fires for every detected change, even ones that turn
    // out not to parse; the end phase follows once the attempt settles.
    manager.announce_reload();
    match config::load(path) {
        Ok(parsed) => manager.apply_reload(parsed).await,
        Err(first_error) => {
            tracing::error!("config reload failed: {}", first_error);
            let healed = config::try_self_heal(path)
                && match config::load(path) {
                    Ok(parsed) => {
                        manager.apply_reload(parsed).await;
                        true
                    }
                    Err(second_error) => {
                        tracing::error!("config still invalid after self-heal: {}", second_error);
                        false
                    }
                };
            if !healed {
                tracing::warn!("keeping the current snapshot");
            }
        }
    }
    manager.finish_reload();
}
