use anyhow::{Context, Result};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Watches the config file and emits one event per burst of writes.
///
/// Editors tend to save through a rename, so the parent directory is
/// watched and events are filtered by file name.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn start(config_path: &Path) -> Result<(Self, mpsc::UnboundedReceiver<PathBuf>)> {
        let parent = config_path
            .parent()
            .context("Config path has no parent directory")?
            .to_path_buf();
        let file_name = config_path
            .file_name()
            .context("Config path has no file name")?
            .to_os_string();

        let (async_tx, async_rx) = mpsc::unbounded_channel::<PathBuf>();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else {
                    return;
                };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                if event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()))
                {
                    let _ = notify_tx.send(());
                }
            },
            Config::default(),
        )?;

        if parent.exists() {
            watcher
                .watch(&parent, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch directory: {}", parent.display()))?;
            tracing::info!(?parent, "Watching config directory");
        } else {
            tracing::warn!(?parent, "Config directory does not exist, skipping watch");
        }

        let path = config_path.to_path_buf();
        tokio::spawn(async move {
            while notify_rx.recv().await.is_some() {
                tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
                while notify_rx.try_recv().is_ok() {}

                tracing::info!(?path, "Config file changed on disk");
                if async_tx.send(path.clone()).is_err() {
                    break;
                }
            }
        });

        Ok((Self { _watcher: watcher }, async_rx))
    }
}
