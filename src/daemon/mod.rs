mod dbus;
mod watcher;

use crate::core::coordinator::RefreshCoordinator;
use crate::core::history::HistoryStore;
use crate::core::notifications::{DesktopNotifier, Notifier};
use crate::core::settings::{ScheduleSettings, Settings};
use crate::core::settings_store::SettingsStore;
use crate::sources;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

pub use watcher::ConfigWatcher;

pub const DBUS_NAME: &str = "io.github.freshet.Scheduler";
pub const DBUS_PATH: &str = "/io/github/freshet/Scheduler";

pub async fn run(settings: Settings, config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!(source = %settings.source.name, "Starting freshet daemon");

    let data_dir = Settings::data_dir().context("Could not determine data directory")?;
    let history = HistoryStore::open(&data_dir.join("history.jsonl"))
        .context("Failed to open refresh history")?;
    let schedule = SettingsStore::open(&data_dir.join("settings.json"), settings.schedule.clone())
        .context("Failed to open schedule settings")?;

    let source = sources::build_source(&settings.source)?;
    let notifier: Arc<dyn Notifier> = Arc::new(DesktopNotifier);
    let coordinator = RefreshCoordinator::new(history, schedule, source, notifier, &settings.policy);
    coordinator.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = coordinator.clone();
    let loop_handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

    let _connection = dbus::start_dbus_server(coordinator.clone()).await?;

    let _watcher = match config_path.as_deref() {
        Some(path) => match ConfigWatcher::start(path) {
            Ok((watcher, mut rx)) => {
                let coordinator = coordinator.clone();
                let mut file_schedule = settings.schedule.clone();
                tokio::spawn(async move {
                    while let Some(path) = rx.recv().await {
                        apply_config_change(&coordinator, &path, &mut file_schedule).await;
                    }
                });
                Some(watcher)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to watch config file, edits need a restart");
                None
            }
        },
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    if let Err(e) = loop_handle.await {
        tracing::warn!(error = %e, "Scheduler loop ended abnormally");
    }
    if let Some(run_id) = coordinator.shutdown().await? {
        tracing::info!(run_id, "Marked in-flight refresh as interrupted");
    }

    tracing::info!("Daemon stopped");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigChange {
    Unchanged,
    Applied,
    Invalid,
    Rejected,
}

/// Re-reads the config file and applies its `[schedule]` table when that
/// table differs from `file_schedule`, the version last read from disk.
///
/// Edits elsewhere in the file leave the live settings alone, so patches made
/// over D-Bus survive unrelated config edits.
async fn apply_config_change(
    coordinator: &RefreshCoordinator,
    path: &Path,
    file_schedule: &mut ScheduleSettings,
) -> ConfigChange {
    let settings = match Settings::load_from(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring invalid config edit");
            return ConfigChange::Invalid;
        }
    };

    if settings.schedule == *file_schedule {
        tracing::debug!("Config edit leaves [schedule] unchanged");
        return ConfigChange::Unchanged;
    }

    match coordinator.replace_settings(settings.schedule.clone()).await {
        Ok(_) => {
            *file_schedule = settings.schedule;
            tracing::info!("Applied schedule settings from config file");
            ConfigChange::Applied
        }
        Err(e) => {
            tracing::warn!(error = %e, "Rejected schedule settings from config file");
            ConfigChange::Rejected
        }
    }
}
