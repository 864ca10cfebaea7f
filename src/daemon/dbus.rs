use crate::core::coordinator::RefreshCoordinator;
use crate::core::error::SchedulerError;
use crate::core::models::{RefreshRecord, TimeWindow};
use crate::core::settings::SettingsPatch;
use crate::daemon::{DBUS_NAME, DBUS_PATH};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use zbus::{interface, Connection};

pub struct SchedulerService {
    coordinator: RefreshCoordinator,
}

impl SchedulerService {
    pub fn new(coordinator: RefreshCoordinator) -> Self {
        Self { coordinator }
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn history_window(now: DateTime<Utc>, hours: u32) -> TimeWindow {
    TimeWindow::trailing(now, Duration::hours(i64::from(hours)))
}

fn failed(error: SchedulerError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(error.to_string())
}

#[interface(name = "io.github.freshet.Scheduler")]
impl SchedulerService {
    async fn get_status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.coordinator.status().await)
    }

    /// Runs that started in the last `hours` hours, oldest first.
    async fn get_history(&self, hours: u32) -> zbus::fdo::Result<String> {
        let window = history_window(Utc::now(), hours);
        let records: Vec<RefreshRecord> = self.coordinator.history(window).await.collect();
        to_json(&records)
    }

    async fn trigger_refresh(&self) -> zbus::fdo::Result<u64> {
        tracing::info!("D-Bus TriggerRefresh called");
        self.coordinator.trigger_manual_refresh().await.map_err(failed)
    }

    async fn get_settings(&self) -> zbus::fdo::Result<String> {
        to_json(&*self.coordinator.settings().await)
    }

    /// Applies a JSON-encoded partial settings update and returns the
    /// resulting settings.
    async fn update_settings(&self, patch: &str) -> zbus::fdo::Result<String> {
        let patch: SettingsPatch = serde_json::from_str(patch)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("Malformed settings patch: {e}")))?;
        tracing::info!(?patch, "D-Bus UpdateSettings called");

        let settings = self.coordinator.update_settings(&patch).await.map_err(failed)?;
        to_json(&*settings)
    }

    async fn reenable(&self) -> zbus::fdo::Result<()> {
        tracing::info!("D-Bus Reenable called");
        self.coordinator.reenable().await.map_err(failed)
    }

    #[zbus(property)]
    async fn state(&self) -> String {
        self.coordinator.status().await.state.name().to_string()
    }
}

/// Claims the well-known name and serves the scheduler interface.
///
/// The returned connection must be kept alive for the service to stay up.
pub async fn start_dbus_server(coordinator: RefreshCoordinator) -> Result<Connection> {
    let mut states = coordinator.subscribe_state();
    let connection = zbus::connection::Builder::session()
        .context("Failed to connect to session D-Bus")?
        .name(DBUS_NAME)
        .context("Failed to request D-Bus name")?
        .serve_at(DBUS_PATH, SchedulerService::new(coordinator))
        .context("Failed to register D-Bus interface")?
        .build()
        .await
        .context("Failed to start D-Bus service - is another daemon running?")?;

    let iface_ref = connection
        .object_server()
        .interface::<_, SchedulerService>(DBUS_PATH)
        .await
        .context("Failed to look up D-Bus interface")?;

    // Emits PropertiesChanged for State on every transition, loop-driven ones included.
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let iface = iface_ref.get().await;
            if let Err(e) = iface.state_changed(iface_ref.signal_context()).await {
                tracing::warn!(error = %e, "Failed to emit State change");
            }
        }
    });

    tracing::info!(name = DBUS_NAME, path = DBUS_PATH, "D-Bus service ready");
    Ok(connection)
}
