use crate::core::error::SchedulerResult;
use crate::core::settings::{ScheduleSettings, SettingsPatch};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Validated holder of the active [`ScheduleSettings`].
///
/// Readers get an immutable snapshot. `set` and `update` are the only
/// mutation paths and both go through [`ScheduleSettings::validate`].
#[derive(Clone)]
pub struct SettingsStore {
    current: Arc<RwLock<Arc<ScheduleSettings>>>,
    path: Option<PathBuf>,
}

impl SettingsStore {
    pub fn new(settings: ScheduleSettings) -> SchedulerResult<Self> {
        settings.validate()?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(settings))),
            path: None,
        })
    }

    /// Opens the persisted settings record, seeding it when absent.
    pub fn open(path: &Path, seed: ScheduleSettings) -> SchedulerResult<Self> {
        let settings = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let stored: ScheduleSettings = serde_json::from_str(&content)?;
            stored.validate()?;
            tracing::info!(?path, "Loaded persisted schedule settings");
            stored
        } else {
            seed.validate()?;
            write_record(path, &seed)?;
            tracing::info!(?path, "Seeded schedule settings");
            seed
        };

        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(settings))),
            path: Some(path.to_path_buf()),
        })
    }

    pub async fn get(&self) -> Arc<ScheduleSettings> {
        Arc::clone(&*self.current.read().await)
    }

    pub async fn set(&self, settings: ScheduleSettings) -> SchedulerResult<Arc<ScheduleSettings>> {
        let mut current = self.current.write().await;
        self.replace(&mut current, settings)
    }

    pub async fn update(&self, patch: &SettingsPatch) -> SchedulerResult<Arc<ScheduleSettings>> {
        let mut current = self.current.write().await;
        let updated = current.apply(patch);
        self.replace(&mut current, updated)
    }

    fn replace(
        &self,
        current: &mut Arc<ScheduleSettings>,
        settings: ScheduleSettings,
    ) -> SchedulerResult<Arc<ScheduleSettings>> {
        settings.validate()?;
        self.persist(&settings)?;
        *current = Arc::new(settings);
        Ok(Arc::clone(current))
    }

    fn persist(&self, settings: &ScheduleSettings) -> SchedulerResult<()> {
        match &self.path {
            Some(path) => write_record(path, settings),
            None => Ok(()),
        }
    }
}

fn write_record(path: &Path, settings: &ScheduleSettings) -> SchedulerResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(settings)?)?;
    std::fs::rename(&tmp, path)?;
    tracing::debug!(?path, "Saved schedule settings");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SchedulerError;
    use crate::core::models::Priority;

    #[tokio::test]
    async fn test_rejects_invalid_initial_settings() {
        let settings = ScheduleSettings {
            peak_interval_secs: 10_000,
            base_interval_secs: 5_000,
            ..Default::default()
        };
        assert!(matches!(
            SettingsStore::new(settings),
            Err(SchedulerError::InvalidSettings(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_update_leaves_snapshot_untouched() {
        let store = SettingsStore::new(ScheduleSettings::default()).unwrap();
        let before = store.get().await;

        let patch = SettingsPatch {
            peak_interval_secs: Some(before.base_interval_secs * 2),
            ..Default::default()
        };
        assert!(store.update(&patch).await.is_err());
        assert_eq!(*store.get().await, *before);
    }

    #[tokio::test]
    async fn test_snapshot_is_immutable_after_update() {
        let store = SettingsStore::new(ScheduleSettings::default()).unwrap();
        let snapshot = store.get().await;

        store
            .update(&SettingsPatch {
                priority: Some(Priority::High),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(snapshot.priority, Priority::Medium);
        assert_eq!(store.get().await.priority, Priority::High);
    }

    #[tokio::test]
    async fn test_set_replaces_whole_record() {
        let store = SettingsStore::new(ScheduleSettings::default()).unwrap();
        let replacement = ScheduleSettings {
            base_interval_secs: 1_800,
            peak_interval_secs: 900,
            notify_on_failure: false,
            ..Default::default()
        };

        let applied = store.set(replacement.clone()).await.unwrap();
        assert_eq!(*applied, replacement);

        let invalid = ScheduleSettings {
            max_run_secs: 1,
            ..Default::default()
        };
        assert!(matches!(
            store.set(invalid).await,
            Err(SchedulerError::InvalidSettings(_))
        ));
        assert_eq!(*store.get().await, replacement);
    }

    #[tokio::test]
    async fn test_persisted_record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::open(&path, ScheduleSettings::default()).unwrap();
        store
            .update(&SettingsPatch {
                base_interval_secs: Some(7_200),
                auto_retry: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();

        let reopened = SettingsStore::open(&path, ScheduleSettings::default()).unwrap();
        let settings = reopened.get().await;
        assert_eq!(settings.base_interval_secs, 7_200);
        assert!(!settings.auto_retry);
    }
}
