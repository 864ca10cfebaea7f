use crate::core::analyzer;
use crate::core::error::{SchedulerError, SchedulerResult};
use crate::core::models::Priority;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MIN_RUN_SECS: u64 = 5;
const MAX_INTERVAL_SECS: u64 = 30 * 24 * 60 * 60;
const MAX_RETENTION_DAYS: u32 = 3650;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub source: SourceSettings,
    pub schedule: ScheduleSettings,
    pub policy: PolicySettings,
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub name: String,
    pub endpoint: Option<String>,
    /// Environment variable holding a bearer token for the endpoint.
    pub token_env: Option<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            name: "warehouse".to_string(),
            endpoint: None,
            token_env: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub max_consecutive_failures: u32,
    pub peak_threshold: f64,
    pub min_samples: usize,
    pub warning_factor: f64,
    pub max_backoff_secs: u64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            peak_threshold: analyzer::DEFAULT_THRESHOLD,
            min_samples: analyzer::DEFAULT_MIN_SAMPLES,
            warning_factor: 1.5,
            max_backoff_secs: 60 * 60,
        }
    }
}

impl PolicySettings {
    pub fn max_backoff(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_backoff_secs.min(MAX_INTERVAL_SECS) as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub base_interval_secs: u64,
    pub peak_interval_secs: u64,
    pub retention_days: u32,
    pub max_run_secs: u64,
    pub priority: Priority,
    pub notify_on_failure: bool,
    pub auto_retry: bool,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            base_interval_secs: 4 * 60 * 60,
            peak_interval_secs: 60 * 60,
            retention_days: 30,
            max_run_secs: 10 * 60,
            priority: Priority::Medium,
            notify_on_failure: true,
            auto_retry: true,
        }
    }
}

impl ScheduleSettings {
    pub fn base_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.base_interval_secs as i64)
    }

    pub fn peak_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.peak_interval_secs as i64)
    }

    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn max_run_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_run_secs)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        let invalid = |msg: String| Err(SchedulerError::InvalidSettings(msg));

        if self.base_interval_secs == 0 || self.peak_interval_secs == 0 {
            return invalid("intervals must be greater than zero".to_string());
        }
        if self.base_interval_secs > MAX_INTERVAL_SECS {
            return invalid(format!(
                "base_interval_secs must be at most {MAX_INTERVAL_SECS}, got {}",
                self.base_interval_secs
            ));
        }
        if self.peak_interval_secs > self.base_interval_secs {
            return invalid(format!(
                "peak_interval_secs ({}) must not exceed base_interval_secs ({})",
                self.peak_interval_secs, self.base_interval_secs
            ));
        }
        if self.retention_days == 0 || self.retention_days > MAX_RETENTION_DAYS {
            return invalid(format!(
                "retention_days must be between 1 and {MAX_RETENTION_DAYS}, got {}",
                self.retention_days
            ));
        }
        if self.max_run_secs < MIN_RUN_SECS || self.max_run_secs > MAX_INTERVAL_SECS {
            return invalid(format!(
                "max_run_secs must be between {MIN_RUN_SECS} and {MAX_INTERVAL_SECS}, got {}",
                self.max_run_secs
            ));
        }
        Ok(())
    }

    pub fn apply(&self, patch: &SettingsPatch) -> Self {
        Self {
            base_interval_secs: patch.base_interval_secs.unwrap_or(self.base_interval_secs),
            peak_interval_secs: patch.peak_interval_secs.unwrap_or(self.peak_interval_secs),
            retention_days: patch.retention_days.unwrap_or(self.retention_days),
            max_run_secs: patch.max_run_secs.unwrap_or(self.max_run_secs),
            priority: patch.priority.unwrap_or(self.priority),
            notify_on_failure: patch.notify_on_failure.unwrap_or(self.notify_on_failure),
            auto_retry: patch.auto_retry.unwrap_or(self.auto_retry),
        }
    }
}

/// Partial update of [`ScheduleSettings`]; absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_run_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_on_failure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_retry: Option<bool>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("freshet").join("config.toml"))
    }

    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|p| p.join("freshet"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(?path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        settings.validate()?;
        tracing::info!(?path, "Loaded config");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()?;

        if self.policy.max_consecutive_failures == 0 {
            anyhow::bail!("policy.max_consecutive_failures must be at least 1");
        }
        if self.policy.peak_threshold <= 0.0 {
            anyhow::bail!(
                "policy.peak_threshold must be positive, got {}",
                self.policy.peak_threshold
            );
        }
        if self.policy.warning_factor < 1.0 {
            anyhow::bail!(
                "policy.warning_factor must be at least 1.0, got {}",
                self.policy.warning_factor
            );
        }
        if self.policy.max_backoff_secs == 0 {
            anyhow::bail!("policy.max_backoff_secs must be greater than zero");
        }
        if self.source.name.trim().is_empty() {
            anyhow::bail!("source.name must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.source.name, "warehouse");
        assert_eq!(settings.schedule.base_interval_secs, 14_400);
        assert_eq!(settings.schedule.priority, Priority::Medium);
        assert!(settings.schedule.auto_retry);
        assert_eq!(settings.policy.max_consecutive_failures, 5);
        assert!((settings.policy.peak_threshold - 1.5).abs() < f64::EPSILON);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_schedule_validation() {
        let mut schedule = ScheduleSettings::default();
        assert!(schedule.validate().is_ok());

        schedule.peak_interval_secs = schedule.base_interval_secs + 1;
        assert!(matches!(
            schedule.validate(),
            Err(SchedulerError::InvalidSettings(_))
        ));

        let mut schedule = ScheduleSettings::default();
        schedule.base_interval_secs = 0;
        assert!(schedule.validate().is_err());

        let mut schedule = ScheduleSettings::default();
        schedule.max_run_secs = MIN_RUN_SECS - 1;
        assert!(schedule.validate().is_err());

        let mut schedule = ScheduleSettings::default();
        schedule.retention_days = 0;
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_patch_keeps_unset_fields() {
        let schedule = ScheduleSettings::default();
        let patch = SettingsPatch {
            peak_interval_secs: Some(1800),
            auto_retry: Some(false),
            ..Default::default()
        };

        let updated = schedule.apply(&patch);
        assert_eq!(updated.peak_interval_secs, 1800);
        assert!(!updated.auto_retry);
        assert_eq!(updated.base_interval_secs, schedule.base_interval_secs);
        assert_eq!(updated.retention_days, schedule.retention_days);
    }

    #[test]
    fn test_patch_from_json_fragment() {
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"priority": "high", "max_run_secs": 120}"#).unwrap();
        assert_eq!(patch.priority, Some(Priority::High));
        assert_eq!(patch.max_run_secs, Some(120));
        assert!(patch.base_interval_secs.is_none());
        assert!(!patch.is_empty());
        assert!(SettingsPatch::default().is_empty());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            debug = true

            [source]
            name = "analytics"
            endpoint = "https://warehouse.internal/refresh"
            token_env = "WAREHOUSE_TOKEN"

            [schedule]
            base_interval_secs = 21600
            peak_interval_secs = 7200
            priority = "high"
            notify_on_failure = false

            [policy]
            max_consecutive_failures = 3
            peak_threshold = 2.0
        "#;

        let settings: Settings = toml::from_str(toml).unwrap();
        assert!(settings.debug);
        assert_eq!(settings.source.name, "analytics");
        assert_eq!(settings.source.token_env.as_deref(), Some("WAREHOUSE_TOKEN"));
        assert_eq!(settings.schedule.base_interval_secs, 21_600);
        assert_eq!(settings.schedule.priority, Priority::High);
        assert!(!settings.schedule.notify_on_failure);
        assert_eq!(settings.schedule.retention_days, 30);
        assert_eq!(settings.policy.max_consecutive_failures, 3);
        assert_eq!(settings.policy.min_samples, 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_missing_path_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(settings.schedule, ScheduleSettings::default());
    }

    #[test]
    fn test_load_from_rejects_invalid_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[schedule]\nbase_interval_secs = 600\npeak_interval_secs = 1200\n",
        )
        .unwrap();
        assert!(Settings::load_from(&path).is_err());
    }
}
