mod http;

use crate::core::error::SourceError;
use crate::core::models::{Priority, RefreshCounters};
use crate::core::settings::SourceSettings;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub use http::HttpSource;

/// The monitored system. Called once per triggered run.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;
    async fn refresh(&self, priority: Priority) -> Result<RefreshCounters, SourceError>;
}

pub fn build_source(settings: &SourceSettings) -> Result<Arc<dyn DataSource>> {
    let Some(endpoint) = settings.endpoint.as_deref() else {
        anyhow::bail!(
            "source.endpoint is not configured for '{}'. Set it in the config file.",
            settings.name
        );
    };

    let token = settings
        .token_env
        .as_deref()
        .and_then(|var| match std::env::var(var) {
            Ok(token) => Some(token),
            Err(_) => {
                tracing::warn!(var, "Token environment variable not set, sending unauthenticated requests");
                None
            }
        });

    Ok(Arc::new(HttpSource::new(&settings.name, endpoint, token)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_source_requires_endpoint() {
        let settings = SourceSettings::default();
        let err = build_source(&settings).err().unwrap();
        assert!(err.to_string().contains("source.endpoint"));
    }

    #[test]
    fn test_build_source_uses_configured_name() {
        let settings = SourceSettings {
            name: "analytics".to_string(),
            endpoint: Some("http://127.0.0.1:9/refresh".to_string()),
            token_env: None,
        };
        let source = build_source(&settings).unwrap();
        assert_eq!(source.name(), "analytics");
    }
}
