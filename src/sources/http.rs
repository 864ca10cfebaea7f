use crate::core::error::SourceError;
use crate::core::models::{Priority, RefreshCounters};
use crate::sources::DataSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    priority: &'a str,
}

/// Triggers a refresh by POSTing to an HTTP endpoint.
///
/// The endpoint answers with `{"tables_scanned", "queries_analyzed",
/// "duration_ms"}`. No client-side timeout is set; the coordinator owns the
/// run deadline.
pub struct HttpSource {
    name: String,
    endpoint: reqwest::Url,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(name: &str, endpoint: &str, token: Option<String>) -> Result<Self> {
        let endpoint = reqwest::Url::parse(endpoint)
            .with_context(|| format!("Invalid source endpoint: {endpoint}"))?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("freshet/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            name: name.to_string(),
            endpoint,
            token,
            client,
        })
    }
}

#[async_trait]
impl DataSource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh(&self, priority: Priority) -> Result<RefreshCounters, SourceError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&RefreshRequest {
            priority: priority.as_str(),
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Query(format!("{} - {}", status, body.trim())));
        }

        let counters: RefreshCounters = response
            .json()
            .await
            .map_err(|e| SourceError::Query(format!("Malformed refresh response: {e}")))?;

        tracing::debug!(
            source = %self.name,
            tables = counters.tables_scanned,
            queries = counters.queries_analyzed,
            "Source refresh returned"
        );
        Ok(counters)
    }
}

fn classify(error: reqwest::Error) -> SourceError {
    if error.is_timeout() {
        SourceError::Timeout
    } else if error.is_connect() || error.is_request() {
        SourceError::Connection(error.to_string())
    } else {
        SourceError::Query(error.to_string())
    }
}
