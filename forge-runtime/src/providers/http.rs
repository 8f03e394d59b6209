//! `http.post` capability
//!
//! POSTs the job payload as JSON to the configured endpoint, bounded by
//! the per-call deadline. Failures are ordinary provider errors, which
//! the executor retries with backoff.

use super::{Provider, ProviderContext};
use crate::config::ProviderSettings;
use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::warn;

/// Outbound HTTP provider.
pub struct HttpPostProvider {
    settings: ProviderSettings,
    client: reqwest::Client,
}

impl HttpPostProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for HttpPostProvider {
    fn name(&self) -> &str {
        "http.post"
    }

    async fn call(&self, ctx: &ProviderContext, payload: &JsonValue) -> ApiResult<JsonValue> {
        let url = self
            .settings
            .get("url")
            .ok_or_else(|| ApiError::internal("providers.http.url is not configured"))?;

        let response = self
            .client
            .post(url)
            .timeout(ctx.deadline)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                warn!(job = %ctx.job, error = %e, "http.post failed");
                ApiError::internal(format!("http.post failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(job = %ctx.job, status = %status, "http.post non-success");
            return Err(ApiError::internal(format!(
                "http.post returned {}",
                status
            )));
        }
        Ok(response.json().await.unwrap_or(JsonValue::Null))
    }
}
