//! `email.send` capability
//!
//! Records every send and logs it. Actual SMTP/provider delivery is an
//! external collaborator; this implementation satisfies the contract
//! the job executor and the test harness depend on: a call list that is
//! observable after the fact.

use super::{Provider, ProviderContext};
use crate::config::ProviderSettings;
use crate::error::ApiResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Mutex;
use tracing::info;

/// One recorded send.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedEmail {
    pub job: String,
    pub payload: JsonValue,
    pub sent_at: DateTime<Utc>,
}

/// Recording email provider.
pub struct EmailProvider {
    settings: ProviderSettings,
    calls: Mutex<Vec<RecordedEmail>>,
}

impl EmailProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            settings,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of every recorded call.
    pub fn recorded(&self) -> Vec<RecordedEmail> {
        self.calls.lock().expect("email call list poisoned").clone()
    }

    pub fn recorded_count(&self) -> usize {
        self.calls.lock().expect("email call list poisoned").len()
    }
}

#[async_trait]
impl Provider for EmailProvider {
    fn name(&self) -> &str {
        "email.send"
    }

    async fn call(&self, ctx: &ProviderContext, payload: &JsonValue) -> ApiResult<JsonValue> {
        let record = RecordedEmail {
            job: ctx.job.clone(),
            payload: payload.clone(),
            sent_at: Utc::now(),
        };
        info!(
            job = %ctx.job,
            from = self.settings.get("from").map(String::as_str).unwrap_or("<unset>"),
            "email.send recorded"
        );
        self.calls
            .lock()
            .expect("email call list poisoned")
            .push(record);
        Ok(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[tokio::test]
    async fn test_calls_are_recorded() {
        let provider = EmailProvider::new(BTreeMap::new());
        let ctx = ProviderContext {
            job: "notify_agents".to_string(),
            user_id: None,
            deadline: Duration::from_secs(5),
        };
        provider
            .call(&ctx, &serde_json::json!({"input": {"subject": "hi"}}))
            .await
            .expect("call");

        let recorded = provider.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].job, "notify_agents");
        assert_eq!(recorded[0].payload["input"]["subject"], "hi");
    }
}
