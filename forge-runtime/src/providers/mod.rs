//! Provider Registry
//!
//! Named capability handlers jobs invoke through their declared
//! effects. The registry is owned by the server object; tests build
//! fresh registries instead of touching globals. Built-ins: `email.send`
//! (recording implementation; real delivery bodies are external
//! collaborators), `http.post` (outbound call with a per-call
//! deadline). The `entity.create` capability is built into the job
//! executor because it needs the transaction machinery.

mod email;
mod http;

pub use email::{EmailProvider, RecordedEmail};
pub use http::HttpPostProvider;

use crate::config::RuntimeConfig;
use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default deadline for one provider call.
pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(10);

/// Context handed to every provider call.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    /// Name of the invoking job.
    pub job: String,
    /// Identity the job runs under.
    pub user_id: Option<Uuid>,
    /// Deadline for this call.
    pub deadline: Duration,
}

/// A named capability handler.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Capability name (`email.send`).
    fn name(&self) -> &str;

    /// Execute the capability against a job payload.
    async fn call(&self, ctx: &ProviderContext, payload: &JsonValue) -> ApiResult<JsonValue>;
}

/// The provider registry.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    /// Typed handle on the recording email provider, kept for test
    /// assertions and dev introspection.
    email: Option<Arc<EmailProvider>>,
}

impl ProviderRegistry {
    /// Empty registry (tests compose their own).
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
            email: None,
        }
    }

    /// Registry with the built-in capabilities, parameterized from the
    /// `[providers.*]` config sections.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let mut registry = Self::empty();
        let email = Arc::new(EmailProvider::new(config.provider("email")));
        registry.email = Some(email.clone());
        registry.register(email);
        registry.register(Arc::new(HttpPostProvider::new(config.provider("http"))));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> ApiResult<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::internal(format!("no provider registered for '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// The recording email provider, when registered.
    pub fn email(&self) -> Option<Arc<EmailProvider>> {
        self.email.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Provider for Noop {
        fn name(&self) -> &str {
            "noop.test"
        }
        async fn call(&self, _ctx: &ProviderContext, _payload: &JsonValue) -> ApiResult<JsonValue> {
            Ok(JsonValue::Null)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ProviderRegistry::empty();
        assert!(!registry.contains("noop.test"));
        registry.register(Arc::new(Noop));
        assert!(registry.contains("noop.test"));
        assert!(registry.get("noop.test").is_ok());
        assert!(registry.get("missing.capability").is_err());
    }
}
