//! Runtime Configuration
//!
//! Loaded from `forge.toml` (sections: database, auth, jobs, providers,
//! plus per-environment overrides under `[environments.<env>]`) and
//! finished with environment variables. String values with an
//! `env:NAME` prefix resolve from the process environment at load time,
//! so secrets never live in the file or the artifact.
//!
//! Environment variables consumed at startup:
//! - `FORGE_ENV`: development | test | production (default: development)
//! - `PORT`: listen port (default: 4000)
//! - `LOG_LEVEL`: tracing filter (default: info)
//! - `FORGE_ARTIFACT_PATH`: compiled artifact location
//! - `FORGE_SOURCE_DIR`: .forge sources for the hot-reload watcher
//! - `FORGE_AUTH_SECRET`: token-signing secret
//! - `FORGE_DATABASE_URL`: PostgreSQL connection string

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgeEnv {
    Development,
    Test,
    Production,
}

impl ForgeEnv {
    pub fn from_env() -> Self {
        match std::env::var("FORGE_ENV").as_deref() {
            Ok("production") => ForgeEnv::Production,
            Ok("test") => ForgeEnv::Test,
            _ => ForgeEnv::Development,
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(self, ForgeEnv::Development)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ForgeEnv::Development => "development",
            ForgeEnv::Test => "test",
            ForgeEnv::Production => "production",
        }
    }
}

/// Authentication provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthProviderKind {
    /// Every request is anonymous; routes that require auth reject.
    None,
    /// Bearer tokens verified against the shared secret; account
    /// issuance happens elsewhere.
    #[default]
    Token,
    /// Full password-based accounts with the /auth/* surface mounted.
    Password,
}

/// `[auth]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub provider: AuthProviderKind,
    /// Token-signing secret; `env:NAME` indirection recommended.
    pub secret: Option<String>,
    /// Access-token lifetime in seconds.
    pub access_ttl_secs: u64,
    /// Refresh-token lifetime in seconds.
    pub refresh_ttl_secs: u64,
    /// Identity webhook-triggered actions run under, when set.
    pub webhook_user: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            provider: AuthProviderKind::Token,
            secret: None,
            access_ttl_secs: 3600,
            refresh_ttl_secs: 30 * 24 * 3600,
            webhook_user: None,
        }
    }
}

/// `[database]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// embedded | external; the embedded downloader is an external
    /// collaborator, the runtime only consumes the resulting URL.
    pub adapter: String,
    pub url: Option<String>,
    pub pool_size: usize,
    pub ssl_mode: Option<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            adapter: "external".to_string(),
            url: None,
            pool_size: 16,
            ssl_mode: None,
        }
    }
}

/// `[jobs]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsSettings {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for JobsSettings {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 1000,
        }
    }
}

/// One `[providers.<name>]` block: free-form parameters handed to the
/// named capability handler.
pub type ProviderSettings = BTreeMap<String, String>;

/// The raw TOML document, including per-environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    database: DatabaseSettings,
    auth: AuthSettings,
    jobs: JobsSettings,
    providers: BTreeMap<String, ProviderSettings>,
    environments: BTreeMap<String, RawOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawOverride {
    database: Option<DatabaseSettings>,
    auth: Option<AuthSettings>,
    jobs: Option<JobsSettings>,
    providers: Option<BTreeMap<String, ProviderSettings>>,
}

/// Fully-resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub env: ForgeEnv,
    pub port: u16,
    pub log_level: String,
    pub artifact_path: String,
    pub source_dir: Option<String>,
    pub database: DatabaseSettings,
    pub auth: AuthSettings,
    pub jobs: JobsSettings,
    pub providers: BTreeMap<String, ProviderSettings>,
    /// Grace period for in-flight requests at shutdown.
    pub shutdown_grace: Duration,
    /// Per-request deadline.
    pub request_deadline: Duration,
}

impl RuntimeConfig {
    /// Load configuration: TOML file (when present) + environment.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let env = ForgeEnv::from_env();

        let mut raw = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
                toml::from_str::<RawConfig>(&text)
                    .map_err(|e| format!("invalid {}: {}", path.display(), e))?
            }
            _ => RawConfig::default(),
        };

        // Per-environment overrides replace whole sections.
        if let Some(overrides) = raw.environments.remove(env.as_str()) {
            if let Some(database) = overrides.database {
                raw.database = database;
            }
            if let Some(auth) = overrides.auth {
                raw.auth = auth;
            }
            if let Some(jobs) = overrides.jobs {
                raw.jobs = jobs;
            }
            if let Some(providers) = overrides.providers {
                raw.providers = providers;
            }
        }

        let mut config = Self {
            env,
            port: read_env_parsed("PORT", 4000),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            artifact_path: std::env::var("FORGE_ARTIFACT_PATH")
                .unwrap_or_else(|_| "app.artifact.json".to_string()),
            source_dir: std::env::var("FORGE_SOURCE_DIR").ok(),
            database: raw.database,
            auth: raw.auth,
            jobs: raw.jobs,
            providers: raw.providers,
            shutdown_grace: Duration::from_secs(30),
            request_deadline: Duration::from_secs(30),
        };

        // Environment variables trump the file for the two secrets.
        if let Ok(url) = std::env::var("FORGE_DATABASE_URL") {
            config.database.url = Some(url);
        }
        if let Ok(secret) = std::env::var("FORGE_AUTH_SECRET") {
            config.auth.secret = Some(secret);
        }

        config.resolve_secrets()?;
        Ok(config)
    }

    /// Resolve every `env:NAME` string value against the process
    /// environment.
    fn resolve_secrets(&mut self) -> Result<(), String> {
        if let Some(url) = &self.database.url {
            self.database.url = Some(resolve_env_ref(url)?);
        }
        if let Some(secret) = &self.auth.secret {
            self.auth.secret = Some(resolve_env_ref(secret)?);
        }
        for params in self.providers.values_mut() {
            for value in params.values_mut() {
                *value = resolve_env_ref(value)?;
            }
        }
        Ok(())
    }

    /// Parameters for a named provider, empty when unconfigured.
    pub fn provider(&self, name: &str) -> ProviderSettings {
        self.providers.get(name).cloned().unwrap_or_default()
    }
}

/// `env:NAME` → the variable's value; anything else passes through.
fn resolve_env_ref(value: &str) -> Result<String, String> {
    match value.strip_prefix("env:") {
        Some(name) => {
            std::env::var(name).map_err(|_| format!("environment variable '{}' is not set", name))
        }
        None => Ok(value.to_string()),
    }
}

fn read_env_parsed<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let raw = RawConfig::default();
        assert_eq!(raw.jobs.workers, 10);
        assert_eq!(raw.jobs.queue_capacity, 1000);
        assert_eq!(raw.database.pool_size, 16);
        assert_eq!(raw.auth.provider, AuthProviderKind::Token);
    }

    #[test]
    fn test_toml_parsing_with_overrides() {
        let text = r#"
            [database]
            url = "postgres://localhost/forge_dev"
            pool_size = 8

            [auth]
            provider = "password"
            secret = "dev-secret"

            [jobs]
            workers = 4

            [providers.email]
            from = "noreply@example.com"

            [environments.production.database]
            url = "env:DATABASE_URL"
            pool_size = 32
        "#;
        let raw: RawConfig = toml::from_str(text).expect("parse");
        assert_eq!(raw.database.pool_size, 8);
        assert_eq!(raw.auth.provider, AuthProviderKind::Password);
        assert_eq!(raw.jobs.workers, 4);
        assert_eq!(
            raw.providers.get("email").unwrap().get("from").unwrap(),
            "noreply@example.com"
        );
        let production = raw.environments.get("production").unwrap();
        assert_eq!(
            production.database.as_ref().unwrap().url.as_deref(),
            Some("env:DATABASE_URL")
        );
    }

    #[test]
    fn test_env_ref_resolution() {
        std::env::set_var("FORGE_TEST_SECRET_VALUE", "s3cret");
        assert_eq!(
            resolve_env_ref("env:FORGE_TEST_SECRET_VALUE").unwrap(),
            "s3cret"
        );
        assert_eq!(resolve_env_ref("plain-value").unwrap(), "plain-value");
        assert!(resolve_env_ref("env:FORGE_TEST_DOES_NOT_EXIST").is_err());
    }
}
