//! Forge Runtime - Sealed Execution Server
//!
//! Loads a compiled artifact, reconciles the database schema, and
//! serves the application as an HTTP + WebSocket backend. All data
//! access flows through the enforcement pipeline: authentication,
//! identity injection, transaction, rule evaluation, commit, hooks,
//! invalidation broadcast. There is no bypass path for application
//! code: row visibility is decided by the storage policies the
//! compiler attached to every table.

pub mod auth;
pub mod config;
pub mod crud;
pub mod db;
pub mod envelope;
pub mod error;
pub mod jobs;
pub mod migrate;
pub mod pipeline;
pub mod providers;
pub mod routes;
pub mod state;
pub mod views;
pub mod watch;
pub mod ws;

// Re-export commonly used types
pub use auth::{bearer_token, AuthContext, AuthService};
pub use config::{AuthProviderKind, ForgeEnv, RuntimeConfig};
pub use db::{DbClient, RequestTx};
pub use envelope::{ApiMessage, Envelope, Page, Pagination};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use jobs::{JobEnv, JobExecutor, JobRequest};
pub use migrate::{reconcile, MigrateError, MigrationOutcome};
pub use providers::{Provider, ProviderContext, ProviderRegistry};
pub use routes::create_router;
pub use state::{AppState, ArtifactStore};
pub use views::{execute_view, ViewQuery};
pub use ws::{ClientFrame, ServerFrame, SubscriptionHub};
