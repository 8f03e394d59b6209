//! Shared application state for Axum routers.

use crate::auth::AuthService;
use crate::config::RuntimeConfig;
use crate::db::DbClient;
use crate::jobs::JobExecutor;
use crate::providers::ProviderRegistry;
use crate::ws::SubscriptionHub;
use forge_core::Artifact;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The loaded artifact behind a read/write lock.
///
/// Handlers clone the inner `Arc` at dispatch entry (O(1), never held
/// across I/O) and the reloader takes the write lock only to rotate
/// the pointer. A request therefore always sees one coherent artifact:
/// either the version it started with or, for requests admitted after a
/// swap, the new one. Never a torn mix.
#[derive(Clone)]
pub struct ArtifactStore {
    inner: Arc<RwLock<Arc<Artifact>>>,
}

impl ArtifactStore {
    pub fn new(artifact: Artifact) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(artifact))),
        }
    }

    /// The current artifact.
    pub async fn current(&self) -> Arc<Artifact> {
        self.inner.read().await.clone()
    }

    /// Swap in a new artifact; in-flight requests keep their clone.
    pub async fn swap(&self, artifact: Artifact) {
        let mut guard = self.inner.write().await;
        *guard = Arc::new(artifact);
    }
}

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub artifact: ArtifactStore,
    pub db: DbClient,
    pub hub: Arc<SubscriptionHub>,
    pub jobs: JobExecutor,
    pub providers: Arc<ProviderRegistry>,
    pub auth: Arc<AuthService>,
    pub config: Arc<RuntimeConfig>,
    pub start_time: std::time::Instant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn empty_artifact(version: &str) -> Artifact {
        Artifact {
            format_version: forge_core::ARTIFACT_FORMAT_VERSION,
            compiler_version: version.to_string(),
            source_digest: String::new(),
            app: forge_core::AppInfo {
                name: "test".to_string(),
                version: "0.0.0".to_string(),
            },
            entities: BTreeMap::new(),
            relations: Vec::new(),
            rules: Vec::new(),
            access: BTreeMap::new(),
            messages: BTreeMap::new(),
            actions: BTreeMap::new(),
            views: BTreeMap::new(),
            routes: Vec::new(),
            hooks: Vec::new(),
            jobs: BTreeMap::new(),
            webhooks: BTreeMap::new(),
            tests: Vec::new(),
            migration_acks: Vec::new(),
            ddl: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_swap_is_atomic_for_held_clones() {
        let store = ArtifactStore::new(empty_artifact("1"));
        let held = store.current().await;

        store.swap(empty_artifact("2")).await;

        // The held clone is unchanged; new reads see the swap.
        assert_eq!(held.compiler_version, "1");
        assert_eq!(store.current().await.compiler_version, "2");
    }
}
