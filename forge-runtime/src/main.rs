//! Forge Runtime Entry Point
//!
//! Bootstraps configuration, obtains the artifact (compiling sources in
//! development, loading the compiled document otherwise), reconciles
//! the database schema, and serves until shutdown. Exit code 0 on a
//! clean stop, 1 on any failure: compile errors, migration refusal,
//! bind errors.

use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use forge_core::Artifact;
use forge_runtime::{
    config::RuntimeConfig,
    jobs::{JobEnv, JobExecutor},
    migrate,
    providers::ProviderRegistry,
    state::{AppState, ArtifactStore},
    watch,
    ws::SubscriptionHub,
    AuthService, DbClient,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{}", message);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), String> {
    init_tracing();
    let config = RuntimeConfig::load(Some(Path::new("forge.toml")))?;

    let artifact = obtain_artifact(&config)?;
    info!(
        app = %artifact.app.name,
        version = %artifact.app.version,
        env = config.env.as_str(),
        "artifact loaded"
    );

    let db = DbClient::connect(&config.database).map_err(|e| e.to_string())?;

    // Schema reconciliation gates startup: dangerous changes without a
    // matching acknowledgment refuse before the listener binds.
    match migrate::reconcile(&db, &artifact).await {
        Ok(outcome) if outcome.bootstrapped => info!("database bootstrapped"),
        Ok(outcome) if !outcome.applied.is_empty() => {
            info!(changes = outcome.applied.len(), "schema migrated")
        }
        Ok(_) => info!("schema up to date"),
        Err(e) => return Err(e.to_string()),
    }

    let auth = Arc::new(AuthService::from_settings(&config.auth).map_err(|e| e.to_string())?);
    let hub = Arc::new(SubscriptionHub::new());
    let providers = Arc::new(ProviderRegistry::from_config(&config));
    let artifact_store = ArtifactStore::new(artifact);

    let jobs = JobExecutor::start(
        config.jobs.workers,
        config.jobs.queue_capacity,
        JobEnv {
            db: db.clone(),
            providers: providers.clone(),
            artifact: artifact_store.clone(),
            hub: hub.clone(),
        },
    );

    let config = Arc::new(config);
    let state = AppState {
        artifact: artifact_store,
        db,
        hub,
        jobs: jobs.clone(),
        providers,
        auth,
        config: config.clone(),
        start_time: std::time::Instant::now(),
    };

    // Hot reload in development, when a source directory is known. The
    // watcher handle must outlive the server.
    let _watcher = match (&config.source_dir, config.env.is_development()) {
        (Some(dir), true) => Some(
            watch::spawn_watcher(state.clone(), dir.into())
                .map_err(|e| format!("failed to start watcher: {}", e))?,
        ),
        _ => None,
    };

    let app = forge_runtime::create_router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .map_err(|e| format!("invalid listen address: {}", e))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind {}: {}", addr, e))?;
    info!(%addr, "forge runtime listening");

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("signal handler failed: {}", e))?;
    info!("shutdown signal received");

    // Stop admitting requests, give in-flight ones the grace period,
    // then drain the job executor.
    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(config.shutdown_grace, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => return Err(format!("server error: {}", e)),
        Ok(Err(e)) => return Err(format!("server task panicked: {}", e)),
        Err(_) => error!("in-flight requests exceeded the grace period"),
    }
    jobs.shutdown(config.shutdown_grace).await;

    info!("forge runtime stopped");
    Ok(())
}

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Development compiles sources directly; otherwise the compiled
/// document is loaded from disk.
fn obtain_artifact(config: &RuntimeConfig) -> Result<Artifact, String> {
    if let Some(dir) = &config.source_dir {
        return match forge_dsl::compile_dir(Path::new(dir)) {
            Ok(output) => {
                for warning in output.warnings.iter() {
                    tracing::warn!("{}", warning);
                }
                Ok(output.artifact)
            }
            Err(diagnostics) => {
                for diagnostic in diagnostics.iter() {
                    eprintln!("{}", diagnostic);
                }
                Err("compilation failed".to_string())
            }
        };
    }

    let path = Path::new(&config.artifact_path);
    let bytes = std::fs::read(path)
        .map_err(|e| format!("cannot read artifact {}: {}", path.display(), e))?;
    let artifact =
        Artifact::from_json(&bytes).map_err(|e| format!("invalid artifact: {}", e))?;
    if artifact.format_version != forge_core::ARTIFACT_FORMAT_VERSION {
        return Err(format!(
            "artifact format {} is not supported by this runtime (expected {})",
            artifact.format_version,
            forge_core::ARTIFACT_FORMAT_VERSION
        ));
    }
    Ok(artifact)
}
