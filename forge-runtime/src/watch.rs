//! Hot-reload Watcher
//!
//! Watches the source directory, debounces change bursts (200 ms
//! window), recompiles, reconciles the schema and atomically swaps the
//! artifact pointer. A failed compile prints its diagnostics and keeps
//! the previous artifact live; in-flight requests always finish against
//! the artifact they started with.

use crate::migrate;
use crate::state::AppState;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Debounce window for filesystem event bursts.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

/// Start watching a source directory. The returned watcher must stay
/// alive for events to keep flowing.
pub fn spawn_watcher(
    state: AppState,
    source_dir: PathBuf,
) -> notify::Result<notify::RecommendedWatcher> {
    let (tx, rx) = mpsc::unbounded_channel::<()>();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) if is_relevant(&event) => {
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "watch error"),
        }
    })?;
    watcher.watch(&source_dir, RecursiveMode::Recursive)?;
    info!(dir = %source_dir.display(), "watching sources for changes");

    tokio::spawn(debounce_loop(state, source_dir, rx));
    Ok(watcher)
}

fn is_relevant(event: &Event) -> bool {
    let touches_source = event
        .paths
        .iter()
        .any(|p| p.extension().and_then(|e| e.to_str()) == Some("forge"));
    touches_source
        && matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        )
}

async fn debounce_loop(state: AppState, source_dir: PathBuf, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
        // Collapse the burst: keep absorbing events until the window
        // passes quietly.
        loop {
            match tokio::time::timeout(DEBOUNCE_WINDOW, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        reload(&state, &source_dir).await;
    }
}

/// Recompile and swap. Failure of any stage keeps the old artifact.
pub async fn reload(state: &AppState, source_dir: &Path) {
    let output = match forge_dsl::compile_dir(source_dir) {
        Ok(output) => output,
        Err(diagnostics) => {
            error!("recompile failed; keeping previous artifact");
            for diagnostic in diagnostics.iter() {
                error!("{}", diagnostic);
            }
            return;
        }
    };

    for warning in output.warnings.iter() {
        warn!("{}", warning);
    }

    match migrate::reconcile(&state.db, &output.artifact).await {
        Ok(outcome) => {
            if !outcome.applied.is_empty() {
                info!(changes = outcome.applied.len(), "schema reconciled on reload");
            }
        }
        Err(e) => {
            // Unlike startup, a reload refusal keeps serving the old
            // artifact instead of exiting.
            error!(error = %e, "migration refused on reload; keeping previous artifact");
            return;
        }
    }

    let digest = output.artifact.source_digest.clone();
    let short = &digest[..12.min(digest.len())];
    state.artifact.swap(output.artifact).await;
    state.hub.notify_reload();
    info!(digest = %short, "artifact reloaded");
}
