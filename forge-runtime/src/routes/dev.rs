//! Dev introspection
//!
//! Read-only views of the loaded artifact, mounted only in development.
//! In production these paths are simply never mounted, so they return
//! the generic 404, never 403, which would disclose their existence.

use crate::envelope::Envelope;
use crate::state::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value as JsonValue};

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/artifact", get(artifact))
        .route("/routes", get(routes))
}

/// `GET /_dev`
async fn index(State(state): State<AppState>) -> Json<Envelope<JsonValue>> {
    let artifact = state.artifact.current().await;
    Json(Envelope::ok(json!({
        "app": artifact.app.name,
        "version": artifact.app.version,
        "compiler_version": artifact.compiler_version,
        "source_digest": artifact.source_digest,
        "entities": artifact.entities.keys().collect::<Vec<_>>(),
        "views": artifact.views.keys().collect::<Vec<_>>(),
        "actions": artifact.actions.keys().collect::<Vec<_>>(),
        "jobs": artifact.jobs.keys().collect::<Vec<_>>(),
        "paths": ["/_dev/artifact", "/_dev/routes"],
    })))
}

/// `GET /_dev/artifact`: the whole loaded document.
async fn artifact(State(state): State<AppState>) -> Json<Envelope<JsonValue>> {
    let artifact = state.artifact.current().await;
    let value = serde_json::to_value(artifact.as_ref()).unwrap_or(JsonValue::Null);
    Json(Envelope::ok(value))
}

/// `GET /_dev/routes`: the compiled route table.
async fn routes(State(state): State<AppState>) -> Json<Envelope<JsonValue>> {
    let artifact = state.artifact.current().await;
    let value = serde_json::to_value(&artifact.routes).unwrap_or(JsonValue::Null);
    Json(Envelope::ok(value))
}
