//! Health and readiness probes.

use crate::envelope::Envelope;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{extract::State, Json};
use serde_json::{json, Value as JsonValue};

/// `GET /health`: process liveness.
pub async fn liveness(State(state): State<AppState>) -> Json<Envelope<JsonValue>> {
    Json(Envelope::ok(json!({
        "status": "alive",
        "uptime_secs": state.start_time.elapsed().as_secs(),
    })))
}

/// `GET /health/ready`: database reachable, artifact loaded, queue
/// accepting.
pub async fn readiness(State(state): State<AppState>) -> ApiResult<Json<Envelope<JsonValue>>> {
    state
        .db
        .ping()
        .await
        .map_err(|_| ApiError::database_unavailable())?;

    if !state.jobs.is_accepting() {
        return Err(ApiError::queue_full());
    }

    let artifact = state.artifact.current().await;
    Ok(Json(Envelope::ok(json!({
        "status": "ready",
        "app": artifact.app.name,
        "artifact_digest": artifact.source_digest,
    }))))
}
