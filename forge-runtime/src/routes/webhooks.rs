//! Webhook receivers
//!
//! `POST /webhooks/{name}`: the declared provider verifies the payload
//! signature over the raw body, the payload keys are normalized to
//! snake_case, and the declared action runs under the configured
//! webhook identity. Signature schemes share one HMAC-SHA256 primitive;
//! `stripe` reads the `Stripe-Signature` t/v1 header shape, everything
//! else the `X-Forge-Signature` hex digest.

use crate::auth::AuthContext;
use crate::envelope::Envelope;
use crate::error::{ApiError, ApiResult};
use crate::routes::actions;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use forge_dsl::normalize::snake_case;
use hmac::{Hmac, Mac};
use serde_json::Value as JsonValue;
use sha2::Sha256;
use tracing::info;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// `POST /webhooks/{name}`
pub async fn receive(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Envelope<JsonValue>>> {
    let artifact = state.artifact.current().await;
    let webhook = artifact.webhooks.get(&name).ok_or_else(ApiError::not_found)?;

    let settings = state.config.provider(&webhook.provider);
    let secret = settings
        .get("secret")
        .ok_or_else(|| ApiError::auth_invalid("Webhook provider has no secret configured"))?;

    match webhook.provider.as_str() {
        "stripe" => verify_stripe(secret, &headers, &body)?,
        _ => verify_generic(secret, &headers, &body)?,
    }

    let payload: JsonValue = serde_json::from_slice(&body)
        .map_err(|_| ApiError::invalid_input("Webhook body is not valid JSON"))?;
    let normalized = normalize_keys(payload);
    let input = project_onto_input(&artifact, &webhook.action, normalized)?;

    // Webhooks are externally authenticated; the declared action runs
    // under the configured service identity (anonymous otherwise).
    let ctx = webhook_identity(&state)?;
    info!(webhook = %name, action = %webhook.action, "webhook accepted");
    let result = actions::run_action(&state, &artifact, &ctx, &webhook.action, &input).await?;
    Ok(Json(Envelope::ok(result)))
}

/// External payloads carry provider envelope keys beyond the action's
/// input entity; keep only the fields (and the id) the action can bind.
fn project_onto_input(
    artifact: &forge_core::Artifact,
    action: &str,
    payload: JsonValue,
) -> ApiResult<JsonValue> {
    let plan = artifact.actions.get(action).ok_or_else(ApiError::not_found)?;
    let Some(entity) = artifact.entity(&plan.input) else {
        return Ok(payload);
    };
    let columns = crate::crud::bindable_columns(artifact, entity);
    let Some(object) = payload.as_object() else {
        return Ok(payload);
    };
    let projected: serde_json::Map<String, JsonValue> = object
        .iter()
        .filter(|(key, _)| {
            key.as_str() == "id" || columns.iter().any(|c| &c.name == *key)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Ok(JsonValue::Object(projected))
}

fn webhook_identity(state: &AppState) -> ApiResult<AuthContext> {
    match &state.config.auth.webhook_user {
        Some(raw) => {
            let id = Uuid::parse_str(raw)
                .map_err(|_| ApiError::internal("auth.webhook_user is not a UUID"))?;
            Ok(AuthContext::user(id))
        }
        None => Ok(AuthContext::anonymous()),
    }
}

/// `X-Forge-Signature: <hex hmac-sha256 of the raw body>`
fn verify_generic(secret: &str, headers: &HeaderMap, body: &[u8]) -> ApiResult<()> {
    let signature = headers
        .get("x-forge-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::auth_invalid("Missing signature header"))?;
    let expected = hex::decode(signature)
        .map_err(|_| ApiError::auth_invalid("Malformed signature"))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ApiError::internal("invalid webhook secret"))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| ApiError::auth_invalid("Signature mismatch"))
}

/// `Stripe-Signature: t=<ts>,v1=<hex hmac-sha256 of "<ts>.<body>">`
fn verify_stripe(secret: &str, headers: &HeaderMap, body: &[u8]) -> ApiResult<()> {
    let header = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::auth_invalid("Missing signature header"))?;

    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value.to_string()),
            Some(("v1", value)) => signature = Some(value.to_string()),
            _ => {}
        }
    }
    let (timestamp, signature) = match (timestamp, signature) {
        (Some(t), Some(v1)) => (t, v1),
        _ => return Err(ApiError::auth_invalid("Malformed signature header")),
    };
    let expected =
        hex::decode(&signature).map_err(|_| ApiError::auth_invalid("Malformed signature"))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ApiError::internal("invalid webhook secret"))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| ApiError::auth_invalid("Signature mismatch"))
}

/// Recursively normalize object keys to snake_case.
fn normalize_keys(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(object) => JsonValue::Object(
            object
                .into_iter()
                .map(|(key, value)| (snake_case(&key), normalize_keys(value)))
                .collect(),
        ),
        JsonValue::Array(items) => {
            JsonValue::Array(items.into_iter().map(normalize_keys).collect())
        }
        other => other,
    }
}
