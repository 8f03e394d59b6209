//! Action handlers
//!
//! `POST /api/actions/{name}`: the body is validated against the
//! action's input entity and dispatched to the declared targets
//! (creates / updates / deletes), all inside one transaction. Webhooks
//! reuse the same dispatch under their own identity.

use crate::auth::AuthContext;
use crate::crud;
use crate::envelope::Envelope;
use crate::error::{ApiError, ApiResult};
use crate::pipeline::{self, Mutation};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use forge_core::{ActionPlan, Artifact, Operation};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

/// `POST /api/actions/{name}`
pub async fn execute(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path(name): Path<String>,
    Json(body): Json<JsonValue>,
) -> ApiResult<Json<Envelope<JsonValue>>> {
    pipeline::ensure_authenticated(&state, &ctx)?;
    let artifact = state.artifact.current().await;
    let result = run_action(&state, &artifact, &ctx, &name, &body).await?;
    Ok(Json(Envelope::ok(result)))
}

/// Dispatch one action: open the transaction, perform the declared
/// mutations, run the pipeline finish. Shared by the HTTP handler and
/// the webhook receiver.
pub(crate) async fn run_action(
    state: &AppState,
    artifact: &Artifact,
    ctx: &AuthContext,
    name: &str,
    body: &JsonValue,
) -> ApiResult<JsonValue> {
    let action = artifact.actions.get(name).ok_or_else(ApiError::not_found)?;

    let tx = state.db.begin(ctx.user_id).await?;
    let mut mutations: Vec<Mutation> = Vec::new();
    let mut result = JsonValue::Null;

    if let Some(target) = &action.creates {
        let plan = artifact.entity(target).ok_or_else(ApiError::not_found)?;
        let row = crud::insert_row(&tx, artifact, plan, body).await?;
        mutations.push(Mutation {
            entity: plan.name.clone(),
            operation: Operation::Create,
            row_id: row_id_of(&row)?,
            row: row.clone(),
        });
        result = row;
    }

    if let Some(target) = &action.updates {
        let plan = artifact.entity(target).ok_or_else(ApiError::not_found)?;
        let id = body_row_id(action, body)?;
        let patch = body_without_id(body);
        let row = crud::update_row(&tx, artifact, plan, id, &patch)
            .await?
            .ok_or_else(ApiError::not_found)?;
        mutations.push(Mutation {
            entity: plan.name.clone(),
            operation: Operation::Update,
            row_id: id,
            row: row.clone(),
        });
        result = row;
    }

    if let Some(target) = &action.deletes {
        let plan = artifact.entity(target).ok_or_else(ApiError::not_found)?;
        let id = body_row_id(action, body)?;
        let row = crud::fetch_row(&tx, artifact, plan, id)
            .await?
            .ok_or_else(ApiError::not_found)?;
        if let Err(violation) =
            pipeline::check_rules(&tx, artifact, &plan.name, Operation::Delete, id).await
        {
            tx.rollback().await?;
            return Err(violation);
        }
        if !crud::delete_row(&tx, plan, id).await? {
            tx.rollback().await?;
            return Err(ApiError::not_found());
        }
        mutations.push(Mutation {
            entity: plan.name.clone(),
            operation: Operation::Delete,
            row_id: id,
            row,
        });
        result = json!({ "deleted": true });
    }

    pipeline::finish(state, artifact, ctx, tx, mutations).await?;
    Ok(result)
}

fn row_id_of(row: &JsonValue) -> ApiResult<Uuid> {
    row.get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| ApiError::internal("row missing id"))
}

fn body_row_id(action: &ActionPlan, body: &JsonValue) -> ApiResult<Uuid> {
    let raw = body
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ApiError::invalid_input(format!("Action '{}' requires an 'id' field", action.name))
        })?;
    Uuid::parse_str(raw).map_err(|_| ApiError::invalid_input("Malformed 'id'"))
}

fn body_without_id(body: &JsonValue) -> JsonValue {
    match body.as_object() {
        Some(object) => {
            let mut patch = object.clone();
            patch.remove("id");
            JsonValue::Object(patch)
        }
        None => body.clone(),
    }
}
