//! Entity CRUD handlers
//!
//! `GET|POST /api/entities/{name}` and
//! `GET|PUT|DELETE /api/entities/{name}/{id}`. Every statement runs on
//! the request's RLS-bound transaction: a row the policies hide is
//! indistinguishable from a missing one (404), and a write the
//! policies reject surfaces as 403. Mutations flow through the
//! pipeline finish: rules, change log, commit, hooks, invalidations.

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
use forge_core::{Artifact, EntityPlan, Operation};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

/// Bound on unpaginated CRUD listings.
const LIST_LIMIT: i64 = 100;

fn entity_plan<'a>(artifact: &'a Artifact, name: &str) -> ApiResult<&'a EntityPlan> {
    artifact.entity(name).ok_or_else(ApiError::not_found)
}

fn parse_row_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::not_found())
}

fn mutation_row_id(row: &JsonValue) -> ApiResult<Uuid> {
    row.get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| ApiError::internal("row missing id"))
}

/// `GET /api/entities/{name}`
pub async fn list(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path(entity): Path<String>,
) -> ApiResult<Json<Envelope<JsonValue>>> {
    pipeline::ensure_authenticated(&state, &ctx)?;
    let artifact = state.artifact.current().await;
    let plan = entity_plan(&artifact, &entity)?;

    let tx = state.db.begin(ctx.user_id).await?;
    let items = crud::list_rows(&tx, &artifact, plan, LIST_LIMIT).await?;
    tx.commit().await?;

    Ok(Json(Envelope::ok(json!({ "items": items }))))
}

/// `GET /api/entities/{name}/{id}`
pub async fn fetch(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path((entity, id)): Path<(String, String)>,
) -> ApiResult<Json<Envelope<JsonValue>>> {
    pipeline::ensure_authenticated(&state, &ctx)?;
    let artifact = state.artifact.current().await;
    let plan = entity_plan(&artifact, &entity)?;
    let id = parse_row_id(&id)?;

    let tx = state.db.begin(ctx.user_id).await?;
    let row = crud::fetch_row(&tx, &artifact, plan, id).await?;
    tx.commit().await?;

    row.map(|row| Json(Envelope::ok(row)))
        .ok_or_else(ApiError::not_found)
}

/// `POST /api/entities/{name}`
pub async fn create(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path(entity): Path<String>,
    Json(body): Json<JsonValue>,
) -> ApiResult<Json<Envelope<JsonValue>>> {
    pipeline::ensure_authenticated(&state, &ctx)?;
    let artifact = state.artifact.current().await;
    let plan = entity_plan(&artifact, &entity)?;

    let tx = state.db.begin(ctx.user_id).await?;
    let row = crud::insert_row(&tx, &artifact, plan, &body).await?;
    let mutation = Mutation {
        entity: plan.name.clone(),
        operation: Operation::Create,
        row_id: mutation_row_id(&row)?,
        row: row.clone(),
    };
    pipeline::finish(&state, &artifact, &ctx, tx, vec![mutation]).await?;

    Ok(Json(Envelope::ok(row)))
}

/// `PUT /api/entities/{name}/{id}`
pub async fn update(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path((entity, id)): Path<(String, String)>,
    Json(body): Json<JsonValue>,
) -> ApiResult<Json<Envelope<JsonValue>>> {
    pipeline::ensure_authenticated(&state, &ctx)?;
    let artifact = state.artifact.current().await;
    let plan = entity_plan(&artifact, &entity)?;
    let id = parse_row_id(&id)?;

    let tx = state.db.begin(ctx.user_id).await?;
    let row = crud::update_row(&tx, &artifact, plan, id, &body)
        .await?
        .ok_or_else(ApiError::not_found)?;
    let mutation = Mutation {
        entity: plan.name.clone(),
        operation: Operation::Update,
        row_id: id,
        row: row.clone(),
    };
    pipeline::finish(&state, &artifact, &ctx, tx, vec![mutation]).await?;

    Ok(Json(Envelope::ok(row)))
}

/// `DELETE /api/entities/{name}/{id}`
pub async fn remove(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path((entity, id)): Path<(String, String)>,
) -> ApiResult<Json<Envelope<JsonValue>>> {
    pipeline::ensure_authenticated(&state, &ctx)?;
    let artifact = state.artifact.current().await;
    let plan = entity_plan(&artifact, &entity)?;
    let id = parse_row_id(&id)?;

    let tx = state.db.begin(ctx.user_id).await?;
    // Snapshot the row and evaluate delete rules while it still exists.
    let row = crud::fetch_row(&tx, &artifact, plan, id)
        .await?
        .ok_or_else(ApiError::not_found)?;
    if let Err(violation) =
        pipeline::check_rules(&tx, &artifact, &plan.name, Operation::Delete, id).await
    {
        tx.rollback().await?;
        return Err(violation);
    }
    if !crud::delete_row(&tx, plan, id).await? {
        tx.rollback().await?;
        return Err(ApiError::not_found());
    }
    let mutation = Mutation {
        entity: plan.name.clone(),
        operation: Operation::Delete,
        row_id: id,
        row,
    };
    pipeline::finish(&state, &artifact, &ctx, tx, vec![mutation]).await?;

    Ok(Json(Envelope::ok(json!({ "deleted": true }))))
}
