//! Password-provider auth surface
//!
//! Mounted only when `auth.provider = "password"`: registration, login,
//! refresh, logout, current-user and password change. Accounts live in
//! the application's own `User` entity, which must declare `email`
//! (unique) and `password_hash` columns; the hash never leaves the
//! server; responses are scrubbed.
//!
//! Registration is the one place a row is written before its owner
//! exists: the new id is minted first and bound as the session identity
//! so a self-referential write policy admits its own insert.

use crate::auth::AuthContext;
use crate::crud;
use crate::envelope::Envelope;
use crate::error::{ApiError, ApiResult};
use crate::pipeline::{self, Mutation};
use crate::state::AppState;
use axum::{extract::State, routing::get, routing::post, Json, Router};
use forge_core::{Artifact, EntityPlan, Operation};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/password", post(change_password))
}

fn user_entity(artifact: &Artifact) -> ApiResult<&EntityPlan> {
    let plan = artifact.entity("User").ok_or_else(|| {
        ApiError::internal("the password provider requires a 'User' entity")
    })?;
    for required in ["email", "password_hash"] {
        if plan.column(required).is_none() {
            return Err(ApiError::internal(format!(
                "the password provider requires 'User.{}'",
                required
            )));
        }
    }
    Ok(plan)
}

fn scrub(mut row: JsonValue) -> JsonValue {
    if let Some(object) = row.as_object_mut() {
        object.remove("password_hash");
    }
    row
}

#[derive(Deserialize)]
struct RegisterBody {
    email: String,
    password: String,
    #[serde(flatten)]
    extra: serde_json::Map<String, JsonValue>,
}

/// `POST /auth/register`
async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<Json<Envelope<JsonValue>>> {
    if body.password.len() < 8 {
        return Err(ApiError::invalid_input(
            "Password must be at least 8 characters",
        ));
    }
    let artifact = state.artifact.current().await;
    let plan = user_entity(&artifact)?;

    let mut fields = body.extra.clone();
    fields.remove("password_hash");
    fields.insert("email".to_string(), json!(body.email));
    fields.insert(
        "password_hash".to_string(),
        json!(state.auth.hash_password(&body.password)?),
    );

    let user_id = Uuid::now_v7();
    let ctx = AuthContext::user(user_id);
    let tx = state.db.begin(Some(user_id)).await?;
    let row =
        crud::insert_row_with_id(&tx, &artifact, plan, user_id, &JsonValue::Object(fields)).await?;
    let mutation = Mutation {
        entity: plan.name.clone(),
        operation: Operation::Create,
        row_id: user_id,
        row: row.clone(),
    };
    pipeline::finish(&state, &artifact, &ctx, tx, vec![mutation]).await?;

    Ok(Json(Envelope::ok(json!({
        "access_token": state.auth.issue_access(user_id)?,
        "refresh_token": state.auth.issue_refresh(user_id)?,
        "user": scrub(row),
    }))))
}

#[derive(Deserialize)]
struct LoginBody {
    email: String,
    password: String,
}

/// `POST /auth/login`
async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> ApiResult<Json<Envelope<JsonValue>>> {
    let artifact = state.artifact.current().await;
    let plan = user_entity(&artifact)?;

    let tx = state.db.begin(None).await?;
    let sql = format!(
        "SELECT id, password_hash FROM {} WHERE email = $1",
        plan.table
    );
    let rows = tx
        .client()
        .query(&sql, &[&body.email])
        .await
        .map_err(crud::map_db_error)?;
    let Some(found) = rows.first() else {
        tx.commit().await?;
        // Same response as a wrong password; no account disclosure.
        return Err(ApiError::auth_invalid("Invalid email or password"));
    };
    let user_id: Uuid = found.try_get("id").map_err(ApiError::from)?;
    let hash: Option<String> = found.try_get("password_hash").map_err(ApiError::from)?;

    let user = crud::fetch_row(&tx, &artifact, plan, user_id).await?;
    tx.commit().await?;

    let verified = match &hash {
        Some(hash) => state.auth.verify_password(&body.password, hash)?,
        None => false,
    };
    if !verified {
        return Err(ApiError::auth_invalid("Invalid email or password"));
    }

    Ok(Json(Envelope::ok(json!({
        "access_token": state.auth.issue_access(user_id)?,
        "refresh_token": state.auth.issue_refresh(user_id)?,
        "user": user.map(scrub),
    }))))
}

#[derive(Deserialize)]
struct RefreshBody {
    refresh_token: String,
}

/// `POST /auth/refresh`
async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshBody>,
) -> ApiResult<Json<Envelope<JsonValue>>> {
    let user_id = state.auth.verify_refresh(&body.refresh_token)?;
    Ok(Json(Envelope::ok(json!({
        "access_token": state.auth.issue_access(user_id)?,
        "refresh_token": state.auth.issue_refresh(user_id)?,
    }))))
}

/// `POST /auth/logout`: tokens are stateless; the contract is that
/// the client discards them.
async fn logout(
    State(state): State<AppState>,
    ctx: AuthContext,
) -> ApiResult<Json<Envelope<JsonValue>>> {
    pipeline::ensure_authenticated(&state, &ctx)?;
    Ok(Json(Envelope::ok(json!({ "logged_out": true }))))
}

/// `GET /auth/me`
async fn me(
    State(state): State<AppState>,
    ctx: AuthContext,
) -> ApiResult<Json<Envelope<JsonValue>>> {
    pipeline::ensure_authenticated(&state, &ctx)?;
    let user_id = ctx.user_id.ok_or_else(ApiError::auth_required)?;
    let artifact = state.artifact.current().await;
    let plan = user_entity(&artifact)?;

    let tx = state.db.begin(Some(user_id)).await?;
    let row = crud::fetch_row(&tx, &artifact, plan, user_id).await?;
    tx.commit().await?;

    row.map(|row| Json(Envelope::ok(scrub(row))))
        .ok_or_else(ApiError::not_found)
}

#[derive(Deserialize)]
struct ChangePasswordBody {
    current_password: String,
    new_password: String,
}

/// `POST /auth/password`
async fn change_password(
    State(state): State<AppState>,
    ctx: AuthContext,
    Json(body): Json<ChangePasswordBody>,
) -> ApiResult<Json<Envelope<JsonValue>>> {
    pipeline::ensure_authenticated(&state, &ctx)?;
    let user_id = ctx.user_id.ok_or_else(ApiError::auth_required)?;
    if body.new_password.len() < 8 {
        return Err(ApiError::invalid_input(
            "Password must be at least 8 characters",
        ));
    }
    let artifact = state.artifact.current().await;
    let plan = user_entity(&artifact)?;

    let tx = state.db.begin(Some(user_id)).await?;
    let sql = format!(
        "SELECT password_hash FROM {} WHERE id = CAST($1 AS uuid)",
        plan.table
    );
    let bind = Some(user_id.to_string());
    let rows = tx
        .client()
        .query(&sql, &[&bind])
        .await
        .map_err(crud::map_db_error)?;
    let current_hash: Option<String> = rows
        .first()
        .ok_or_else(ApiError::not_found)?
        .try_get("password_hash")
        .map_err(ApiError::from)?;

    let verified = match &current_hash {
        Some(hash) => state.auth.verify_password(&body.current_password, hash)?,
        None => false,
    };
    if !verified {
        return Err(ApiError::auth_invalid("Current password is incorrect"));
    }

    let patch = json!({ "password_hash": state.auth.hash_password(&body.new_password)? });
    let row = crud::update_row(&tx, &artifact, plan, user_id, &patch)
        .await?
        .ok_or_else(ApiError::not_found)?;
    let mutation = Mutation {
        entity: plan.name.clone(),
        operation: Operation::Update,
        row_id: user_id,
        row,
    };
    pipeline::finish(&state, &artifact, &ctx, tx, vec![mutation]).await?;

    Ok(Json(Envelope::ok(json!({ "changed": true }))))
}
