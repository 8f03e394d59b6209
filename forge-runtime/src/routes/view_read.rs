//! View read handler
//!
//! `GET /api/views/{name}` with the query surface of §view engine:
//! `filter[field]`, `filter[field][op]`, `sort`, `limit`, `cursor`,
//! `param.*`, `include=count`.

use crate::auth::AuthContext;
use crate::envelope::{Envelope, Page};
use crate::error::ApiResult;
use crate::pipeline;
use crate::state::AppState;
use crate::views::{execute_view, ViewQuery};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::collections::HashMap;

/// `GET /api/views/{name}`
pub async fn read(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path(name): Path<String>,
    Query(raw): Query<HashMap<String, String>>,
) -> ApiResult<Json<Envelope<Page>>> {
    pipeline::ensure_authenticated(&state, &ctx)?;
    let artifact = state.artifact.current().await;
    let query = ViewQuery::parse(&raw)?;
    let page = execute_view(&state, &artifact, &name, query, &ctx).await?;
    Ok(Json(Envelope::ok(page)))
}
