//! Request Pipeline
//!
//! The enforcement path every mutating request flows through:
//!
//! 1. authenticate (bearer → identity or anonymous)
//! 2. admit (404 unknown route, 401 missing auth)
//! 3. open transaction + `SET LOCAL app.user_id`
//! 4. authorize (storage policies; explicit check at action entry)
//! 5. dispatch (handler mutates rows inside the transaction)
//! 6. evaluate rules (violation → rollback + 422 with the message code)
//! 7. commit or rollback
//! 8. post-commit hooks (fire-and-forget job enqueue)
//! 9. broadcast invalidations
//! 10. respond with the envelope
//!
//! Steps 1–2 live in the extractor and router; this module carries the
//! per-request context plus steps 6–9, which every mutating handler
//! finishes with.

use crate::auth::{bearer_token, AuthContext};
use crate::db::RequestTx;
use crate::error::{ApiError, ApiResult};
use crate::jobs::JobRequest;
use crate::state::AppState;
use axum::{
    extract::{FromRequestParts, Request},
    http::{request::Parts, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use forge_core::{Artifact, Operation, RuleKind};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

// ============================================================================
// AUTH EXTRACTION
// ============================================================================

#[async_trait::async_trait]
impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = bearer_token(&parts.headers);
        state.auth.authenticate(token.as_deref())
    }
}

/// 401 unless the request is authenticated (or the provider is `none`,
/// in which case every route is public by configuration).
pub fn ensure_authenticated(state: &AppState, ctx: &AuthContext) -> ApiResult<()> {
    if state.auth.provider_kind() == crate::config::AuthProviderKind::None {
        return Ok(());
    }
    if ctx.is_authenticated() {
        return Ok(());
    }
    Err(ApiError::auth_required())
}

// ============================================================================
// TRACE IDENTIFIER
// ============================================================================

/// Trace identifier carried through logs and echoed as a header.
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

/// Middleware assigning every request a trace id and a log span.
pub async fn trace_middleware(mut request: Request, next: Next) -> Response {
    let trace_id = format!("{:016x}", rand::random::<u64>());
    let span = info_span!(
        "request",
        trace_id = %trace_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    request.extensions_mut().insert(TraceId(trace_id.clone()));

    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert("x-trace-id", value);
    }
    response
}

/// Per-request deadline. Dropping the handler future cancels it; the
/// transaction wrapper rolls back on drop, so a timed-out request
/// releases its connection like any other exit path. WebSocket
/// upgrades are unaffected; the 101 response completes immediately
/// and the socket task runs outside this future.
pub async fn deadline_middleware(
    axum::extract::State(state): axum::extract::State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let deadline = state.config.request_deadline;
    match tokio::time::timeout(deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(deadline_secs = deadline.as_secs(), "request deadline exceeded");
            ApiError::internal("request deadline exceeded").into_response()
        }
    }
}

// ============================================================================
// MUTATIONS
// ============================================================================

/// One row mutation performed inside the request transaction.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub entity: String,
    pub operation: Operation,
    pub row_id: Uuid,
    /// Snapshot of the row (post-mutation for create/update,
    /// pre-mutation for delete); becomes the job input for hooks.
    pub row: JsonValue,
}

/// Evaluate the rules matching an (entity, operation) pair against a
/// row, in-transaction. Create/update rules run after the mutation;
/// delete rules run against the row before it goes away.
pub async fn check_rules(
    tx: &RequestTx,
    artifact: &Artifact,
    entity: &str,
    operation: Operation,
    row_id: Uuid,
) -> ApiResult<()> {
    let Some(plan) = artifact.entity(entity) else {
        return Ok(());
    };
    for rule in artifact.rules_for(entity, operation) {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} t WHERE t.id = CAST($1 AS uuid) AND ({}))",
            plan.table, rule.sql
        );
        let bind = Some(row_id.to_string());
        let row = tx.client().query_one(&sql, &[&bind]).await?;
        let holds: bool = row.try_get(0).map_err(ApiError::from)?;

        let violated = match rule.kind {
            RuleKind::ForbidIf => holds,
            RuleKind::RequireIf => !holds,
        };
        if violated {
            let text = artifact
                .messages
                .get(&rule.message)
                .map(|m| m.text.clone());
            return Err(ApiError::rule_violation(rule.message.clone(), text));
        }
    }
    Ok(())
}

/// Append one entry to the entity change log (read by nothing in the
/// request path; the broadcast layer and external consumers tail it).
pub async fn record_event(
    tx: &RequestTx,
    table: &str,
    row_id: Uuid,
    operation: Operation,
) -> ApiResult<()> {
    let op = match operation {
        Operation::Create => "create",
        Operation::Update => "update",
        Operation::Delete => "delete",
    };
    let bind = Some(row_id.to_string());
    tx.client()
        .execute(
            "INSERT INTO _forge_events (table_name, row_id, op) VALUES ($1, CAST($2 AS uuid), $3)",
            &[&table, &bind, &op],
        )
        .await?;
    Ok(())
}

// ============================================================================
// FINISH: RULES → COMMIT → HOOKS → BROADCAST
// ============================================================================

/// Close out a mutating request: evaluate rules for every recorded
/// mutation, write the change log, commit, then fire hooks and
/// invalidations. A rule violation rolls everything back and surfaces
/// as 422 carrying the rule's message code.
pub async fn finish(
    state: &AppState,
    artifact: &Artifact,
    ctx: &AuthContext,
    tx: RequestTx,
    mutations: Vec<Mutation>,
) -> ApiResult<()> {
    // Delete rules were evaluated by the handler while the row still
    // existed; create/update rules see the mutated row here.
    for mutation in &mutations {
        if mutation.operation == Operation::Delete {
            continue;
        }
        let checked = check_rules(
            &tx,
            artifact,
            &mutation.entity,
            mutation.operation,
            mutation.row_id,
        )
        .await;
        if let Err(violation) = checked {
            tx.rollback().await?;
            return Err(violation);
        }
    }

    for mutation in &mutations {
        if let Some(plan) = artifact.entity(&mutation.entity) {
            record_event(&tx, &plan.table, mutation.row_id, mutation.operation).await?;
        }
    }

    tx.commit().await?;

    // Post-commit: hooks never affect the response.
    run_hooks(state, artifact, ctx, &mutations);
    broadcast_invalidations(state, artifact, &mutations);
    Ok(())
}

/// Scan the committed mutation set against the hook table and enqueue
/// the bound jobs. Fire-and-forget: a full queue is logged, nothing
/// propagates.
pub fn run_hooks(
    state: &AppState,
    artifact: &Artifact,
    ctx: &AuthContext,
    mutations: &[Mutation],
) {
    for mutation in mutations {
        for hook in artifact.hooks_for(&mutation.entity, mutation.operation) {
            for job in &hook.jobs {
                let request = JobRequest {
                    job: job.clone(),
                    user_id: ctx.user_id,
                    input: mutation.row.clone(),
                };
                if let Err(e) = state.jobs.enqueue(request) {
                    warn!(job = %job, error = %e, "hook enqueue dropped");
                } else {
                    debug!(job = %job, entity = %mutation.entity, "hook enqueued");
                }
            }
        }
    }
}

/// Push an invalidation to every view whose dependency set contains a
/// mutated table.
pub fn broadcast_invalidations(state: &AppState, artifact: &Artifact, mutations: &[Mutation]) {
    let tables: BTreeSet<String> = mutations
        .iter()
        .filter_map(|m| artifact.entity(&m.entity).map(|e| e.table.clone()))
        .collect();
    state
        .hub
        .broadcast_tables(artifact, tables.iter().map(String::as_str));
}
