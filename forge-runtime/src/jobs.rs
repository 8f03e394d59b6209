//! Job Executor
//!
//! In-process worker pool over one bounded channel: many producers
//! (request handlers enqueueing post-commit), a fixed set of consumers.
//! State machine per job: Enqueued → Running → {Succeeded, Retrying,
//! Failed}. A provider failure retries after quadratic backoff
//! (attempt² seconds) up to the declared attempt budget, then the job
//! is recorded as failed and dropped. Enqueue never blocks the request
//! path: a full or stopped queue is an immediate error the hook layer
//! logs and ignores.

use crate::crud;
use crate::db::DbClient;
use crate::error::{ApiError, ApiResult};
use crate::providers::{ProviderContext, ProviderRegistry, DEFAULT_CALL_DEADLINE};
use crate::state::ArtifactStore;
use crate::ws::SubscriptionHub;
use chrono::Utc;
use forge_core::{Artifact, Cardinality, CreateSpec, FieldMapping, JobPlan, Literal, Operation};
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One queued job execution.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job: String,
    /// Identity the job runs under (the user whose request enqueued it).
    pub user_id: Option<Uuid>,
    /// Snapshot of the triggering row.
    pub input: JsonValue,
}

/// Everything a worker needs; deliberately not the full AppState so the
/// executor has no reference cycle back into the server.
pub struct JobEnv {
    pub db: DbClient,
    pub providers: Arc<ProviderRegistry>,
    pub artifact: ArtifactStore,
    pub hub: Arc<SubscriptionHub>,
}

struct ExecutorInner {
    /// Taken (dropped) at shutdown; a closed channel is how the
    /// workers learn to drain and exit.
    tx: std::sync::Mutex<Option<mpsc::Sender<JobRequest>>>,
    accepting: AtomicBool,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle on the worker pool.
#[derive(Clone)]
pub struct JobExecutor {
    inner: Arc<ExecutorInner>,
}

impl JobExecutor {
    /// Spawn the worker pool.
    pub fn start(workers: usize, queue_capacity: usize, env: JobEnv) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let env = Arc::new(env);

        let mut handles = Vec::with_capacity(workers.max(1));
        for worker_id in 0..workers.max(1) {
            let rx = rx.clone();
            let env = env.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, rx, env).await;
            }));
        }

        Self {
            inner: Arc::new(ExecutorInner {
                tx: std::sync::Mutex::new(Some(tx)),
                accepting: AtomicBool::new(true),
                workers: std::sync::Mutex::new(handles),
            }),
        }
    }

    /// Enqueue a job. Never blocks; a full or stopped queue errors
    /// immediately.
    pub fn enqueue(&self, request: JobRequest) -> ApiResult<()> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(ApiError::queue_full());
        }
        let guard = self.inner.tx.lock().expect("sender poisoned");
        match guard.as_ref() {
            Some(tx) => tx.try_send(request).map_err(|_| ApiError::queue_full()),
            None => Err(ApiError::queue_full()),
        }
    }

    /// Whether the queue accepts work (readiness probe).
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting, close the channel and drain outstanding jobs up
    /// to the deadline. Dropping the sender closes the channel: each
    /// worker finishes its current job, drains what is queued and
    /// exits on the closed receive.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.tx.lock().expect("sender poisoned").take();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.inner.workers.lock().expect("worker list poisoned");
            workers.drain(..).collect()
        };
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("job executor drain exceeded the grace period");
        }
        info!("job executor stopped");
    }
}

async fn worker_loop(worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<JobRequest>>>, env: Arc<JobEnv>) {
    loop {
        let request = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        match request {
            Some(request) => run_job(worker_id, &env, request).await,
            None => break,
        }
    }
    debug!(worker_id, "worker exited");
}

/// Run one job through its retry budget.
async fn run_job(worker_id: usize, env: &JobEnv, request: JobRequest) {
    let artifact = env.artifact.current().await;
    let Some(plan) = artifact.jobs.get(&request.job) else {
        warn!(job = %request.job, "unknown job dropped");
        return;
    };

    for attempt in 1..=plan.max_attempts {
        debug!(worker_id, job = %request.job, attempt, "job running");
        match execute(env, &artifact, plan, &request).await {
            Ok(()) => {
                info!(job = %request.job, attempt, "job succeeded");
                return;
            }
            Err(e) if attempt < plan.max_attempts => {
                let backoff = Duration::from_secs(u64::from(attempt) * u64::from(attempt));
                warn!(
                    job = %request.job,
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    error = %e,
                    "job failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                error!(
                    job = %request.job,
                    attempts = plan.max_attempts,
                    error = %e,
                    "job exhausted its retry budget, dropping"
                );
                return;
            }
        }
    }
}

/// One execution attempt: prefetch, then each declared effect in order.
/// Only declared effects ever run; the capability set at runtime is
/// exactly the declared set.
async fn execute(
    env: &JobEnv,
    artifact: &Artifact,
    plan: &JobPlan,
    request: &JobRequest,
) -> ApiResult<()> {
    let needs = prefetch_needs(env, artifact, plan, request).await?;
    let payload = json!({
        "job": plan.name,
        "input": request.input,
        "needs": needs,
    });

    for effect in &plan.effects {
        if effect == "entity.create" {
            let Some(creates) = &plan.creates else {
                return Err(ApiError::internal(format!(
                    "job '{}' declares entity.create without a creates block",
                    plan.name
                )));
            };
            create_entity(env, artifact, plan, creates, request).await?;
            continue;
        }
        let provider = env.providers.get(effect)?;
        let ctx = ProviderContext {
            job: plan.name.clone(),
            user_id: request.user_id,
            deadline: DEFAULT_CALL_DEADLINE,
        };
        provider.call(&ctx, &payload).await?;
    }
    Ok(())
}

/// Resolve the `needs` pre-fetch: one query per relation path, under
/// the enqueuing user's identity.
async fn prefetch_needs(
    env: &JobEnv,
    artifact: &Artifact,
    plan: &JobPlan,
    request: &JobRequest,
) -> ApiResult<JsonValue> {
    if plan.needs.is_empty() {
        return Ok(json!({}));
    }

    let tx = env.db.begin(request.user_id).await?;
    let mut needs = serde_json::Map::new();
    for path in &plan.needs {
        let rows = fetch_relation_path(&tx, artifact, &plan.input, path, &request.input).await?;
        needs.insert(path.join("."), JsonValue::Array(rows));
    }
    tx.commit().await?;
    Ok(JsonValue::Object(needs))
}

/// Walk one relation path from the input row and return the terminal
/// entity's rows.
async fn fetch_relation_path(
    tx: &crate::db::RequestTx,
    artifact: &Artifact,
    input_entity: &str,
    path: &[String],
    input: &JsonValue,
) -> ApiResult<Vec<JsonValue>> {
    let mut entity = input_entity.to_string();
    let mut from = String::new();
    let mut root_cond = String::new();
    let mut root_bind: Option<String> = None;
    let mut prev_alias: Option<String> = None;

    for (i, segment) in path.iter().enumerate() {
        let rel = artifact
            .relation(&entity, segment)
            .ok_or_else(|| ApiError::internal(format!("unknown relation '{}.{}'", entity, segment)))?;
        let target = artifact
            .entity(&rel.target)
            .ok_or_else(|| ApiError::internal(format!("unknown entity '{}'", rel.target)))?;
        let alias = format!("m{}", i + 1);
        let fk = rel
            .fk_column
            .clone()
            .ok_or_else(|| ApiError::internal("relation without fk column"))?;

        let cond = match rel.cardinality {
            Cardinality::One => match &prev_alias {
                Some(p) => format!("{}.id = {}.{}", alias, p, fk),
                None => {
                    // Root join value comes from the input snapshot.
                    root_bind = Some(
                        input
                            .get(&fk)
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    );
                    format!("{}.id = CAST($1 AS uuid)", alias)
                }
            },
            Cardinality::Many => match &prev_alias {
                Some(p) => format!("{}.{} = {}.id", alias, fk, p),
                None => {
                    root_bind = Some(
                        input
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    );
                    format!("{}.{} = CAST($1 AS uuid)", alias, fk)
                }
            },
        };

        if i == 0 {
            from = format!("{} {}", target.table, alias);
            root_cond = cond;
        } else {
            from.push_str(&format!(" JOIN {} {} ON {}", target.table, alias, cond));
        }
        prev_alias = Some(alias);
        entity = rel.target.clone();
    }

    let Some(root_bind) = root_bind.filter(|v| !v.is_empty()) else {
        // Nullable fk with no value: nothing to fetch.
        return Ok(Vec::new());
    };
    let last = prev_alias.expect("path is never empty");

    let target_plan = artifact
        .entity(&entity)
        .ok_or_else(|| ApiError::internal(format!("unknown entity '{}'", entity)))?;
    let columns = crud::bindable_columns(artifact, target_plan);
    let sql = format!(
        "SELECT {} FROM {} WHERE id IN (SELECT {}.id FROM {} WHERE {})",
        crud::select_list(&columns),
        target_plan.table,
        last,
        from,
        root_cond
    );

    let bind = Some(root_bind);
    let rows = tx
        .client()
        .query(&sql, &[&bind])
        .await
        .map_err(crud::map_db_error)?;
    rows.iter()
        .map(|row| crud::row_to_json(&columns, row))
        .collect()
}

/// The built-in `entity.create` capability: evaluate the field
/// mappings and insert under the same RLS discipline as any request.
async fn create_entity(
    env: &JobEnv,
    artifact: &Artifact,
    plan: &JobPlan,
    creates: &CreateSpec,
    request: &JobRequest,
) -> ApiResult<()> {
    let entity = artifact
        .entity(&creates.entity)
        .ok_or_else(|| ApiError::internal(format!("unknown entity '{}'", creates.entity)))?;

    let mut body = serde_json::Map::new();
    for (field, mapping) in &creates.mappings {
        let value = match mapping {
            FieldMapping::Literal { value } => literal_to_json(value),
            FieldMapping::InputField { field } => {
                request.input.get(field).cloned().unwrap_or(JsonValue::Null)
            }
            FieldMapping::Now => json!(Utc::now().to_rfc3339()),
        };
        body.insert(field.clone(), value);
    }

    let tx = env.db.begin(request.user_id).await?;
    let row = crud::insert_row(&tx, artifact, entity, &JsonValue::Object(body)).await?;
    let row_id = row
        .get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| ApiError::internal("insert returned no id"))?;
    crate::pipeline::record_event(&tx, &entity.table, row_id, Operation::Create).await?;
    tx.commit().await?;

    debug!(job = %plan.name, entity = %creates.entity, "entity.create inserted");
    env.hub.broadcast_tables(artifact, [entity.table.as_str()]);
    Ok(())
}

fn literal_to_json(literal: &Literal) -> JsonValue {
    match literal {
        Literal::String(s) => json!(s),
        Literal::Number(n) => {
            if n.fract() == 0.0 {
                json!(*n as i64)
            } else {
                json!(n)
            }
        }
        Literal::Bool(b) => json!(b),
        Literal::Null => JsonValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_mapping_values() {
        assert_eq!(literal_to_json(&Literal::String("x".to_string())), json!("x"));
        assert_eq!(literal_to_json(&Literal::Number(3.0)), json!(3));
        assert_eq!(literal_to_json(&Literal::Number(2.5)), json!(2.5));
        assert_eq!(literal_to_json(&Literal::Bool(true)), json!(true));
        assert_eq!(literal_to_json(&Literal::Null), JsonValue::Null);
    }

    #[test]
    fn test_backoff_is_quadratic() {
        // attempt² seconds: 1, 4, 9 …
        let backoffs: Vec<u64> = (1u32..=3)
            .map(|attempt| u64::from(attempt) * u64::from(attempt))
            .collect();
        assert_eq!(backoffs, vec![1, 4, 9]);
    }
}
