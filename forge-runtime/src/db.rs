//! Database Connection Pool Module
//!
//! PostgreSQL pooling via deadpool-postgres plus the request
//! transaction wrapper. Every request runs on one pooled connection
//! inside an explicit transaction; `SET LOCAL app.user_id` binds the
//! authenticated identity for the row-level security policies, the
//! sole bridge between application identity and storage enforcement.
//!
//! A transaction that is neither committed nor rolled back by the time
//! the wrapper drops is rolled back asynchronously, so no exit path
//! (error, panic, cancellation) leaks an open transaction into the
//! pool.

use crate::config::DatabaseSettings;
use crate::error::{ApiError, ApiResult};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use std::str::FromStr;
use tokio_postgres::NoTls;
use uuid::Uuid;

// ============================================================================
// CLIENT
// ============================================================================

/// Database client wrapping the connection pool.
#[derive(Clone)]
pub struct DbClient {
    pool: Pool,
}

impl DbClient {
    /// Build a pool from the database settings.
    pub fn connect(settings: &DatabaseSettings) -> ApiResult<Self> {
        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| ApiError::internal("database.url is not configured"))?;
        let pg_config = tokio_postgres::Config::from_str(url)
            .map_err(|e| ApiError::internal(format!("invalid database url: {}", e)))?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(settings.pool_size)
            .build()
            .map_err(|e| ApiError::internal(format!("failed to build pool: {}", e)))?;

        Ok(Self { pool })
    }

    /// Check out a connection.
    pub async fn get_conn(&self) -> ApiResult<Object> {
        Ok(self.pool.get().await?)
    }

    /// Liveness probe for the readiness endpoint.
    pub async fn ping(&self) -> ApiResult<()> {
        let conn = self.get_conn().await?;
        conn.simple_query("SELECT 1").await?;
        Ok(())
    }

    /// Begin a request transaction, binding the user identity for RLS.
    pub async fn begin(&self, user_id: Option<Uuid>) -> ApiResult<RequestTx> {
        let conn = self.get_conn().await?;
        conn.batch_execute("BEGIN").await?;
        if let Some(user_id) = user_id {
            conn.execute(
                "SELECT set_config('app.user_id', $1, true)",
                &[&user_id.to_string()],
            )
            .await?;
        }
        Ok(RequestTx {
            conn: Some(conn),
            finished: false,
        })
    }

    /// Run a list of DDL statements in one transaction (migrator).
    pub async fn execute_batch(&self, statements: &[String]) -> ApiResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute("BEGIN").await?;
        for statement in statements {
            if let Err(e) = conn.batch_execute(statement).await {
                let _ = conn.batch_execute("ROLLBACK").await;
                tracing::error!(statement, error = %e, "DDL statement failed");
                return Err(e.into());
            }
        }
        conn.batch_execute("COMMIT").await?;
        Ok(())
    }
}

// ============================================================================
// REQUEST TRANSACTION
// ============================================================================

/// One request's transaction, confined to one pooled connection.
pub struct RequestTx {
    conn: Option<Object>,
    finished: bool,
}

impl RequestTx {
    /// The underlying connection; all statements in this request run
    /// through it.
    pub fn client(&self) -> &Object {
        self.conn
            .as_ref()
            .expect("transaction connection taken before finish")
    }

    pub async fn commit(mut self) -> ApiResult<()> {
        let conn = self.conn.take().expect("double finish");
        self.finished = true;
        conn.batch_execute("COMMIT").await?;
        Ok(())
    }

    pub async fn rollback(mut self) -> ApiResult<()> {
        let conn = self.conn.take().expect("double finish");
        self.finished = true;
        conn.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

impl Drop for RequestTx {
    fn drop(&mut self) {
        // An early return, error or panic lands here with the
        // transaction still open; roll it back before the connection
        // re-enters the pool.
        if let Some(conn) = self.conn.take() {
            tokio::spawn(async move {
                if let Err(e) = conn.batch_execute("ROLLBACK").await {
                    tracing::warn!(error = %e, "rollback on drop failed");
                }
            });
        }
    }
}
