//! Query execution engine.
//!
//! Runs caller-supplied SQL against a resolved connection and writes exactly
//! one execution record per attempt, whatever the outcome, before returning.
//!
//! # Lifecycle
//!
//! `Pending -> Running -> {Succeeded | Failed | TimedOut | Cancelled}`. Only the
//! terminal state is recorded.

use crate::config::Config;
use crate::db::{Deadline, PoolManager};
use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionDescriptor, ExecuteRequest, ExecutionRecord, ExecutionStatus, QueryResult,
};
use crate::sql_validator;
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Terminal status for a failed attempt.
pub fn status_for_error(err: &DbError) -> ExecutionStatus {
    match err {
        DbError::Timeout { .. } => ExecutionStatus::TimedOut,
        DbError::Cancelled { .. } => ExecutionStatus::Cancelled,
        _ => ExecutionStatus::Failed,
    }
}

pub struct QueryExecutor {
    store: Arc<dyn Store>,
    pools: Arc<PoolManager>,
    default_timeout: Duration,
    max_timeout: Duration,
    max_rows: usize,
    read_only: bool,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn Store>, pools: Arc<PoolManager>, config: &Config) -> Self {
        Self {
            store,
            pools,
            default_timeout: config.query_timeout_duration(),
            max_timeout: config.max_query_timeout_duration(),
            max_rows: config.max_rows,
            read_only: config.read_only,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Execute `request` against `descriptor` and record the outcome.
    ///
    /// The record is written before the result or error is returned. If the
    /// record cannot be written, the storage error is returned instead.
    pub async fn run(
        &self,
        descriptor: &ConnectionDescriptor,
        request: ExecuteRequest,
    ) -> DbResult<QueryResult> {
        let executed_at = Utc::now();
        let started = Instant::now();
        let statement_kind = sql_validator::statement_kind(&request.sql, descriptor.dialect);

        debug!(
            connection_id = %descriptor.id,
            status = %ExecutionStatus::Pending,
            statement_kind = ?statement_kind,
            "Execution requested"
        );

        let outcome = self.attempt(descriptor, &request).await;

        let record = match &outcome {
            Ok(result) => ExecutionRecord::succeeded(
                &descriptor.id,
                &request.sql,
                statement_kind,
                result,
                executed_at,
            ),
            Err(e) => ExecutionRecord::unsuccessful(
                &descriptor.id,
                &request.sql,
                statement_kind,
                status_for_error(e),
                e.to_string(),
                started.elapsed().as_millis() as u64,
                executed_at,
            ),
        };

        info!(
            connection_id = %descriptor.id,
            status = %record.status,
            duration_ms = record.duration_ms,
            row_count = ?record.row_count,
            "Execution finished"
        );

        if let Err(e) = self.store.append_execution(&record).await {
            warn!(
                connection_id = %descriptor.id,
                execution_id = %record.id,
                error = %e,
                "Failed to record execution"
            );
            if matches!(e, DbError::NotFound { .. }) {
                self.pools.evict(&descriptor.id).await;
            }
            return Err(e);
        }

        outcome
    }

    async fn attempt(
        &self,
        descriptor: &ConnectionDescriptor,
        request: &ExecuteRequest,
    ) -> DbResult<QueryResult> {
        if request.sql.trim().is_empty() {
            return Err(DbError::invalid_input("Query text cannot be empty"));
        }
        if self.read_only {
            sql_validator::validate_read_only(&request.sql, descriptor.dialect)?;
        }

        let timeout = request.effective_timeout(self.default_timeout, self.max_timeout);
        let deadline = Deadline::new(timeout).with_cancel(request.cancel.clone());
        if deadline.is_cancelled() {
            return Err(DbError::cancelled("query"));
        }

        let started = Instant::now();
        let mut handle = self.pools.checkout(descriptor).await?;

        debug!(
            connection_id = %descriptor.id,
            status = %ExecutionStatus::Running,
            sql = %request.sql,
            timeout_ms = timeout.as_millis() as u64,
            max_rows = self.max_rows,
            "Executing query"
        );

        let outcome = handle
            .session()
            .execute(&request.sql, &deadline, self.max_rows)
            .await;
        // A session broken by the failure is closed here instead of pooled
        handle.release().await;

        let tabular = outcome?;
        Ok(QueryResult::from_tabular(tabular, started.elapsed()))
    }
}
