//! Execution-related data models.
//!
//! This module defines query requests, normalized tabular results and the
//! append-only execution audit record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a query execution.
///
/// `Pending -> Running -> {Succeeded | Failed | TimedOut | Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states are the only ones that get recorded.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one execution attempt. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub connection_id: String,
    pub query_text: String,
    /// Coarse classification, e.g. `SELECT` or `CREATE TABLE`
    pub statement_kind: Option<String>,
    pub status: ExecutionStatus,
    /// Set only when succeeded
    pub row_count: Option<u64>,
    pub rows_affected: Option<u64>,
    pub duration_ms: u64,
    /// Set only when not succeeded
    pub error_detail: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn succeeded(
        connection_id: &str,
        query_text: &str,
        statement_kind: Option<String>,
        result: &QueryResult,
        executed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            query_text: query_text.to_string(),
            statement_kind,
            status: ExecutionStatus::Succeeded,
            row_count: Some(result.row_count as u64),
            rows_affected: result.rows_affected,
            duration_ms: result.duration_ms,
            error_detail: None,
            executed_at,
        }
    }

    pub fn unsuccessful(
        connection_id: &str,
        query_text: &str,
        statement_kind: Option<String>,
        status: ExecutionStatus,
        error_detail: String,
        duration_ms: u64,
        executed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            query_text: query_text.to_string(),
            statement_kind,
            status,
            row_count: None,
            rows_affected: None,
            duration_ms,
            error_detail: Some(error_detail),
            executed_at,
        }
    }
}

/// A normalized cell value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Rows as produced by a session, before timing is attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TabularResult {
    pub columns: Vec<String>,
    /// Native type name per column
    pub column_types: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    pub rows_affected: Option<u64>,
    /// More rows were available than the row cap allowed
    pub truncated: bool,
}

/// Result of a successful execution, returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub column_types: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub truncated: bool,
    pub duration_ms: u64,
}

impl QueryResult {
    pub fn from_tabular(result: TabularResult, duration: Duration) -> Self {
        Self {
            row_count: result.rows.len(),
            columns: result.columns,
            column_types: result.column_types,
            rows: result.rows,
            rows_affected: result.rows_affected,
            truncated: result.truncated,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Request to execute SQL against a registered connection.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub sql: String,
    /// Defaults to the configured query timeout; capped at the configured maximum
    pub timeout: Option<Duration>,
    /// Cancelling the token aborts the execution
    pub cancel: Option<CancellationToken>,
}

impl ExecuteRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            timeout: None,
            cancel: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Get the effective timeout (with bounds checking).
    pub fn effective_timeout(&self, default: Duration, max: Duration) -> Duration {
        self.timeout.unwrap_or(default).min(max)
    }
}
