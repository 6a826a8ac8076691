//! Adapter and session interfaces.
//!
//! An [`Adapter`] is a per-dialect factory that opens [`Session`]s. A session
//! is one live network session: it introspects the database structure and runs
//! ad-hoc SQL, always bounded by a [`Deadline`].

use crate::db::{mysql::MySqlAdapter, postgres::PostgresAdapter, sqlite::SqliteAdapter};
use crate::error::{DbError, DbResult};
use crate::models::{Dialect, StructuralFact, TabularResult, parse_connection_url};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Time budget and optional caller cancellation for one operation.
#[derive(Debug, Clone)]
pub struct Deadline {
    timeout: Duration,
    cancel: Option<CancellationToken>,
}

impl Deadline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: Option<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// Run `fut` within the deadline.
    ///
    /// Expiry yields `DbError::Timeout`, cancellation yields `DbError::Cancelled`.
    /// Either way `fut` is dropped before this returns.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        let timed = tokio::time::timeout(self.timeout, fut);
        let outcome = match &self.cancel {
            Some(cancel) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DbError::cancelled(operation)),
                    outcome = timed => outcome,
                }
            }
            None => timed.await,
        };
        outcome.map_err(|_| DbError::timeout(operation, self.timeout))?
    }
}

/// Factory for sessions of one dialect.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    fn dialect(&self) -> Dialect;

    /// Open a new session. Failures are `DbError::Connection`.
    async fn connect(&self, url: &str, connect_timeout: Duration) -> DbResult<Box<dyn Session>>;
}

/// One live database session. Never shared between concurrent operations.
#[async_trait]
pub trait Session: Send + 'static {
    fn dialect(&self) -> Dialect;

    /// Describe schemas, tables, views, columns, indexes and foreign keys.
    async fn introspect(&mut self, deadline: &Deadline) -> DbResult<Vec<StructuralFact>>;

    /// Run `sql` verbatim, returning at most `max_rows` rows.
    ///
    /// On timeout or cancellation the statement is cancelled server-side where
    /// the protocol allows it and the session is marked broken.
    async fn execute(
        &mut self,
        sql: &str,
        deadline: &Deadline,
        max_rows: usize,
    ) -> DbResult<TabularResult>;

    /// Cheap liveness check.
    async fn ping(&mut self) -> DbResult<()>;

    /// True once the session must not be reused.
    fn is_broken(&self) -> bool;

    async fn close(self: Box<Self>);
}

/// Dialect to adapter mapping.
#[derive(Clone)]
pub struct AdapterSet {
    adapters: HashMap<Dialect, Arc<dyn Adapter>>,
}

impl AdapterSet {
    /// An empty set. Every dialect must be registered explicitly.
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Postgres, MySQL and SQLite adapters backed by sqlx.
    pub fn with_defaults() -> Self {
        Self::empty()
            .with(Arc::new(PostgresAdapter))
            .with(Arc::new(MySqlAdapter))
            .with(Arc::new(SqliteAdapter))
    }

    /// Register (or replace) the adapter for its dialect.
    pub fn with(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.dialect(), adapter);
    }

    pub fn get(&self, dialect: Dialect) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(&dialect).cloned()
    }

    /// Select the adapter for a connection URL by its scheme.
    pub fn for_url(&self, url: &str) -> DbResult<Arc<dyn Adapter>> {
        let dialect = parse_connection_url(url)?;
        self.get(dialect).ok_or_else(|| {
            DbError::invalid_url(format!("no adapter registered for {}", dialect))
        })
    }
}

impl Default for AdapterSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSet")
            .field("dialects", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_passes_result_through() {
        let deadline = Deadline::new(Duration::from_secs(1));
        let value = deadline.run("op", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);

        let err = deadline
            .run::<(), _>("op", async { Err(DbError::invalid_input("bad")) })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_deadline_times_out() {
        let deadline = Deadline::new(Duration::from_millis(20));
        let err = deadline
            .run("slow query", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Timeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn test_deadline_cancelled() {
        let token = CancellationToken::new();
        let deadline = Deadline::new(Duration::from_secs(5)).with_cancel(Some(token.clone()));
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            })
        };
        let err = deadline
            .run("slow query", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, DbError::Cancelled { .. }));
        assert!(deadline.is_cancelled());
    }

    #[test]
    fn test_adapter_set_selects_by_scheme() {
        let adapters = AdapterSet::with_defaults();
        assert_eq!(
            adapters.for_url("postgresql://localhost/db").unwrap().dialect(),
            Dialect::Postgres
        );
        assert_eq!(
            adapters.for_url("mariadb://localhost/db").unwrap().dialect(),
            Dialect::MySql
        );
        assert_eq!(
            adapters.for_url("sqlite::memory:").unwrap().dialect(),
            Dialect::Sqlite
        );
        assert!(matches!(
            adapters.for_url("redis://localhost"),
            Err(DbError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_empty_adapter_set_rejects_urls() {
        let adapters = AdapterSet::empty();
        assert!(matches!(
            adapters.for_url("sqlite::memory:"),
            Err(DbError::InvalidUrl { .. })
        ));
    }
}
