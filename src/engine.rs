//! Engine facade.
//!
//! [`Engine`] wires the registry, pool manager, metadata extractor and query
//! executor around one store. Construct it once at startup, pass it to every
//! caller, and call [`Engine::shutdown`] before exit.

use crate::config::Config;
use crate::db::{AdapterSet, PoolManager, PoolStats};
use crate::error::{DbError, DbResult};
use crate::executor::QueryExecutor;
use crate::metadata::MetadataExtractor;
use crate::models::{
    ConnectionDescriptor, ConnectionUpdate, ExecuteRequest, ExecutionRecord, IntrospectRequest,
    NewConnection, QueryResult, Snapshot,
};
use crate::registry::ConnectionRegistry;
use crate::store::Store;
use std::sync::Arc;
use tracing::info;

pub struct Engine {
    config: Config,
    store: Arc<dyn Store>,
    pools: Arc<PoolManager>,
    registry: ConnectionRegistry,
    metadata: MetadataExtractor,
    executor: QueryExecutor,
}

impl Engine {
    /// Build an engine with the Postgres, MySQL and SQLite adapters.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn Store>, config: Config) -> DbResult<Self> {
        Self::with_adapters(store, config, AdapterSet::with_defaults())
    }

    /// Build an engine with a custom adapter set.
    pub fn with_adapters(
        store: Arc<dyn Store>,
        config: Config,
        adapters: AdapterSet,
    ) -> DbResult<Self> {
        config.validate().map_err(DbError::invalid_input)?;

        let pools = PoolManager::new(adapters, config.pool_options());
        let registry = ConnectionRegistry::new(Arc::clone(&store), Arc::clone(&pools));
        let metadata = MetadataExtractor::new(
            Arc::clone(&store),
            Arc::clone(&pools),
            config.metadata_freshness_duration(),
            config.introspection_timeout_duration(),
        );
        let executor = QueryExecutor::new(Arc::clone(&store), Arc::clone(&pools), &config);

        info!(
            read_only = config.read_only,
            max_sessions = config.max_sessions_per_connection,
            metadata_freshness_secs = config.metadata_freshness,
            "Engine started"
        );

        Ok(Self {
            config,
            store,
            pools,
            registry,
            metadata,
            executor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub async fn register(&self, input: NewConnection) -> DbResult<ConnectionDescriptor> {
        self.registry.register(input).await
    }

    pub async fn update(&self, key: &str, update: ConnectionUpdate) -> DbResult<ConnectionDescriptor> {
        self.registry.update(key, update).await
    }

    /// Look up a connection by id or name.
    pub async fn get(&self, key: &str) -> DbResult<ConnectionDescriptor> {
        self.registry.get(key).await
    }

    pub async fn list(&self, active_only: bool) -> DbResult<Vec<ConnectionDescriptor>> {
        self.registry.list(active_only).await
    }

    /// Delete a connection, closing its sessions and removing its metadata
    /// snapshot and execution history.
    pub async fn delete(&self, key: &str) -> DbResult<ConnectionDescriptor> {
        let descriptor = self.registry.delete(key).await?;
        self.metadata.forget(&descriptor.id);
        Ok(descriptor)
    }

    /// Metadata snapshot of an active connection, with the configured
    /// introspection timeout.
    pub async fn introspect(&self, key: &str, force_refresh: bool) -> DbResult<Arc<Snapshot>> {
        self.introspect_with(key, IntrospectRequest::new(force_refresh)).await
    }

    /// Metadata snapshot of an active connection.
    ///
    /// A served cache hit ignores the request's timeout and token.
    pub async fn introspect_with(
        &self,
        key: &str,
        request: IntrospectRequest,
    ) -> DbResult<Arc<Snapshot>> {
        let descriptor = self.registry.get_active(key).await?;
        self.metadata.introspect(&descriptor, &request).await
    }

    /// The stored snapshot of a connection without refreshing it.
    pub async fn cached_snapshot(&self, key: &str) -> DbResult<Option<Arc<Snapshot>>> {
        let descriptor = self.registry.get(key).await?;
        self.metadata.cached(&descriptor.id).await
    }

    /// Run `sql` with the default timeout.
    pub async fn execute(&self, key: &str, sql: &str) -> DbResult<QueryResult> {
        self.execute_with(key, ExecuteRequest::new(sql)).await
    }

    /// Run a query against an active connection.
    ///
    /// Unknown or inactive connections fail with `NotFound` and leave no
    /// execution record; every other attempt is recorded.
    pub async fn execute_with(&self, key: &str, request: ExecuteRequest) -> DbResult<QueryResult> {
        let descriptor = self.registry.get_active(key).await?;
        self.executor.run(&descriptor, request).await
    }

    /// Most recent execution records of a connection, newest first.
    pub async fn history(&self, key: &str, limit: usize) -> DbResult<Vec<ExecutionRecord>> {
        let descriptor = self.registry.get(key).await?;
        self.store.list_executions(&descriptor.id, limit).await
    }

    /// Session counts of a connection, if it has a pool.
    pub async fn pool_stats(&self, key: &str) -> DbResult<Option<PoolStats>> {
        let descriptor = self.registry.get(key).await?;
        Ok(self.pools.stats(&descriptor.id).await)
    }

    /// Close every pooled session and stop background tasks.
    pub async fn shutdown(&self) {
        self.pools.close_all().await;
        info!("Engine shut down");
    }
}
