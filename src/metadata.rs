//! Metadata extraction and snapshot cache.
//!
//! A snapshot younger than the freshness window is served from the store
//! without touching the database. Refreshes run under a per-connection
//! single-flight lock and replace the stored snapshot in one atomic step. A
//! failed refresh leaves the previous snapshot in place.

use crate::db::{Deadline, PoolManager};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionDescriptor, IntrospectRequest, Snapshot};
use crate::store::Store;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct MetadataExtractor {
    store: Arc<dyn Store>,
    pools: Arc<PoolManager>,
    freshness: Duration,
    introspection_timeout: Duration,
    /// One refresh at a time per connection id
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MetadataExtractor {
    pub fn new(
        store: Arc<dyn Store>,
        pools: Arc<PoolManager>,
        freshness: Duration,
        introspection_timeout: Duration,
    ) -> Self {
        Self {
            store,
            pools,
            freshness,
            introspection_timeout,
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// The stored snapshot, fresh or not. Never touches the database.
    pub async fn cached(&self, connection_id: &str) -> DbResult<Option<Arc<Snapshot>>> {
        self.store.load_snapshot(connection_id).await
    }

    /// Return the connection's snapshot, refreshing it from the database when
    /// it is missing, stale, or `force_refresh` is set.
    pub async fn introspect(
        &self,
        descriptor: &ConnectionDescriptor,
        request: &IntrospectRequest,
    ) -> DbResult<Arc<Snapshot>> {
        let requested_at = Utc::now();
        let force_refresh = request.force_refresh;
        let deadline = Deadline::new(request.effective_timeout(self.introspection_timeout))
            .with_cancel(request.cancel.clone());

        if !force_refresh {
            if let Some(snapshot) = self.fresh_snapshot(&descriptor.id).await? {
                debug!(connection_id = %descriptor.id, "Serving cached metadata snapshot");
                return Ok(snapshot);
            }
        }

        let flight = self.flight(&descriptor.id);
        let _guard = deadline
            .run("metadata refresh wait", async { Ok(flight.lock().await) })
            .await?;

        // Another caller may have refreshed while we waited for the lock
        if let Some(snapshot) = self.fresh_snapshot(&descriptor.id).await? {
            if !force_refresh || snapshot.extracted_at >= requested_at {
                debug!(
                    connection_id = %descriptor.id,
                    "Metadata refreshed by a concurrent caller"
                );
                return Ok(snapshot);
            }
        }

        self.refresh(descriptor, &deadline).await
    }

    async fn fresh_snapshot(&self, connection_id: &str) -> DbResult<Option<Arc<Snapshot>>> {
        let snapshot = self.store.load_snapshot(connection_id).await?;
        Ok(snapshot.filter(|s| s.is_fresh(self.freshness, Utc::now())))
    }

    async fn refresh(
        &self,
        descriptor: &ConnectionDescriptor,
        deadline: &Deadline,
    ) -> DbResult<Arc<Snapshot>> {
        if deadline.is_cancelled() {
            return Err(DbError::cancelled("schema introspection"));
        }
        let started = Instant::now();
        let mut handle = self.pools.checkout(descriptor).await?;

        let outcome = handle.session().introspect(deadline).await;
        handle.release().await;

        let facts = match outcome {
            Ok(facts) => facts,
            Err(e) => {
                warn!(
                    connection_id = %descriptor.id,
                    error = %e,
                    "Introspection failed, keeping previous snapshot"
                );
                return Err(e);
            }
        };

        let snapshot = Snapshot::from_facts(&descriptor.id, facts, Utc::now());
        let snapshot = match self.store.replace_snapshot(snapshot).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if matches!(e, DbError::NotFound { .. }) {
                    // Deleted while refreshing
                    self.pools.evict(&descriptor.id).await;
                }
                return Err(e);
            }
        };

        info!(
            connection_id = %descriptor.id,
            entries = snapshot.entries.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Metadata snapshot refreshed"
        );
        Ok(snapshot)
    }

    fn flight(&self, connection_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(flights.entry(connection_id.to_string()).or_default())
    }

    /// Drop per-connection state once a connection is deleted.
    pub fn forget(&self, connection_id: &str) {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id);
    }
}
