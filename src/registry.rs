//! Connection registry.
//!
//! CRUD over connection descriptors. URL legality is checked here before
//! anything is persisted, and every change that invalidates live sessions
//! evicts them from the pool.

use crate::db::PoolManager;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionDescriptor, ConnectionUpdate, NewConnection};
use crate::store::Store;
use std::sync::Arc;
use tracing::info;

pub struct ConnectionRegistry {
    store: Arc<dyn Store>,
    pools: Arc<PoolManager>,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn Store>, pools: Arc<PoolManager>) -> Self {
        Self { store, pools }
    }

    /// Register a new connection.
    pub async fn register(&self, input: NewConnection) -> DbResult<ConnectionDescriptor> {
        let descriptor = ConnectionDescriptor::new(input)?;
        self.store.insert_connection(&descriptor).await?;

        info!(
            connection_id = %descriptor.id,
            name = %descriptor.name,
            dialect = %descriptor.dialect,
            url = %descriptor.masked_url(),
            "Registered connection"
        );
        Ok(descriptor)
    }

    /// Apply a partial update to the connection identified by `key`.
    ///
    /// Changing the URL or deactivating the connection closes its pooled sessions.
    pub async fn update(&self, key: &str, update: ConnectionUpdate) -> DbResult<ConnectionDescriptor> {
        let current = self.get(key).await?;
        let mut updated = current.clone();
        let url_changed = updated.apply(update)?;
        self.store.update_connection(&updated).await?;

        let deactivated = current.is_active && !updated.is_active;
        if url_changed || deactivated {
            self.pools.evict(&updated.id).await;
        }

        info!(
            connection_id = %updated.id,
            name = %updated.name,
            url_changed,
            is_active = updated.is_active,
            "Updated connection"
        );
        Ok(updated)
    }

    /// Look up a connection by id, falling back to its unique name.
    pub async fn get(&self, key: &str) -> DbResult<ConnectionDescriptor> {
        if let Some(descriptor) = self.store.get_connection(key).await? {
            return Ok(descriptor);
        }
        self.store
            .find_connection_by_name(key)
            .await?
            .ok_or_else(|| DbError::connection_not_found(key))
    }

    /// Like [`get`](Self::get), but inactive connections are reported as not found.
    pub async fn get_active(&self, key: &str) -> DbResult<ConnectionDescriptor> {
        let descriptor = self.get(key).await?;
        if !descriptor.is_active {
            return Err(DbError::not_found("Active connection", key));
        }
        Ok(descriptor)
    }

    pub async fn list(&self, active_only: bool) -> DbResult<Vec<ConnectionDescriptor>> {
        self.store.list_connections(active_only).await
    }

    /// Delete a connection with its metadata and execution history.
    ///
    /// Pooled sessions are closed before the descriptor is removed, and the
    /// pool refuses the id from then on.
    pub async fn delete(&self, key: &str) -> DbResult<ConnectionDescriptor> {
        let descriptor = self.get(key).await?;
        self.pools.retire(&descriptor.id).await;

        match self.store.delete_connection(&descriptor.id).await {
            Ok(true) => {}
            Ok(false) => return Err(DbError::connection_not_found(key)),
            Err(e) => {
                self.pools.reinstate(&descriptor.id);
                return Err(e);
            }
        }

        info!(
            connection_id = %descriptor.id,
            name = %descriptor.name,
            "Deleted connection"
        );
        Ok(descriptor)
    }
}
