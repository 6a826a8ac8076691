//! Session pool management.
//!
//! One [`ConnectionSlot`] per registered connection id owns that connection's
//! live sessions. Sessions are lent out through [`SessionHandle`]s and come
//! back through [`SessionHandle::release`].
//!
//! # Concurrency Safety
//!
//! - Slot creation is double-checked under the map write lock, so concurrent
//!   first checkouts share one slot and one adapter selection.
//! - A semaphore with `max_sessions_per_connection` permits caps live sessions.
//!   A permit is taken before any session is built and is only given back after
//!   the session is either idle again or closed.
//! - The idle list sits behind a `std::sync::Mutex` that is never held across
//!   an await point.
//! - Deleted connection ids are retired. A retired id never gets a slot
//!   again, so a checkout racing a delete fails with `NotFound` instead of
//!   opening a session nobody will evict.
//! - The reaper task holds a `Weak` reference and exits once the manager is
//!   dropped.

use crate::config::PoolOptions;
use crate::db::adapter::{Adapter, AdapterSet, Session};
use crate::error::{DbError, DbResult};
use crate::models::ConnectionDescriptor;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Point-in-time session counts for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
}

struct IdleSession {
    session: Box<dyn Session>,
    idle_since: Instant,
}

/// Sessions of one registered connection.
pub struct ConnectionSlot {
    connection_id: String,
    /// Contains credentials - never log
    url: String,
    adapter: Arc<dyn Adapter>,
    permits: Arc<Semaphore>,
    max_sessions: usize,
    idle: Mutex<Vec<IdleSession>>,
    evicted: AtomicBool,
}

impl ConnectionSlot {
    fn new(descriptor: &ConnectionDescriptor, adapter: Arc<dyn Adapter>, max_sessions: u32) -> Self {
        Self {
            connection_id: descriptor.id.clone(),
            url: descriptor.url.clone(),
            adapter,
            permits: Arc::new(Semaphore::new(max_sessions as usize)),
            max_sessions: max_sessions as usize,
            idle: Mutex::new(Vec::new()),
            evicted: AtomicBool::new(false),
        }
    }

    fn pop_idle(&self) -> Option<IdleSession> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    /// Pool a session, or hand it back if the slot was shut down.
    fn push_idle(&self, session: Box<dyn Session>) -> Option<Box<dyn Session>> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_evicted() {
            return Some(session);
        }
        idle.push(IdleSession {
            session,
            idle_since: Instant::now(),
        });
        None
    }

    /// Mark the slot evicted and take its idle sessions.
    fn seal(&self) -> Vec<Box<dyn Session>> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        self.evicted.store(true, Ordering::Release);
        idle.drain(..).map(|entry| entry.session).collect()
    }

    fn take_expired(&self, idle_timeout: Duration) -> Vec<Box<dyn Session>> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let (expired, keep): (Vec<_>, Vec<_>) = idle
            .drain(..)
            .partition(|entry| entry.idle_since.elapsed() > idle_timeout);
        *idle = keep;
        expired.into_iter().map(|entry| entry.session).collect()
    }

    fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    fn stats(&self) -> PoolStats {
        let idle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        PoolStats {
            idle,
            in_use: self
                .max_sessions
                .saturating_sub(self.permits.available_permits()),
            max: self.max_sessions,
        }
    }

    /// Mark evicted, wake waiters with an error and close idle sessions.
    async fn shut_down(&self) {
        let idle = self.seal();
        self.permits.close();
        for session in idle {
            session.close().await;
        }
    }
}

/// Close a session without waiting for it, if a runtime is available.
fn close_in_background(session: Box<dyn Session>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(session.close());
    }
}

/// Exclusive loan of one session.
///
/// Return it with [`release`](Self::release) or drop it with
/// [`discard`](Self::discard). A handle dropped without either is discarded.
pub struct SessionHandle {
    session: Option<Box<dyn Session>>,
    slot: Arc<ConnectionSlot>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("connection_id", &self.slot.connection_id)
            .field("has_session", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    fn new(session: Box<dyn Session>, slot: Arc<ConnectionSlot>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            session: Some(session),
            slot,
            permit: Some(permit),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.slot.connection_id
    }

    /// The borrowed session.
    pub fn session(&mut self) -> &mut (dyn Session + 'static) {
        self.session
            .as_deref_mut()
            .expect("session is present until the handle is consumed")
    }

    /// Return the session to the pool. Broken sessions and sessions of evicted
    /// connections are closed instead.
    pub async fn release(mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let rejected = if session.is_broken() {
            Some(session)
        } else {
            self.slot.push_idle(session)
        };
        if let Some(session) = rejected {
            debug!(
                connection_id = %self.slot.connection_id,
                broken = session.is_broken(),
                "Closing session instead of pooling it"
            );
            session.close().await;
        }
        // Permit goes back only after the session is idle or closed
        self.permit.take();
    }

    /// Close the session without returning it to the pool.
    pub async fn discard(mut self) {
        if let Some(session) = self.session.take() {
            debug!(connection_id = %self.slot.connection_id, "Discarding session");
            session.close().await;
        }
        self.permit.take();
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!(
                connection_id = %self.slot.connection_id,
                "Session handle dropped without release - discarding session"
            );
            close_in_background(session);
        }
    }
}

/// Owns every live session, keyed by connection id.
pub struct PoolManager {
    adapters: AdapterSet,
    options: PoolOptions,
    slots: RwLock<HashMap<String, Arc<ConnectionSlot>>>,
    /// Ids of deleted connections
    retired: Mutex<HashSet<String>>,
    /// Uses std::sync::Mutex for synchronous storage
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    /// Create a pool manager and start its idle reaper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(adapters: AdapterSet, options: PoolOptions) -> Arc<Self> {
        let manager = Arc::new(Self {
            adapters,
            options,
            slots: RwLock::new(HashMap::new()),
            retired: Mutex::new(HashSet::new()),
            reaper: Mutex::new(None),
        });

        let weak_manager = Arc::downgrade(&manager);
        let cleanup_interval = manager.options.cleanup_interval;
        let idle_timeout = manager.options.idle_timeout;
        let handle = tokio::spawn(async move {
            Self::reap_idle(weak_manager, cleanup_interval, idle_timeout).await;
        });
        *manager
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        manager
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Borrow a session for `descriptor`, building one through its adapter if
    /// no idle session is available.
    ///
    /// Waits at most `acquire_timeout` for a free slot before failing with
    /// `PoolExhausted`. A wait interrupted by a URL change moves over to the
    /// replacement slot once; a wait interrupted by eviction fails with
    /// `NotFound`.
    pub async fn checkout(&self, descriptor: &ConnectionDescriptor) -> DbResult<SessionHandle> {
        let mut slot = self.slot_for(descriptor).await?;

        let started = Instant::now();
        let give_up_at = tokio::time::Instant::now() + self.options.acquire_timeout;
        let mut moved = false;
        let permit = loop {
            match tokio::time::timeout_at(give_up_at, Arc::clone(&slot.permits).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => break permit,
                Ok(Err(_)) => match self.replacement_for(&slot).await {
                    Some(replacement) if !moved => {
                        debug!(connection_id = %descriptor.id, "Slot replaced while waiting, moving over");
                        moved = true;
                        slot = replacement;
                    }
                    _ => return Err(DbError::connection_not_found(&descriptor.id)),
                },
                Err(_) => {
                    warn!(
                        connection_id = %descriptor.id,
                        max_sessions = slot.max_sessions,
                        "Timed out waiting for a free session"
                    );
                    return Err(DbError::pool_exhausted(&descriptor.id, started.elapsed()));
                }
            }
        };

        while let Some(idle) = slot.pop_idle() {
            if idle.idle_since.elapsed() > self.options.idle_timeout {
                debug!(connection_id = %descriptor.id, "Closing expired idle session");
                close_in_background(idle.session);
                continue;
            }
            let mut session = idle.session;
            if self.options.test_before_checkout {
                if let Err(e) = session.ping().await {
                    debug!(connection_id = %descriptor.id, error = %e, "Idle session failed ping");
                    close_in_background(session);
                    continue;
                }
            }
            debug!(connection_id = %descriptor.id, "Reusing idle session");
            return Ok(SessionHandle::new(session, slot, permit));
        }

        let session = self.connect(&slot).await?;
        Ok(SessionHandle::new(session, slot, permit))
    }

    /// Build a session, retrying once on a connection-class failure.
    async fn connect(&self, slot: &ConnectionSlot) -> DbResult<Box<dyn Session>> {
        let timeout = self.options.connect_timeout;
        match slot.adapter.connect(&slot.url, timeout).await {
            Ok(session) => {
                debug!(connection_id = %slot.connection_id, "Opened new session");
                Ok(session)
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    connection_id = %slot.connection_id,
                    error = %e,
                    "Connect failed, retrying once"
                );
                slot.adapter.connect(&slot.url, timeout).await
            }
            Err(e) => Err(e),
        }
    }

    /// The live slot that took over from a shut-down one, if any.
    async fn replacement_for(&self, stale: &Arc<ConnectionSlot>) -> Option<Arc<ConnectionSlot>> {
        let slots = self.slots.read().await;
        slots
            .get(&stale.connection_id)
            .filter(|current| !Arc::ptr_eq(current, stale))
            .cloned()
    }

    fn is_retired(&self, connection_id: &str) -> bool {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(connection_id)
    }

    /// Get or create the slot for a descriptor.
    async fn slot_for(&self, descriptor: &ConnectionDescriptor) -> DbResult<Arc<ConnectionSlot>> {
        if self.is_retired(&descriptor.id) {
            return Err(DbError::connection_not_found(&descriptor.id));
        }
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(&descriptor.id) {
                if slot.url == descriptor.url {
                    return Ok(Arc::clone(slot));
                }
            }
        }

        let adapter = self.adapters.for_url(&descriptor.url)?;
        let (slot, replaced) = {
            let mut slots = self.slots.write().await;
            // Retiring happens before the evicting write lock is taken
            if self.is_retired(&descriptor.id) {
                return Err(DbError::connection_not_found(&descriptor.id));
            }
            // Double-check after acquiring write lock
            match slots.get(&descriptor.id) {
                Some(slot) if slot.url == descriptor.url => (Arc::clone(slot), None),
                _ => {
                    let slot = Arc::new(ConnectionSlot::new(
                        descriptor,
                        adapter,
                        self.options.max_sessions_per_connection,
                    ));
                    let replaced = slots.insert(descriptor.id.clone(), Arc::clone(&slot));
                    info!(
                        connection_id = %descriptor.id,
                        dialect = %descriptor.dialect,
                        url = %descriptor.masked_url(),
                        "Created session pool"
                    );
                    (slot, replaced)
                }
            }
        }; // Lock released here

        if let Some(stale) = replaced {
            info!(connection_id = %descriptor.id, "Connection URL changed, closing old sessions");
            stale.shut_down().await;
        }
        Ok(slot)
    }

    /// Close every session of a connection. Idempotent.
    ///
    /// Sessions currently checked out are closed when they are returned.
    pub async fn evict(&self, connection_id: &str) {
        let removed = self.slots.write().await.remove(connection_id);
        if let Some(slot) = removed {
            info!(connection_id = %connection_id, "Evicting session pool");
            slot.shut_down().await;
        }
    }

    /// Evict a deleted connection and refuse any later checkout for it.
    pub async fn retire(&self, connection_id: &str) {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id.to_string());
        self.evict(connection_id).await;
    }

    /// Undo [`retire`](Self::retire) when the delete did not go through.
    pub fn reinstate(&self, connection_id: &str) {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id);
    }

    pub async fn stats(&self, connection_id: &str) -> Option<PoolStats> {
        let slots = self.slots.read().await;
        slots.get(connection_id).map(|slot| slot.stats())
    }

    /// Number of connections with a session pool.
    pub async fn pool_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Close every pooled session and stop the reaper.
    pub async fn close_all(&self) {
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        // Drain under lock, close outside lock
        let slots: Vec<_> = self.slots.write().await.drain().collect();
        for (connection_id, slot) in slots {
            info!(connection_id = %connection_id, "Closing session pool");
            slot.shut_down().await;
        }
    }

    /// Close idle sessions older than `idle_timeout` across all connections.
    pub async fn close_expired(&self, idle_timeout: Duration) -> usize {
        let slots: Vec<Arc<ConnectionSlot>> = self.slots.read().await.values().cloned().collect();
        let mut closed = 0;
        for slot in slots {
            for session in slot.take_expired(idle_timeout) {
                session.close().await;
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(closed, "Closed expired idle sessions");
        }
        closed
    }

    /// Background task closing idle sessions.
    ///
    /// Uses a Weak reference to the manager to avoid circular reference memory leaks.
    /// The task automatically exits when the manager is dropped.
    async fn reap_idle(weak_manager: Weak<Self>, cleanup_interval: Duration, idle_timeout: Duration) {
        let mut interval = tokio::time::interval(cleanup_interval);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(manager) = weak_manager.upgrade() else {
                debug!("Pool manager dropped, reaper exiting");
                return;
            };
            manager.close_expired(idle_timeout).await;
        }
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        if let Some(handle) = self
            .reaper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
