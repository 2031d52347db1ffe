//! In-memory registry for live chat connections.
//!
//! Owns every visitor and agent socket attached to this process. The primary
//! map is keyed by connection id; auxiliary indices keyed by
//! `(tenant_id, session_id)` and by tenant keep recipient resolution and
//! presence queries off the full-scan path. Readers always get snapshots
//! (`Vec<Arc<Connection>>`), never live views.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{close_code, CloseFrame, Message};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use parley_protocol::{is_agent_global, ConnectionType};

/// Process-unique connection identifier.
pub type ConnectionId = Uuid;

/// Bounded send path into a connection's writer task.
pub type WsSender = mpsc::Sender<Message>;

/// Attempts at drawing a fresh id before registration gives up.
const ID_ALLOCATION_ATTEMPTS: usize = 3;

type SessionKey = (Uuid, String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registration failed: {0}")]
    RegistrationFailed(&'static str),

    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    #[error("connection {0} is not an agent-global connection")]
    NotAgentGlobal(ConnectionId),
}

/// Why a connection was torn down. Mapped onto the WebSocket close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    TransportError,
    HeartbeatTimeout,
    SlowConsumer,
    ServerShutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SlowConsumer => "slow_consumer",
            Self::ServerShutdown => "server_shutdown",
        }
    }

    pub fn close_frame(&self) -> CloseFrame {
        let code = match self {
            Self::ClientClosed => close_code::NORMAL,
            Self::TransportError => close_code::ERROR,
            Self::HeartbeatTimeout => close_code::AWAY,
            Self::SlowConsumer => close_code::POLICY,
            Self::ServerShutdown => close_code::RESTART,
        };
        CloseFrame {
            code,
            reason: self.as_str().into(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Identity a connection is registered with, extracted before upgrade.
#[derive(Debug, Clone)]
pub struct Registration {
    pub session_id: String,
    pub kind: ConnectionType,
    pub tenant_id: Uuid,
    /// Agent id for agent connections.
    pub peer_ref: Option<Uuid>,
    pub display_name: String,
}

/// One live duplex channel to a visitor or agent.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub session_id: String,
    pub tenant_id: Uuid,
    pub kind: ConnectionType,
    pub peer_ref: Option<Uuid>,
    pub display_name: String,
    pub connected_at: DateTime<Utc>,
    last_seen: Mutex<Instant>,
    /// Sessions an agent-global connection follows besides its own.
    subscriptions: Mutex<HashSet<String>>,
    tx: WsSender,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn is_agent_global(&self) -> bool {
        self.kind == ConnectionType::Agent && is_agent_global(&self.session_id)
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.subscriptions.lock().contains(session_id)
    }

    /// Queue a frame for the writer task without waiting.
    pub fn send(&self, msg: Message) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Resolves once the connection is being torn down or its writer failed.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Ask the read loop to stop; teardown itself happens on that path.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Close-once guard. Returns `true` only for the first caller.
    fn mark_closed(&self, reason: CloseReason) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.close_reason.lock() = Some(reason);
        true
    }
}

/// Point-in-time connection counts for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TenantCounts {
    pub visitors: usize,
    pub agents: usize,
    pub agent_global: usize,
}

/// Central registry shared across all WebSocket handler tasks.
#[derive(Debug)]
pub struct ConnectionRegistry {
    /// connection_id → connection handle
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// (tenant, session) → connections scoped to that session
    by_session: DashMap<SessionKey, HashSet<ConnectionId>>,
    /// (tenant, session) → agent-global connections subscribed to it
    subscribers: DashMap<SessionKey, HashSet<ConnectionId>>,
    /// tenant → every connection of that tenant
    by_tenant: DashMap<Uuid, HashSet<ConnectionId>>,
    queue_capacity: usize,
    max_connections: usize,
    total: AtomicUsize,
    shutting_down: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize, max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            by_session: DashMap::new(),
            subscribers: DashMap::new(),
            by_tenant: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
            max_connections,
            total: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────

    /// Register a freshly upgraded socket.
    ///
    /// Returns the connection handle and the receiving end of its outbound
    /// queue, which the caller hands to the writer task.
    pub fn register(
        &self,
        registration: Registration,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Message>), RegistryError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RegistryError::RegistrationFailed("server shutting down"));
        }

        let previous = self.total.fetch_add(1, Ordering::AcqRel);
        if previous >= self.max_connections {
            self.total.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(
                max_connections = self.max_connections,
                "Rejecting connection: registry full"
            );
            return Err(RegistryError::RegistrationFailed("connection limit reached"));
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut pending = Connection {
            id: Uuid::new_v4(),
            session_id: registration.session_id,
            tenant_id: registration.tenant_id,
            kind: registration.kind,
            peer_ref: registration.peer_ref,
            display_name: registration.display_name,
            connected_at: Utc::now(),
            last_seen: Mutex::new(Instant::now()),
            subscriptions: Mutex::new(HashSet::new()),
            tx,
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
        };
        let mut inserted = None;

        for _ in 0..ID_ALLOCATION_ATTEMPTS {
            match self.connections.entry(pending.id) {
                Entry::Vacant(slot) => {
                    // Index first: a connection visible in the primary map is
                    // always fully indexed, so a racing teardown cleans up all of it.
                    self.by_session
                        .entry((pending.tenant_id, pending.session_id.clone()))
                        .or_default()
                        .insert(pending.id);
                    self.by_tenant
                        .entry(pending.tenant_id)
                        .or_default()
                        .insert(pending.id);
                    let conn = Arc::new(pending);
                    slot.insert(Arc::clone(&conn));
                    inserted = Some(conn);
                    break;
                }
                Entry::Occupied(_) => pending.id = Uuid::new_v4(),
            }
        }

        let Some(conn) = inserted else {
            self.total.fetch_sub(1, Ordering::AcqRel);
            tracing::error!("Connection id space collision after retries");
            return Err(RegistryError::RegistrationFailed("id collision"));
        };

        // `close_all` may have taken its snapshot while this entry was being
        // inserted; it is visible now, so close it here.
        if self.shutting_down.load(Ordering::SeqCst) {
            self.teardown(&conn, CloseReason::ServerShutdown);
            return Err(RegistryError::RegistrationFailed("server shutting down"));
        }

        tracing::info!(
            connection_id = %conn.id,
            session_id = %conn.session_id,
            tenant_id = %conn.tenant_id,
            kind = %conn.kind,
            "Connection registered"
        );

        Ok((conn, rx))
    }

    /// Remove a connection and its index entries. No-op if already gone.
    pub fn deregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(id)?;
        self.total.fetch_sub(1, Ordering::AcqRel);

        remove_from_index(
            &self.by_session,
            &(conn.tenant_id, conn.session_id.clone()),
            id,
        );
        remove_from_index(&self.by_tenant, &conn.tenant_id, id);
        for session_id in conn.subscriptions() {
            remove_from_index(&self.subscribers, &(conn.tenant_id, session_id), id);
        }

        tracing::debug!(connection_id = %id, "Connection deregistered");
        Some(conn)
    }

    /// Deregister and close a connection exactly once.
    ///
    /// Safe to call from the read loop, the heartbeat sweep and the router
    /// concurrently; only the first call does anything and returns `true`.
    pub fn teardown(&self, conn: &Connection, reason: CloseReason) -> bool {
        if !conn.mark_closed(reason) {
            return false;
        }
        self.deregister(&conn.id);
        conn.cancel.cancel();
        tracing::info!(
            connection_id = %conn.id,
            session_id = %conn.session_id,
            reason = reason.as_str(),
            "Connection closed"
        );
        true
    }

    /// Tear down by id. Returns `false` if the id is unknown or already closed.
    pub fn evict(&self, id: &ConnectionId, reason: CloseReason) -> bool {
        match self.get(id) {
            Ok(conn) => self.teardown(&conn, reason),
            Err(_) => false,
        }
    }

    /// Refuse new registrations and close every live connection.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.snapshot()
            .iter()
            .filter(|conn| self.teardown(conn, reason))
            .count()
    }

    /// Whether a registration attempted now would be refused up front.
    pub fn admission(&self) -> Result<(), RegistryError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RegistryError::RegistrationFailed("server shutting down"));
        }
        if self.total.load(Ordering::Acquire) >= self.max_connections {
            return Err(RegistryError::RegistrationFailed("connection limit reached"));
        }
        Ok(())
    }

    // ─── Lookups ─────────────────────────────────────────────

    pub fn get(&self, id: &ConnectionId) -> Result<Arc<Connection>, RegistryError> {
        self.connections
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RegistryError::NotFound(*id))
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Every connection of `kind` registered under `tenant_id`.
    pub fn list_by_tenant(&self, tenant_id: &Uuid, kind: ConnectionType) -> Vec<Arc<Connection>> {
        self.resolve_index(&self.by_tenant, tenant_id)
            .into_iter()
            .filter(|conn| conn.kind == kind)
            .collect()
    }

    /// Connections opened directly on `(tenant_id, session_id)`.
    pub fn session_members(&self, tenant_id: &Uuid, session_id: &str) -> Vec<Arc<Connection>> {
        self.resolve_index(&self.by_session, &(*tenant_id, session_id.to_string()))
    }

    /// Agent-global connections subscribed to `(tenant_id, session_id)`.
    pub fn session_subscribers(&self, tenant_id: &Uuid, session_id: &str) -> Vec<Arc<Connection>> {
        self.resolve_index(&self.subscribers, &(*tenant_id, session_id.to_string()))
    }

    /// All live connections.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tenant_counts(&self, tenant_id: &Uuid) -> TenantCounts {
        let mut counts = TenantCounts::default();
        for conn in self.resolve_index(&self.by_tenant, tenant_id) {
            match conn.kind {
                ConnectionType::Visitor => counts.visitors += 1,
                ConnectionType::Agent => {
                    counts.agents += 1;
                    if conn.is_agent_global() {
                        counts.agent_global += 1;
                    }
                }
            }
        }
        counts
    }

    // ─── Liveness ────────────────────────────────────────────

    /// Record an inbound heartbeat. Returns `false` for unknown ids.
    pub fn touch_last_seen(&self, id: &ConnectionId) -> bool {
        match self.connections.get(id) {
            Some(entry) => {
                *entry.value().last_seen.lock() = Instant::now();
                true
            }
            None => false,
        }
    }

    // ─── Subscriptions ───────────────────────────────────────

    /// Follow `session_id` from an agent-global connection.
    /// Returns `true` if the subscription is new.
    pub fn subscribe(&self, id: &ConnectionId, session_id: &str) -> Result<bool, RegistryError> {
        let conn = self.get(id)?;
        if !conn.is_agent_global() {
            return Err(RegistryError::NotAgentGlobal(*id));
        }
        let added = conn.subscriptions.lock().insert(session_id.to_string());
        let key = (conn.tenant_id, session_id.to_string());
        self.subscribers.entry(key.clone()).or_default().insert(*id);

        // Lost a race with deregister: don't leave a ghost index entry behind.
        if !self.contains(id) {
            remove_from_index(&self.subscribers, &key, id);
            return Err(RegistryError::NotFound(*id));
        }

        tracing::debug!(connection_id = %id, %session_id, added, "Session subscribed");
        Ok(added)
    }

    /// Stop following `session_id`. Returns `true` if a subscription was removed.
    pub fn unsubscribe(&self, id: &ConnectionId, session_id: &str) -> Result<bool, RegistryError> {
        let conn = self.get(id)?;
        if !conn.is_agent_global() {
            return Err(RegistryError::NotAgentGlobal(*id));
        }
        let removed = conn.subscriptions.lock().remove(session_id);
        remove_from_index(&self.subscribers, &(conn.tenant_id, session_id.to_string()), id);
        tracing::debug!(connection_id = %id, %session_id, removed, "Session unsubscribed");
        Ok(removed)
    }

    fn resolve_index<K>(&self, index: &DashMap<K, HashSet<ConnectionId>>, key: &K) -> Vec<Arc<Connection>>
    where
        K: std::hash::Hash + Eq,
    {
        // Copy the id set out before touching the primary map so no shard
        // lock of the index is held while reading connections.
        let ids: Vec<ConnectionId> = match index.get(key) {
            Some(set) => set.iter().copied().collect(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|e| Arc::clone(e.value())))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(256, 10_000)
    }
}

fn remove_from_index<K>(index: &DashMap<K, HashSet<ConnectionId>>, key: &K, id: &ConnectionId)
where
    K: std::hash::Hash + Eq,
{
    if let Some(mut set) = index.get_mut(key) {
        set.remove(id);
    }
    index.remove_if(key, |_, set| set.is_empty());
}
