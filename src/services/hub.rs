//! Chat hub — broadcast fan-out and presence ownership.
//!
//! DESIGN
//! ======
//! The hub holds every connected client's outbound queue and the presence
//! registry behind one `RwLock`. A presence mutation and the snapshot
//! broadcast it triggers run inside the same write-lock critical section,
//! so snapshots can never observe a half-applied change and peers receive
//! them in mutation order.
//!
//! Broadcast is best-effort with current-snapshot semantics: a client whose
//! queue is full misses that event, and a client attached after the lock
//! was taken does not see it.
//!
//! HEARTBEAT
//! =========
//! Each client carries a `last_seen` instant refreshed on every inbound
//! frame. `evict_stale` drops clients that went quiet; dropping the queue
//! sender closes the session's receiver, which ends its websocket loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::services::presence::PresenceRegistry;
use crate::state::{ChatMessage, UserId};

// =============================================================================
// EVENTS
// =============================================================================

/// First frame on every connection.
pub const SYSCALL_CONNECTED: &str = "session:connected";
/// Full chat history, sent once after connect.
pub const SYSCALL_HISTORY: &str = "chat:history";
/// Client request to post a message.
pub const SYSCALL_SEND: &str = "chat:send";
/// Broadcast of a newly persisted message.
pub const SYSCALL_MESSAGE: &str = "chat:message";
/// Client request announcing its user id.
pub const SYSCALL_IDENTIFY: &str = "presence:identify";
/// Broadcast of the active-user set.
pub const SYSCALL_USERS: &str = "presence:users";
/// Reply to frames that could not be parsed at all.
pub const SYSCALL_GATEWAY_ERROR: &str = "gateway:error";

/// Flatten a message into frame data.
#[must_use]
pub fn message_data(message: &ChatMessage) -> Data {
    match serde_json::to_value(message) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => Data::new(),
    }
}

#[must_use]
pub fn users_frame(users: &[UserId]) -> Frame {
    let mut data = Data::new();
    data.insert("users".into(), serde_json::json!(users));
    Frame::request(SYSCALL_USERS, data)
}

#[must_use]
pub fn message_frame(message: &ChatMessage) -> Frame {
    Frame::request(SYSCALL_MESSAGE, message_data(message)).with_from(message.sender_id.as_str())
}

// =============================================================================
// HUB
// =============================================================================

struct ConnectedClient {
    tx: mpsc::Sender<Frame>,
    last_seen: Instant,
}

#[derive(Default)]
struct HubInner {
    clients: HashMap<Uuid, ConnectedClient>,
    presence: PresenceRegistry,
}

impl HubInner {
    fn send_all(&self, frame: &Frame) {
        for (client_id, client) in &self.clients {
            if client.tx.try_send(frame.clone()).is_err() {
                warn!(%client_id, syscall = %frame.syscall, "hub: client queue full or closed; dropped frame");
            }
        }
    }

    fn broadcast_users(&self) {
        self.send_all(&users_frame(&self.presence.active_users()));
    }
}

#[derive(Clone, Default)]
pub struct ChatHub {
    inner: Arc<RwLock<HubInner>>,
}

impl ChatHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client to the broadcast set.
    pub async fn attach(&self, client_id: Uuid, tx: mpsc::Sender<Frame>) {
        self.attach_at(client_id, tx, Instant::now()).await;
    }

    pub(crate) async fn attach_at(&self, client_id: Uuid, tx: mpsc::Sender<Frame>, now: Instant) {
        let mut inner = self.inner.write().await;
        inner.clients.insert(client_id, ConnectedClient { tx, last_seen: now });
        info!(%client_id, clients = inner.clients.len(), "hub: client attached");
    }

    /// Register `client_id` as `user_id` and broadcast the new active-user
    /// set to everyone, the caller included. Returns `false` if the client
    /// is no longer attached (evicted).
    pub async fn identify(&self, client_id: Uuid, user_id: UserId) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.clients.contains_key(&client_id) {
            return false;
        }
        let rebind = inner.presence.user_of(client_id) == Some(&user_id);
        inner.presence.register(client_id, user_id.clone());
        info!(%client_id, %user_id, rebind, connections = inner.presence.len(), "hub: user identified");
        inner.broadcast_users();
        true
    }

    /// Remove a client. If it held a presence entry, broadcast the updated
    /// active-user set to the remaining clients. Returns whether presence
    /// changed. Repeated calls are no-ops.
    pub async fn detach(&self, client_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        let was_attached = inner.clients.remove(&client_id).is_some();
        let Some(user_id) = inner.presence.remove(client_id) else {
            if was_attached {
                info!(%client_id, "hub: anonymous client detached");
            }
            return false;
        };
        let user_connections = inner.presence.connection_count(&user_id);
        info!(%client_id, %user_id, user_connections, remaining = inner.clients.len(), "hub: user left");
        inner.broadcast_users();
        true
    }

    /// Broadcast a frame to every attached client. Best-effort: a client
    /// with a full queue misses it.
    pub async fn broadcast(&self, frame: &Frame) {
        self.inner.read().await.send_all(frame);
    }

    /// Record activity from a client. Returns `false` if it is not attached.
    pub async fn touch(&self, client_id: Uuid) -> bool {
        self.touch_at(client_id, Instant::now()).await
    }

    pub(crate) async fn touch_at(&self, client_id: Uuid, now: Instant) -> bool {
        let mut inner = self.inner.write().await;
        let Some(client) = inner.clients.get_mut(&client_id) else {
            return false;
        };
        client.last_seen = now;
        true
    }

    /// Evict clients silent for longer than `timeout`. Broadcasts one
    /// active-user snapshot if any evicted client was identified.
    pub async fn evict_stale(&self, timeout: Duration) -> Vec<Uuid> {
        self.evict_stale_at(Instant::now(), timeout).await
    }

    pub(crate) async fn evict_stale_at(&self, now: Instant, timeout: Duration) -> Vec<Uuid> {
        let mut inner = self.inner.write().await;
        let stale: Vec<Uuid> = inner
            .clients
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut presence_changed = false;
        for client_id in &stale {
            inner.clients.remove(client_id);
            let user_id = inner.presence.remove(*client_id);
            presence_changed |= user_id.is_some();
            warn!(client_id = %client_id, user_id = ?user_id.as_ref().map(UserId::as_str), "hub: evicted stale client");
        }
        if presence_changed {
            inner.broadcast_users();
        }
        stale
    }

    pub async fn active_users(&self) -> Vec<UserId> {
        self.inner.read().await.presence.active_users()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }
}

#[cfg(test)]
#[path = "hub_test.rs"]
mod tests;
