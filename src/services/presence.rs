//! Presence registry — which connections belong to which users.
//!
//! DESIGN
//! ======
//! Entries are keyed by connection (`client_id`), not by user, so a user
//! with two tabs open has two entries and stays active until both close.
//! The active-user snapshot is the distinct projection of user ids, ordered
//! by each user's earliest still-registered connection.
//!
//! The registry is plain data with no locking. `ChatHub` owns the only
//! instance and serializes every mutation behind its lock.

use std::collections::HashMap;

use uuid::Uuid;

use crate::state::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: UserId,
    /// Registration order, used to keep snapshots stable.
    seq: u64,
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: HashMap<Uuid, PresenceEntry>,
    next_seq: u64,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under `user_id`, replacing any previous
    /// registration of the same connection. Returns the replaced user, if any.
    ///
    /// A connection keeps its original position in the snapshot order when
    /// it registers again.
    pub fn register(&mut self, client_id: Uuid, user_id: UserId) -> Option<UserId> {
        if let Some(entry) = self.entries.get_mut(&client_id) {
            return Some(std::mem::replace(&mut entry.user_id, user_id));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(client_id, PresenceEntry { user_id, seq });
        None
    }

    /// Remove a connection. Returns the user it belonged to.
    pub fn remove(&mut self, client_id: Uuid) -> Option<UserId> {
        self.entries.remove(&client_id).map(|e| e.user_id)
    }

    /// User a connection is registered under, if any.
    #[must_use]
    pub fn user_of(&self, client_id: Uuid) -> Option<&UserId> {
        self.entries.get(&client_id).map(|e| &e.user_id)
    }

    /// Number of live connections registered for `user_id`.
    #[must_use]
    pub fn connection_count(&self, user_id: &UserId) -> usize {
        self.entries.values().filter(|e| &e.user_id == user_id).count()
    }

    /// Distinct active users, ordered by first registration.
    #[must_use]
    pub fn active_users(&self) -> Vec<UserId> {
        let mut first_seen: HashMap<&UserId, u64> = HashMap::new();
        for entry in self.entries.values() {
            first_seen
                .entry(&entry.user_id)
                .and_modify(|seq| *seq = (*seq).min(entry.seq))
                .or_insert(entry.seq);
        }
        let mut users: Vec<(&UserId, u64)> = first_seen.into_iter().collect();
        users.sort_by_key(|(_, seq)| *seq);
        users.into_iter().map(|(user, _)| user.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
