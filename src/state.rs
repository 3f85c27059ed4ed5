//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the message store and the chat hub. The hub is the single
//! owner of presence and of every connected client's outbound queue.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::services::hub::ChatHub;
use crate::services::store::MessageStore;

// =============================================================================
// USER ID
// =============================================================================

/// Logical user identity as asserted by the caller. Opaque, never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Parse a user id, trimming whitespace. Returns `None` when blank.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// CHAT MESSAGE
// =============================================================================

/// A persisted chat message. Mirrors the `chat_messages` table.
/// Immutable once the store hands it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender_id: UserId,
    pub sender_name: String,
    pub message: String,
    /// Server-assigned at persist time.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Copy.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub hub: ChatHub,
    pub chat: ChatConfig,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, chat: ChatConfig) -> Self {
        Self { store, hub: ChatHub::new(), chat }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
