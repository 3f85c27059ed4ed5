//! Chat session — per-connection state machine.
//!
//! LIFECYCLE
//! =========
//! `Connecting → Identified → Closed`. A session starts `Connecting` when
//! the socket is accepted; `Closed` is terminal and every later event is
//! rejected or ignored.
//!
//! 1. `on_connect`: attach to the hub, then read history from the store.
//!    Attaching first means a message persisted during the read shows up
//!    live even if it also lands in history; clients dedupe by `id`.
//! 2. `on_identify`: bind the user id to this session and publish presence.
//! 3. `on_send_message`: validate, persist, then broadcast. The broadcast
//!    never runs unless the append returned.
//! 4. `on_disconnect`: detach from the hub. Idempotent.
//!
//! IDENTITY
//! ========
//! The sender of every message is the identity bound at identify time. A
//! client-supplied `sender_id` that disagrees is rejected, never trusted.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::frame::Frame;
use crate::services::hub::{self, ChatHub};
use crate::services::store::{MessageStore, NewChatMessage, StoreError};
use crate::state::{AppState, ChatMessage, UserId};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("identify before sending messages")]
    NotIdentified,
    #[error("sender_id {claimed} does not match identified user {bound}")]
    IdentityMismatch { claimed: String, bound: UserId },
    #[error("session already identified as {0}")]
    AlreadyIdentified(UserId),
    #[error("session closed")]
    SessionClosed,
}

impl crate::frame::ErrorCode for ChatError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "E_STORE_UNAVAILABLE",
            Self::MalformedPayload(_) => "E_MALFORMED_PAYLOAD",
            Self::NotIdentified => "E_NOT_IDENTIFIED",
            Self::IdentityMismatch { .. } => "E_IDENTITY_MISMATCH",
            Self::AlreadyIdentified(_) => "E_ALREADY_IDENTIFIED",
            Self::SessionClosed => "E_SESSION_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Identified(UserId),
    Closed,
}

/// Client payload for `chat:send`, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendMessage {
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub message: Option<String>,
}

// =============================================================================
// SESSION
// =============================================================================

pub struct ChatSession {
    client_id: Uuid,
    state: SessionState,
    hub: ChatHub,
    store: Arc<dyn MessageStore>,
    config: ChatConfig,
}

impl ChatSession {
    #[must_use]
    pub fn new(app: &AppState, client_id: Uuid) -> Self {
        Self {
            client_id,
            state: SessionState::Connecting,
            hub: app.hub.clone(),
            store: app.store.clone(),
            config: app.chat,
        }
    }

    #[must_use]
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Join the broadcast set and fetch the full ordered history.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the history read fails. The session stays
    /// attached and usable.
    pub async fn on_connect(&mut self, tx: mpsc::Sender<Frame>) -> Result<Vec<ChatMessage>, ChatError> {
        if self.state == SessionState::Closed {
            return Err(ChatError::SessionClosed);
        }
        self.hub.attach(self.client_id, tx).await;

        match self.store.list_ordered_by_time().await {
            Ok(history) => {
                info!(client_id = %self.client_id, count = history.len(), "session: history loaded");
                Ok(history)
            }
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "session: history fetch failed");
                Err(ChatError::StoreUnavailable(e))
            }
        }
    }

    /// Bind this session to `raw_user_id` and publish presence.
    ///
    /// # Errors
    ///
    /// `MalformedPayload` for a blank id, `AlreadyIdentified` when bound to a
    /// different user, `SessionClosed` after disconnect or eviction.
    pub async fn on_identify(&mut self, raw_user_id: Option<&str>) -> Result<UserId, ChatError> {
        let user_id = raw_user_id
            .and_then(UserId::parse)
            .ok_or_else(|| ChatError::MalformedPayload("user_id required".into()))?;

        match &self.state {
            SessionState::Closed => return Err(ChatError::SessionClosed),
            SessionState::Identified(bound) if *bound != user_id => {
                return Err(ChatError::AlreadyIdentified(bound.clone()));
            }
            _ => {}
        }

        if !self.hub.identify(self.client_id, user_id.clone()).await {
            self.state = SessionState::Closed;
            return Err(ChatError::SessionClosed);
        }
        self.state = SessionState::Identified(user_id.clone());
        Ok(user_id)
    }

    /// Validate, persist, then broadcast a chat message to every session.
    ///
    /// # Errors
    ///
    /// `NotIdentified`/`SessionClosed` for the wrong state,
    /// `IdentityMismatch` for a spoofed sender, `MalformedPayload` for bad
    /// fields, `StoreUnavailable` if the append fails. Nothing is broadcast
    /// on any error.
    pub async fn on_send_message(&mut self, payload: SendMessage) -> Result<ChatMessage, ChatError> {
        let bound = match &self.state {
            SessionState::Identified(user_id) => user_id.clone(),
            SessionState::Connecting => return Err(ChatError::NotIdentified),
            SessionState::Closed => return Err(ChatError::SessionClosed),
        };

        let new_message = self.validate(bound, payload)?;

        let persisted = match self.store.append(new_message).await {
            Ok(m) => m,
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "session: message persist failed; not broadcast");
                return Err(ChatError::StoreUnavailable(e));
            }
        };

        info!(client_id = %self.client_id, id = %persisted.id, sender_id = %persisted.sender_id, "session: message persisted");
        self.hub.broadcast(&hub::message_frame(&persisted)).await;
        Ok(persisted)
    }

    fn validate(&self, bound: UserId, payload: SendMessage) -> Result<NewChatMessage, ChatError> {
        if let Some(claimed) = payload.sender_id.as_deref() {
            if claimed.trim() != bound.as_str() {
                return Err(ChatError::IdentityMismatch { claimed: claimed.to_string(), bound });
            }
        }

        let sender_name = payload
            .sender_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ChatError::MalformedPayload("sender_name required".into()))?;

        let message = payload
            .message
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| ChatError::MalformedPayload("message required".into()))?;

        let len = message.chars().count();
        if len > self.config.max_message_len {
            return Err(ChatError::MalformedPayload(format!(
                "message too long ({len} > {} chars)",
                self.config.max_message_len
            )));
        }

        Ok(NewChatMessage { sender_id: bound, sender_name, message })
    }

    /// Leave the hub and publish the updated presence. Returns whether this
    /// call removed a presence entry; a second call always returns `false`.
    pub async fn on_disconnect(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        self.hub.detach(self.client_id).await
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
