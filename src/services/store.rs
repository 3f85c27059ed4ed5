//! Message store — durable append-only chat log.
//!
//! DESIGN
//! ======
//! `MessageStore` is the seam between the chat core and persistence. The
//! Postgres implementation is used when `DATABASE_URL` is configured; the
//! in-memory one backs dev runs without a database and the test suite.
//!
//! Timestamps come from `MessageClock`, never from the client. The clock is
//! strictly increasing across the process, so two messages persisted one
//! after the other always order the same way they were sent.

use std::sync::Mutex;

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::state::{ChatMessage, UserId};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        "E_STORE_UNAVAILABLE"
    }

    fn retryable(&self) -> bool {
        true
    }
}

/// A validated message waiting to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChatMessage {
    pub sender_id: UserId,
    pub sender_name: String,
    pub message: String,
}

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, assigning its id and timestamp.
    async fn append(&self, message: NewChatMessage) -> Result<ChatMessage, StoreError>;

    /// Full history, oldest first.
    async fn list_ordered_by_time(&self) -> Result<Vec<ChatMessage>, StoreError>;
}

// =============================================================================
// CLOCK
// =============================================================================

/// Strictly increasing microsecond clock for message timestamps.
///
/// Microseconds match Postgres `timestamptz` precision, so a value never
/// changes on its way through the database.
pub struct MessageClock {
    last: Mutex<Option<OffsetDateTime>>,
}

impl MessageClock {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_after(None)
    }

    /// Resume after the newest persisted timestamp so a restart with a
    /// lagging wall clock cannot reorder history.
    #[must_use]
    pub fn starting_after(last: Option<OffsetDateTime>) -> Self {
        Self { last: Mutex::new(last) }
    }

    /// Next timestamp, never earlier than the current wall clock.
    pub fn next(&self) -> OffsetDateTime {
        self.next_after(OffsetDateTime::now_utc())
    }

    pub(crate) fn next_after(&self, now: OffsetDateTime) -> OffsetDateTime {
        let now = ceil_to_micros(now);
        let mut last = self.last.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let ts = match *last {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(ts);
        ts
    }
}

impl Default for MessageClock {
    fn default() -> Self {
        Self::new()
    }
}

fn ceil_to_micros(ts: OffsetDateTime) -> OffsetDateTime {
    let sub_micro = ts.nanosecond() % 1_000;
    if sub_micro == 0 {
        return ts;
    }
    ts + Duration::nanoseconds(i64::from(1_000 - sub_micro))
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// Process-local store. History is lost on restart.
pub struct MemoryMessageStore {
    messages: RwLock<Vec<ChatMessage>>,
    clock: MessageClock,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self { messages: RwLock::new(Vec::new()), clock: MessageClock::new() }
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: NewChatMessage) -> Result<ChatMessage, StoreError> {
        let mut messages = self.messages.write().await;
        // Stamp under the lock so the vec stays sorted by timestamp.
        let persisted = ChatMessage {
            id: Uuid::new_v4(),
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            message: message.message,
            timestamp: self.clock.next(),
        };
        messages.push(persisted.clone());
        Ok(persisted)
    }

    async fn list_ordered_by_time(&self) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self.messages.read().await.clone())
    }
}

// =============================================================================
// POSTGRES STORE
// =============================================================================

pub struct PgMessageStore {
    pool: PgPool,
    clock: MessageClock,
}

impl PgMessageStore {
    /// Wrap a migrated pool, seeding the clock from the newest stored message.
    ///
    /// # Errors
    ///
    /// Returns a database error if the seed query fails.
    pub async fn open(pool: PgPool) -> Result<Self, StoreError> {
        let newest: Option<OffsetDateTime> = sqlx::query_scalar("SELECT MAX(sent_at) FROM chat_messages")
            .fetch_one(&pool)
            .await?;
        Ok(Self { pool, clock: MessageClock::starting_after(newest) })
    }
}

#[async_trait::async_trait]
impl MessageStore for PgMessageStore {
    async fn append(&self, message: NewChatMessage) -> Result<ChatMessage, StoreError> {
        let persisted = ChatMessage {
            id: Uuid::new_v4(),
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            message: message.message,
            timestamp: self.clock.next(),
        };
        sqlx::query("INSERT INTO chat_messages (id, sender_id, sender_name, message, sent_at) VALUES ($1, $2, $3, $4, $5)")
            .bind(persisted.id)
            .bind(persisted.sender_id.as_str())
            .bind(&persisted.sender_name)
            .bind(&persisted.message)
            .bind(persisted.timestamp)
            .execute(&self.pool)
            .await?;
        Ok(persisted)
    }

    async fn list_ordered_by_time(&self) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, String, String, String, OffsetDateTime)>(
            "SELECT id, sender_id, sender_name, message, sent_at \
             FROM chat_messages ORDER BY sent_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        // Rows with a blank sender cannot come from `append`; skip rather than fail history.
        Ok(rows
            .into_iter()
            .filter_map(|(id, sender_id, sender_name, message, timestamp)| {
                let sender_id = UserId::parse(&sender_id)?;
                Some(ChatMessage { id, sender_id, sender_name, message, timestamp })
            })
            .collect())
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
