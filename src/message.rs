//! Message types for the durability pipeline.
//!
//! A message exists in three shapes: the immutable [`MessageCreationContext`]
//! built by the producer before the first persistence attempt, the
//! [`QueueEntry`] wrapper that rides the sharded write queue, and the
//! [`StoredMessage`] row image used by the durable store, the history cache
//! and the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::error::Error;
use crate::id::MessageId;

/// Upper bound on message content, in characters. Matches the durable
/// store's column budget.
pub const MAX_CONTENT_CHARS: usize = 2000;

/// Everything needed to persist one new chat message.
///
/// Built once by the producer and never mutated. The id is assigned before
/// any write is attempted, so retrying through either path cannot duplicate
/// a row, and the creation time is derived from the id so retries are
/// time-consistent.
///
/// `content` may be empty: attachment-only messages are composed upstream
/// and carry no text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCreationContext {
    pub message_id: MessageId,
    pub chatroom_id: i64,
    pub sender_id: i64,
    pub content: String,
    pub reply_to_id: Option<MessageId>,
}

impl MessageCreationContext {
    pub fn created_at(&self) -> DateTime<Utc> {
        self.message_id.created_at()
    }

    /// Rejects defective contexts before any I/O happens.
    pub fn validate(&self) -> Result<(), Error> {
        if self.chatroom_id <= 0 {
            return Err(Error::validation("chatroom_id must be positive"));
        }
        if self.sender_id <= 0 {
            return Err(Error::validation("sender_id must be positive"));
        }
        if self.content.chars().count() > MAX_CONTENT_CHARS {
            return Err(Error::validation(format!(
                "content exceeds {MAX_CONTENT_CHARS} characters"
            )));
        }
        Ok(())
    }

    pub fn to_stored(&self) -> StoredMessage {
        StoredMessage {
            message_id: self.message_id,
            chatroom_id: self.chatroom_id,
            sender_id: self.sender_id,
            content: self.content.clone(),
            reply_to_id: self.reply_to_id,
            created_at: self.created_at(),
        }
    }
}

/// Row image of a persisted (or accepted-for-persistence) message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub chatroom_id: i64,
    pub sender_id: i64,
    pub content: String,
    pub reply_to_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

/// What actually sits in a queue shard: the context plus how many flush
/// attempts it has survived, so a poison entry can be isolated instead of
/// blocking its shard forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(flatten)]
    pub context: MessageCreationContext,
    #[serde(default)]
    pub attempts: u32,
}

impl QueueEntry {
    pub fn new(context: MessageCreationContext) -> Self {
        Self {
            context,
            attempts: 0,
        }
    }
}

/// Truncates content to the configured preview budget on a char boundary.
pub fn truncate_preview(content: &str, max_chars: usize) -> String {
    content.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TsidFactory;

    fn context(content: &str) -> MessageCreationContext {
        MessageCreationContext {
            message_id: TsidFactory::new(1).generate(),
            chatroom_id: 42,
            sender_id: 7,
            content: content.to_owned(),
            reply_to_id: None,
        }
    }

    #[test]
    fn created_at_comes_from_the_id() {
        let ctx = context("hi");
        assert_eq!(ctx.created_at(), ctx.message_id.created_at());
        assert_eq!(ctx.to_stored().created_at, ctx.created_at());
    }

    #[test]
    fn empty_content_is_accepted() {
        assert!(context("").validate().is_ok());
    }

    #[test]
    fn oversized_content_is_rejected() {
        let big = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            context(&big).validate(),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let mut ctx = context("hi");
        ctx.chatroom_id = 0;
        assert!(ctx.validate().is_err());

        let mut ctx = context("hi");
        ctx.sender_id = -3;
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn queue_entry_round_trips_through_json() {
        let entry = QueueEntry::new(context("payload"));
        let json = serde_json::to_string(&entry).unwrap();
        let back: QueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.context, entry.context);
        assert_eq!(back.attempts, 0);
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        assert_eq!(truncate_preview("héllo wörld", 5), "héllo");
        assert_eq!(truncate_preview("short", 200), "short");
    }
}
