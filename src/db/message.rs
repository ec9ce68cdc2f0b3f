use itertools::Itertools;
use sqlx::SqliteConnection;

use crate::error::Error;
use crate::id::MessageId;
use crate::message::StoredMessage;

impl StoredMessage {
    /// Inserts the message, treating a duplicate id as a no-op.
    ///
    /// The message id is the idempotency backstop: the same context flushed
    /// once through the background loop and once through a forced fallback
    /// must still produce exactly one row.
    pub async fn insert(&self, db: &mut SqliteConnection) -> Result<bool, Error> {
        let result = sqlx::query(
            "INSERT INTO messages (message_id, chatroom_id, sender_id, content, reply_to_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(self.message_id)
        .bind(self.chatroom_id)
        .bind(self.sender_id)
        .bind(&self.content)
        .bind(self.reply_to_id)
        .bind(self.created_at)
        .execute(db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Newest-window-first page of a room's history.
    pub async fn find_latest(
        db: &mut SqliteConnection,
        chatroom_id: i64,
        page: usize,
        size: usize,
    ) -> Result<Vec<StoredMessage>, Error> {
        Ok(sqlx::query_as(
            "SELECT message_id, chatroom_id, sender_id, content, reply_to_id, created_at \
             FROM messages WHERE chatroom_id = $1 \
             ORDER BY message_id DESC LIMIT $2 OFFSET $3",
        )
        .bind(chatroom_id)
        .bind(size as i64)
        .bind((page * size) as i64)
        .fetch_all(db)
        .await?)
    }

    pub async fn find_by_id(
        db: &mut SqliteConnection,
        message_id: MessageId,
    ) -> Result<Option<StoredMessage>, Error> {
        Ok(sqlx::query_as(
            "SELECT message_id, chatroom_id, sender_id, content, reply_to_id, created_at \
             FROM messages WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_optional(db)
        .await?)
    }

    /// Batched lookup for resolving reply-to references without one round
    /// trip per message.
    pub async fn find_all_by_id(
        db: &mut SqliteConnection,
        message_ids: &[MessageId],
    ) -> Result<Vec<StoredMessage>, Error> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = message_ids.iter().map(|_| "?").join(", ");
        let sql = format!(
            "SELECT message_id, chatroom_id, sender_id, content, reply_to_id, created_at \
             FROM messages WHERE message_id IN ({placeholders})"
        );

        let mut query = sqlx::query_as(&sql);
        for id in message_ids {
            query = query.bind(*id);
        }
        Ok(query.fetch_all(db).await?)
    }
}
