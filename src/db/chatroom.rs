use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::chatroom::ChatRoomMetadata;
use crate::error::Error;

impl ChatRoomMetadata {
    /// Finds the room for a member pair, creating it if absent. Member ids
    /// are normalized so (a, b) and (b, a) resolve to the same room.
    pub async fn ensure(
        db: &mut SqliteConnection,
        member_a: i64,
        member_b: i64,
    ) -> Result<ChatRoomMetadata, Error> {
        let (member1_id, member2_id) = if member_a <= member_b {
            (member_a, member_b)
        } else {
            (member_b, member_a)
        };

        if let Some(existing) = Self::find_by_members(db, member1_id, member2_id).await? {
            return Ok(existing);
        }

        Ok(sqlx::query_as(
            "INSERT INTO chatrooms (member1_id, member2_id) VALUES ($1, $2) \
             RETURNING chatroom_id, member1_id, member2_id, last_message_preview, \
                       last_message_at, mem1_last_read_at, mem2_last_read_at",
        )
        .bind(member1_id)
        .bind(member2_id)
        .fetch_one(db)
        .await?)
    }

    pub async fn find(
        db: &mut SqliteConnection,
        chatroom_id: i64,
    ) -> Result<Option<ChatRoomMetadata>, Error> {
        Ok(sqlx::query_as(
            "SELECT chatroom_id, member1_id, member2_id, last_message_preview, \
                    last_message_at, mem1_last_read_at, mem2_last_read_at \
             FROM chatrooms WHERE chatroom_id = $1",
        )
        .bind(chatroom_id)
        .fetch_optional(db)
        .await?)
    }

    async fn find_by_members(
        db: &mut SqliteConnection,
        member1_id: i64,
        member2_id: i64,
    ) -> Result<Option<ChatRoomMetadata>, Error> {
        Ok(sqlx::query_as(
            "SELECT chatroom_id, member1_id, member2_id, last_message_preview, \
                    last_message_at, mem1_last_read_at, mem2_last_read_at \
             FROM chatrooms WHERE member1_id = $1 AND member2_id = $2",
        )
        .bind(member1_id)
        .bind(member2_id)
        .fetch_optional(db)
        .await?)
    }

    /// Folds an accepted message into the room row: preview and
    /// last-message time advance only when the message timestamp is not
    /// older than what is already there, and the sender's own read time is
    /// stamped. Timestamps only ever move forward, so replays and races
    /// cannot roll the summary back.
    pub async fn apply_message_update(
        db: &mut SqliteConnection,
        chatroom_id: i64,
        preview: &str,
        at: DateTime<Utc>,
        sender_id: i64,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE chatrooms SET \
               last_message_preview = CASE \
                 WHEN last_message_at IS NULL OR last_message_at <= $2 THEN $1 \
                 ELSE last_message_preview END, \
               mem1_last_read_at = CASE \
                 WHEN member1_id = $3 AND (mem1_last_read_at IS NULL OR mem1_last_read_at <= $2) THEN $2 \
                 ELSE mem1_last_read_at END, \
               mem2_last_read_at = CASE \
                 WHEN member2_id = $3 AND (mem2_last_read_at IS NULL OR mem2_last_read_at <= $2) THEN $2 \
                 ELSE mem2_last_read_at END, \
               last_message_at = CASE \
                 WHEN last_message_at IS NULL OR last_message_at <= $2 THEN $2 \
                 ELSE last_message_at END \
             WHERE chatroom_id = $4",
        )
        .bind(preview)
        .bind(at)
        .bind(sender_id)
        .bind(chatroom_id)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Direct read-receipt write, used when the cache tier could not take
    /// the update. Returns `false` when the user is not a member of the
    /// room.
    pub async fn apply_read_update(
        db: &mut SqliteConnection,
        chatroom_id: i64,
        user_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE chatrooms SET \
               mem1_last_read_at = CASE \
                 WHEN member1_id = $2 AND (mem1_last_read_at IS NULL OR mem1_last_read_at <= $3) THEN $3 \
                 ELSE mem1_last_read_at END, \
               mem2_last_read_at = CASE \
                 WHEN member2_id = $2 AND (mem2_last_read_at IS NULL OR mem2_last_read_at <= $3) THEN $3 \
                 ELSE mem2_last_read_at END \
             WHERE chatroom_id = $1 AND (member1_id = $2 OR member2_id = $2)",
        )
        .bind(chatroom_id)
        .bind(user_id)
        .bind(at)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reconciles a cached metadata document into the room row. Every field
    /// merges monotonically: reconciliation may lag behind direct fallback
    /// writes and must never undo them.
    pub async fn sync_from_cache(&self, db: &mut SqliteConnection) -> Result<(), Error> {
        sqlx::query(
            "UPDATE chatrooms SET \
               last_message_preview = CASE \
                 WHEN $2 IS NOT NULL AND (last_message_at IS NULL OR last_message_at <= $2) \
                 THEN COALESCE($1, last_message_preview) \
                 ELSE last_message_preview END, \
               last_message_at = CASE \
                 WHEN $2 IS NOT NULL AND (last_message_at IS NULL OR last_message_at <= $2) THEN $2 \
                 ELSE last_message_at END, \
               mem1_last_read_at = CASE \
                 WHEN $3 IS NOT NULL AND (mem1_last_read_at IS NULL OR mem1_last_read_at <= $3) THEN $3 \
                 ELSE mem1_last_read_at END, \
               mem2_last_read_at = CASE \
                 WHEN $4 IS NOT NULL AND (mem2_last_read_at IS NULL OR mem2_last_read_at <= $4) THEN $4 \
                 ELSE mem2_last_read_at END \
             WHERE chatroom_id = $5",
        )
        .bind(&self.last_message_preview)
        .bind(self.last_message_at)
        .bind(self.mem1_last_read_at)
        .bind(self.mem2_last_read_at)
        .bind(self.chatroom_id)
        .execute(db)
        .await?;
        Ok(())
    }
}
