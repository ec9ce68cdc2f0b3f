use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

/// Per-chatroom summary state kept in both the cache tier and the durable
/// store. Rooms have exactly two participants; read times are tracked per
/// member slot.
///
/// `last_message_at` only ever advances: concurrent writers race by
/// timestamp, last writer by message time wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ChatRoomMetadata {
    pub chatroom_id: i64,
    pub member1_id: i64,
    pub member2_id: i64,
    pub last_message_preview: Option<String>,
    #[serde(with = "rfc3339_micros")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(with = "rfc3339_micros")]
    pub mem1_last_read_at: Option<DateTime<Utc>>,
    #[serde(with = "rfc3339_micros")]
    pub mem2_last_read_at: Option<DateTime<Utc>>,
}

/// Fixed-width RFC 3339 (always six fractional digits) for the serialized
/// metadata document. The cache tier's atomic update scripts compare these
/// strings lexicographically, which is only chronological when every writer
/// emits the same width.
mod rfc3339_micros {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => {
                serializer.serialize_some(&at.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|at| at.with_timezone(&Utc))
                .map_err(de::Error::custom)
        })
        .transpose()
    }
}

impl ChatRoomMetadata {
    pub fn is_member(&self, user_id: i64) -> bool {
        self.member1_id == user_id || self.member2_id == user_id
    }

    /// Mutable handle on the read-time slot belonging to `user_id`.
    pub fn read_slot_mut(&mut self, user_id: i64) -> Option<&mut Option<DateTime<Utc>>> {
        if self.member1_id == user_id {
            Some(&mut self.mem1_last_read_at)
        } else if self.member2_id == user_id {
            Some(&mut self.mem2_last_read_at)
        } else {
            None
        }
    }

    /// Folds a newly accepted message into the summary: preview, monotonic
    /// last-message time, and the sender's own read time.
    pub fn apply_message(&mut self, preview: &str, at: DateTime<Utc>, sender_id: i64) {
        // Last writer by message timestamp wins; a tie goes to the later
        // arrival. A stale writer never rolls the summary backwards.
        if self.last_message_at.map_or(true, |existing| existing <= at) {
            self.last_message_at = Some(at);
            self.last_message_preview = Some(preview.to_owned());
        }
        if let Some(slot) = self.read_slot_mut(sender_id) {
            if slot.map_or(true, |existing| existing <= at) {
                *slot = Some(at);
            }
        }
    }
}
