//! Time-sorted message identifiers.
//!
//! Ids are assigned before the first persistence attempt so that retries are
//! idempotent: the durable store treats the id as its primary key and a
//! duplicate insert is a no-op. The creation timestamp is derived from the
//! id itself, so a retried write never reads the clock twice.
//!
//! Layout (63 bits used):
//!
//! ```text
//! | 41 bits millis since 2020-01-01 | 10 bits node | 12 bits sequence |
//! ```
//!
//! Numeric order and the Crockford base32 string order agree, which is what
//! lets both the database index and the cache tier sort history naturally.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// 2020-01-01T00:00:00Z.
const EPOCH_MS: i64 = 1_577_836_800_000;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const SEQUENCE_MASK: u16 = (1 << SEQUENCE_BITS) - 1;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ENCODED_LEN: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct MessageId(i64);

impl MessageId {
    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    /// The instant this id was generated, recovered from the timestamp bits.
    pub fn created_at(self) -> DateTime<Utc> {
        let millis = (self.0 >> (NODE_BITS + SEQUENCE_BITS)) + EPOCH_MS;
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_default()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0 as u64;
        let mut out = [0u8; ENCODED_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            // The top character only carries the high 4 bits.
            let shift = 5 * (ENCODED_LEN - 1 - i) as u32;
            *slot = ALPHABET[((v >> shift) & 0x1f) as usize];
        }
        f.write_str(std::str::from_utf8(&out).expect("base32 output is ascii"))
    }
}

impl FromStr for MessageId {
    type Err = ParseMessageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ENCODED_LEN {
            return Err(ParseMessageIdError);
        }
        let mut v: u64 = 0;
        for c in s.bytes() {
            let digit = decode_char(c).ok_or(ParseMessageIdError)?;
            v = (v << 5) | u64::from(digit);
        }
        Ok(Self(v as i64))
    }
}

fn decode_char(c: u8) -> Option<u8> {
    match c.to_ascii_uppercase() {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'H' => Some(c.to_ascii_uppercase() - b'A' + 10),
        b'J' | b'K' => Some(c.to_ascii_uppercase() - b'A' + 9),
        b'M' | b'N' => Some(c.to_ascii_uppercase() - b'A' + 8),
        b'P'..=b'T' => Some(c.to_ascii_uppercase() - b'A' + 7),
        b'V'..=b'Z' => Some(c.to_ascii_uppercase() - b'A' + 6),
        _ => None,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseMessageIdError;

impl fmt::Display for ParseMessageIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid message id")
    }
}

impl std::error::Error for ParseMessageIdError {}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Generates unique, monotonically increasing [`MessageId`]s.
///
/// Safe to share across writer tasks. When the per-millisecond sequence is
/// exhausted the generator borrows the next millisecond instead of ever
/// reusing a value, so `generate` has no error path.
pub struct TsidFactory {
    node: u16,
    state: Mutex<GeneratorState>,
}

struct GeneratorState {
    last_ms: i64,
    sequence: u16,
}

impl TsidFactory {
    pub fn new(node: u16) -> Self {
        Self {
            node: node & ((1 << NODE_BITS) - 1),
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    /// A factory with a random node id, for deployments that do not assign
    /// node numbers explicitly.
    pub fn from_random_node() -> Self {
        Self::new(rand::random::<u16>())
    }

    pub fn generate(&self) -> MessageId {
        let mut state = self.state.lock().expect("id generator lock poisoned");

        let mut now = Utc::now().timestamp_millis() - EPOCH_MS;
        // Never move backwards, even if the wall clock does.
        if now < state.last_ms {
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = state.sequence.wrapping_add(1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted within this millisecond.
                now += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let raw = (now << (NODE_BITS + SEQUENCE_BITS))
            | (i64::from(self.node) << SEQUENCE_BITS)
            | i64::from(state.sequence);
        MessageId(raw)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let factory = TsidFactory::new(1);
        let mut prev = factory.generate();
        for _ in 0..10_000 {
            let next = factory.generate();
            assert!(next > prev, "{next:?} should sort after {prev:?}");
            prev = next;
        }
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let factory = Arc::new(TsidFactory::new(7));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let factory = Arc::clone(&factory);
                std::thread::spawn(move || {
                    (0..2000).map(|_| factory.generate()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id.raw()), "duplicate id {id}");
            }
        }
    }

    #[test]
    fn string_form_round_trips() {
        let factory = TsidFactory::new(42);
        let id = factory.generate();
        let encoded = id.to_string();
        assert_eq!(encoded.len(), 13);
        assert_eq!(encoded.parse::<MessageId>().unwrap(), id);
    }

    #[test]
    fn string_order_matches_numeric_order() {
        let factory = TsidFactory::new(3);
        let a = factory.generate();
        let b = factory.generate();
        assert!(b.raw() > a.raw());
        assert!(b.to_string() > a.to_string());
    }

    #[test]
    fn created_at_is_derived_from_the_id() {
        let factory = TsidFactory::new(0);
        let before = Utc::now();
        let id = factory.generate();
        let after = Utc::now();

        let derived = id.created_at();
        assert!(derived >= before - chrono::Duration::milliseconds(2));
        assert!(derived <= after + chrono::Duration::milliseconds(2));
    }

    #[test]
    fn serde_uses_the_string_form() {
        let id = MessageId::from_raw(123_456_789_012_345);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        assert_eq!(serde_json::from_str::<MessageId>(&json).unwrap(), id);
    }
}
