//! Row log messages.
//!
//! A [`Message`] is the immutable record of one unit of deferred work tied to a row. Its
//! identity is the triple `(row_key, timestamp, seq_nr)`; the inline data and the payload
//! reference are advisory and do not take part in equality, hashing or ordering.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Identity of a message. Used as the key of row storage.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MessageId {
    pub row_key: Vec<u8>,
    pub timestamp: i64,
    pub seq_nr: i64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", RowKey(&self.row_key), self.timestamp, self.seq_nr)
    }
}

/// Reference to a payload stored next to the message in row storage.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct PayloadRef {
    /// Payload size in bytes.
    pub len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub row_key: Vec<u8>,
    pub timestamp: i64,
    pub seq_nr: i64,
    /// Small inline data supplied by the producer.
    pub data: Option<Vec<u8>>,
    /// Present when a large payload was stored out of band; fetch it with `RowLog::payload`.
    pub payload: Option<PayloadRef>,
}

impl Message {
    pub fn new(row_key: impl Into<Vec<u8>>, timestamp: i64, seq_nr: i64) -> Self {
        Self {
            row_key: row_key.into(),
            timestamp,
            seq_nr,
            data: None,
            payload: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_payload(mut self, payload: PayloadRef) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn id(&self) -> MessageId {
        MessageId {
            row_key: self.row_key.clone(),
            timestamp: self.timestamp,
            seq_nr: self.seq_nr,
        }
    }

    fn identity(&self) -> (&[u8], i64, i64) {
        (&self.row_key, self.timestamp, self.seq_nr)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Message {}

impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl Ord for Message {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}#{}",
            RowKey(&self.row_key),
            self.timestamp,
            self.seq_nr
        )
    }
}

/// Renders a row key as UTF-8 when printable, hex otherwise.
pub(crate) struct RowKey<'a>(pub &'a [u8]);

impl fmt::Display for RowKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => f.write_str(s),
            _ => {
                for b in self.0 {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};

    #[test]
    fn equality_ignores_data_and_payload() {
        let a = Message::new("row1", 10, 0).with_data(b"a".to_vec());
        let b = Message::new("row1", 10, 0).with_payload(PayloadRef { len: 4096 });
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn identity_differs_on_any_component() {
        let base = Message::new("row1", 10, 0);
        assert_ne!(base, Message::new("row2", 10, 0));
        assert_ne!(base, Message::new("row1", 11, 0));
        assert_ne!(base, Message::new("row1", 10, 1));
    }

    #[test]
    fn ordering_is_row_major_then_timestamp_then_sequence() {
        let set: BTreeSet<Message> = [
            Message::new("b", 1, 0),
            Message::new("a", 2, 0),
            Message::new("a", 1, 1),
            Message::new("a", 1, 0),
        ]
        .into_iter()
        .collect();
        let ids: Vec<_> = set.iter().map(|m| m.id()).collect();
        assert_eq!(
            ids,
            vec![
                Message::new("a", 1, 0).id(),
                Message::new("a", 1, 1).id(),
                Message::new("a", 2, 0).id(),
                Message::new("b", 1, 0).id(),
            ]
        );
    }

    #[test]
    fn display_uses_hex_for_binary_row_keys() {
        assert_eq!(Message::new("user/7", 5, 2).to_string(), "user/7@5#2");
        assert_eq!(Message::new(vec![0u8, 255], 5, 2).to_string(), "00ff@5#2");
    }
}
