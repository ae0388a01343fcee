//! Batch identity.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Message;

/// Inclusive row-number range of a bulk export batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowRange {
    pub first: i64,
    pub last: i64,
}

impl RowRange {
    pub fn new(first: i64, last: i64) -> Self {
        Self { first, last }
    }

    /// Number of row numbers covered by the range.
    pub fn len(&self) -> u64 {
        if self.last < self.first {
            0
        } else {
            (self.last - self.first + 1) as u64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for RowRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

/// Identifies the set of messages dequeued or read together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchId {
    /// Continuous relay: the oldest N rows, identified by their key bounds.
    Sequence { first: i64, last: i64 },
    /// Bulk export: a row-number range of the snapshot table.
    Rows(RowRange),
}

impl BatchId {
    /// Key bounds of a continuous-mode batch. `None` for an empty slice.
    pub fn for_messages(messages: &[Message]) -> Option<Self> {
        let first = messages.iter().map(|m| m.sequence_key).min()?;
        let last = messages.iter().map(|m| m.sequence_key).max()?;
        Some(BatchId::Sequence { first, last })
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchId::Sequence { first, last } => write!(f, "seq {first}..={last}"),
            BatchId::Rows(range) => write!(f, "rows {range}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OperationType;

    #[test]
    fn test_row_range_len() {
        assert_eq!(RowRange::new(1, 1000).len(), 1000);
        assert_eq!(RowRange::new(5, 5).len(), 1);
        assert!(RowRange::new(6, 5).is_empty());
    }

    #[test]
    fn test_batch_id_from_messages_uses_key_bounds() {
        let messages = vec![
            Message::new(12, "A", OperationType::Insert, ""),
            Message::new(10, "B", OperationType::Insert, ""),
            Message::new(15, "A", OperationType::Delete, ""),
        ];
        assert_eq!(
            BatchId::for_messages(&messages),
            Some(BatchId::Sequence { first: 10, last: 15 })
        );
        assert_eq!(BatchId::for_messages(&[]), None);
    }

    #[test]
    fn test_batch_id_display() {
        assert_eq!(
            BatchId::Sequence { first: 1, last: 5 }.to_string(),
            "seq 1..=5"
        );
        assert_eq!(
            BatchId::Rows(RowRange::new(1001, 2000)).to_string(),
            "rows 1001-2000"
        );
    }
}
