use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event kind constants used inside checkpoints.
///
/// The numeric values are stable and ordered so that, within one block,
/// block events sort before transaction events, which sort before trace
/// events, which sort before log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Blocks = 0,
    Transactions = 1,
    Traces = 2,
    Logs = 3,
}

impl EventKind {
    pub fn as_digit(&self) -> u8 {
        *self as u8
    }

    fn from_digit(digit: u8) -> Option<EventKind> {
        match digit {
            0 => Some(EventKind::Blocks),
            1 => Some(EventKind::Transactions),
            2 => Some(EventKind::Traces),
            3 => Some(EventKind::Logs),
            _ => None,
        }
    }
}

const TIMESTAMP_WIDTH: usize = 10;
const CHAIN_ID_WIDTH: usize = 16;
const BLOCK_NUMBER_WIDTH: usize = 16;
const TRANSACTION_INDEX_WIDTH: usize = 16;
const EVENT_KIND_WIDTH: usize = 1;
const EVENT_INDEX_WIDTH: usize = 16;

pub const CHECKPOINT_LENGTH: usize = TIMESTAMP_WIDTH
    + CHAIN_ID_WIDTH
    + BLOCK_NUMBER_WIDTH
    + TRANSACTION_INDEX_WIDTH
    + EVENT_KIND_WIDTH
    + EVENT_INDEX_WIDTH;

/// Fixed-width encoding of `(block_timestamp, chain_id, block_number,
/// transaction_index, event_kind, event_index)`.
///
/// All components are zero-padded decimal, so lexicographic comparison of the
/// encoded strings matches tuple ordering. This is what gives the event
/// stream its global order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checkpoint(String);

#[derive(Error, Debug)]
pub enum CheckpointDecodeError {
    #[error("checkpoint has length {0}, expected {CHECKPOINT_LENGTH}")]
    BadLength(usize),

    #[error("checkpoint component is not a decimal number: {0}")]
    BadComponent(String),

    #[error("unknown event kind digit: {0}")]
    BadEventKind(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointParts {
    pub block_timestamp: u64,
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub event_kind: EventKind,
    pub event_index: u64,
}

impl Checkpoint {
    pub fn encode(parts: CheckpointParts) -> Checkpoint {
        let mut out = String::with_capacity(CHECKPOINT_LENGTH);
        out.push_str(&format!("{:010}", parts.block_timestamp));
        out.push_str(&format!("{:016}", parts.chain_id));
        out.push_str(&format!("{:016}", parts.block_number));
        out.push_str(&format!("{:016}", parts.transaction_index));
        out.push_str(&format!("{}", parts.event_kind.as_digit()));
        out.push_str(&format!("{:016}", parts.event_index));
        Checkpoint(out)
    }

    pub fn decode(&self) -> Result<CheckpointParts, CheckpointDecodeError> {
        if self.0.len() != CHECKPOINT_LENGTH {
            return Err(CheckpointDecodeError::BadLength(self.0.len()));
        }

        let parse = |s: &str| -> Result<u64, CheckpointDecodeError> {
            s.parse::<u64>().map_err(|_| CheckpointDecodeError::BadComponent(s.to_string()))
        };

        let encoded = self.0.as_str();
        let mut cursor = 0usize;
        let mut bounds = |width: usize| {
            let range = cursor..cursor + width;
            cursor += width;
            range
        };

        let block_timestamp = parse(&encoded[bounds(TIMESTAMP_WIDTH)])?;
        let chain_id = parse(&encoded[bounds(CHAIN_ID_WIDTH)])?;
        let block_number = parse(&encoded[bounds(BLOCK_NUMBER_WIDTH)])?;
        let transaction_index = parse(&encoded[bounds(TRANSACTION_INDEX_WIDTH)])?;
        let kind_digit = parse(&encoded[bounds(EVENT_KIND_WIDTH)])? as u8;
        let event_kind = EventKind::from_digit(kind_digit)
            .ok_or(CheckpointDecodeError::BadEventKind(kind_digit))?;
        let event_index = parse(&encoded[bounds(EVENT_INDEX_WIDTH)])?;

        Ok(CheckpointParts {
            block_timestamp,
            chain_id,
            block_number,
            transaction_index,
            event_kind,
            event_index,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Smallest checkpoint at or after the given block, used when rewinding
    /// streams to a reorg ancestor.
    pub fn block_floor(block_timestamp: u64, chain_id: u64, block_number: u64) -> Checkpoint {
        Checkpoint::encode(CheckpointParts {
            block_timestamp,
            chain_id,
            block_number,
            transaction_index: 0,
            event_kind: EventKind::Blocks,
            event_index: 0,
        })
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(ts: u64, block: u64, tx: u64, kind: EventKind, index: u64) -> CheckpointParts {
        CheckpointParts {
            block_timestamp: ts,
            chain_id: 1,
            block_number: block,
            transaction_index: tx,
            event_kind: kind,
            event_index: index,
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let original = parts(1_700_000_000, 123_456, 42, EventKind::Logs, 7);
        let checkpoint = Checkpoint::encode(original);
        assert_eq!(checkpoint.as_str().len(), CHECKPOINT_LENGTH);
        assert_eq!(checkpoint.decode().unwrap(), original);
    }

    #[test]
    fn test_string_order_matches_tuple_order() {
        let earlier = Checkpoint::encode(parts(100, 5, 0, EventKind::Blocks, 0));
        let later_block = Checkpoint::encode(parts(100, 6, 0, EventKind::Blocks, 0));
        let later_ts = Checkpoint::encode(parts(101, 1, 0, EventKind::Blocks, 0));

        assert!(earlier < later_block);
        assert!(later_block < later_ts);
        assert!(earlier.as_str() < later_block.as_str());
    }

    #[test]
    fn checkpoint_orders_kinds_within_block() {
        let block = Checkpoint::encode(parts(100, 5, 0, EventKind::Blocks, 0));
        let txn = Checkpoint::encode(parts(100, 5, 0, EventKind::Transactions, 0));
        let trace = Checkpoint::encode(parts(100, 5, 0, EventKind::Traces, 0));
        let log = Checkpoint::encode(parts(100, 5, 0, EventKind::Logs, 0));

        assert!(block < txn);
        assert!(txn < trace);
        assert!(trace < log);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(Checkpoint("123".to_string()).decode().is_err());

        let mut valid = Checkpoint::encode(parts(1, 1, 1, EventKind::Blocks, 1)).0;
        let kind_offset = TIMESTAMP_WIDTH + CHAIN_ID_WIDTH + BLOCK_NUMBER_WIDTH + TRANSACTION_INDEX_WIDTH;
        valid.replace_range(kind_offset..kind_offset + 1, "9");
        assert!(matches!(
            Checkpoint(valid).decode(),
            Err(CheckpointDecodeError::BadEventKind(9))
        ));
    }
}
