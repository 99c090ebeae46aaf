// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Partitioned, durable relay between the ingestor and its consumers.
//!
//! Messages are keyed by repository DID and routed to a partition by a
//! stable hash, so every mutation of one repository lands on one partition
//! and is consumed in the order it was appended.

pub mod consumer;
pub mod cursor_store;
pub mod log;
pub mod pg_log;
pub mod producer;

use thiserror::Error;

pub use consumer::{run_retention, Backoff, ConsumerGroup, EventHandler};
pub use cursor_store::LogCursorStore;
pub use log::{LogRecord, LogStore, MemoryLog};
pub use pg_log::PgLog;
pub use producer::{DeliveryCallback, Producer};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("relay backend error: {0}")]
    Backend(String),
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("producer is closed")]
    Closed,
}

impl BusError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        BusError::Backend(err.to_string())
    }
}

impl From<diesel::result::Error> for BusError {
    fn from(err: diesel::result::Error) -> Self {
        BusError::Backend(err.to_string())
    }
}

/// Partition of `key`: 32-bit FNV-1a modulo the partition count
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let hash = key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(PRIME)
    });
    hash % partitions.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitioning_is_stable() {
        // Reference FNV-1a values
        assert_eq!(partition_for("", u32::MAX), 0x811c_9dc5);
        assert_eq!(partition_for("a", u32::MAX), 0xe40c_292c);

        let first = partition_for("did:plc:abc", 24);
        for _ in 0..10 {
            assert_eq!(partition_for("did:plc:abc", 24), first);
        }
        assert!(first < 24);
        assert_eq!(partition_for("did:plc:abc", 1), 0);
    }

    #[test]
    fn keys_spread_over_partitions() {
        let used: std::collections::HashSet<u32> = (0..500)
            .map(|i| partition_for(&format!("did:plc:{}", i), 24))
            .collect();
        assert!(used.len() > 20);
    }
}
