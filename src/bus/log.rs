// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use super::BusError;

/// One message in a partition
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub offset: i64,
    pub key: String,
    pub payload: Vec<u8>,
    pub appended_at: DateTime<Utc>,
}

/// Append-only partitioned log with per-group committed offsets.
///
/// Offsets within a partition are dense and increase in append order.
/// A committed offset is the next offset the group will read.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append a message and return its offset
    async fn append(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<i64, BusError>;

    /// Up to `max` records with offset `>= from`, oldest first
    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: i64,
        max: usize,
    ) -> Result<Vec<LogRecord>, BusError>;

    /// Most recently appended record still retained
    async fn latest(&self, topic: &str, partition: u32) -> Result<Option<LogRecord>, BusError>;

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<i64, BusError>;

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: i64,
    ) -> Result<(), BusError>;

    /// Drop records of a partition below `keep_from`
    async fn compact(&self, topic: &str, partition: u32, keep_from: i64)
        -> Result<u64, BusError>;

    /// Drop records of every partition of `topic` appended before `before`
    async fn expire(&self, topic: &str, before: DateTime<Utc>) -> Result<u64, BusError>;
}

#[derive(Debug, Default)]
struct PartitionLog {
    next_offset: i64,
    records: VecDeque<LogRecord>,
}

#[derive(Debug, Default)]
struct LogState {
    partitions: HashMap<(String, u32), PartitionLog>,
    offsets: HashMap<(String, String, u32), i64>,
}

/// Process-local log, for single-process deployments and tests
#[derive(Debug, Default)]
pub struct MemoryLog {
    state: Mutex<LogState>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained records in a partition
    pub fn retained(&self, topic: &str, partition: u32) -> usize {
        self.state
            .lock()
            .partitions
            .get(&(topic.to_string(), partition))
            .map_or(0, |log| log.records.len())
    }
}

#[async_trait]
impl LogStore for MemoryLog {
    async fn append(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<i64, BusError> {
        let mut state = self.state.lock();
        let log = state
            .partitions
            .entry((topic.to_string(), partition))
            .or_default();
        let offset = log.next_offset;
        log.next_offset += 1;
        log.records.push_back(LogRecord {
            offset,
            key: key.to_string(),
            payload,
            appended_at: Utc::now(),
        });
        Ok(offset)
    }

    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: i64,
        max: usize,
    ) -> Result<Vec<LogRecord>, BusError> {
        let state = self.state.lock();
        let Some(log) = state.partitions.get(&(topic.to_string(), partition)) else {
            return Ok(Vec::new());
        };
        Ok(log
            .records
            .iter()
            .filter(|record| record.offset >= from)
            .take(max)
            .cloned()
            .collect())
    }

    async fn latest(&self, topic: &str, partition: u32) -> Result<Option<LogRecord>, BusError> {
        let state = self.state.lock();
        Ok(state
            .partitions
            .get(&(topic.to_string(), partition))
            .and_then(|log| log.records.back().cloned()))
    }

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<i64, BusError> {
        let state = self.state.lock();
        Ok(state
            .offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or(0))
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: i64,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock();
        state
            .offsets
            .insert((group.to_string(), topic.to_string(), partition), next_offset);
        Ok(())
    }

    async fn compact(
        &self,
        topic: &str,
        partition: u32,
        keep_from: i64,
    ) -> Result<u64, BusError> {
        let mut state = self.state.lock();
        let Some(log) = state.partitions.get_mut(&(topic.to_string(), partition)) else {
            return Ok(0);
        };
        let mut removed = 0;
        while log.records.front().map_or(false, |r| r.offset < keep_from) {
            log.records.pop_front();
            removed += 1;
        }
        Ok(removed)
    }

    async fn expire(&self, topic: &str, before: DateTime<Utc>) -> Result<u64, BusError> {
        let mut state = self.state.lock();
        let mut removed = 0;
        for ((log_topic, _), log) in state.partitions.iter_mut() {
            if log_topic != topic {
                continue;
            }
            while log.records.front().map_or(false, |r| r.appended_at < before) {
                log.records.pop_front();
                removed += 1;
            }
        }
        Ok(removed)
    }
}
