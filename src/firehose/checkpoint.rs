// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Ingestion watermark and its periodic persistence.
//!
//! Workers process frames concurrently, so the watermark only tracks the
//! highest sequence observed. A periodic save is therefore a low-water mark
//! for resumption; the save performed on clean shutdown, after in-flight work
//! has drained, is authoritative.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::SequenceCursor;
use crate::metrics::SharedMetrics;

/// Where the ingestion cursor is persisted
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<SequenceCursor>>;

    async fn save(&self, cursor: SequenceCursor) -> anyhow::Result<()>;
}

/// Highest upstream sequence observed so far
#[derive(Debug, Default)]
pub struct Watermark {
    last: Mutex<Option<i64>>,
}

impl Watermark {
    pub fn new(initial: Option<i64>) -> Self {
        Self {
            last: Mutex::new(initial),
        }
    }

    pub fn observe(&self, seq: i64) {
        let mut last = self.last.lock();
        if last.map_or(true, |current| seq > current) {
            *last = Some(seq);
        }
    }

    pub fn get(&self) -> Option<i64> {
        *self.last.lock()
    }
}

/// Saves the watermark every `interval`, and once more on shutdown
pub struct Checkpointer {
    store: Arc<dyn CursorStore>,
    watermark: Arc<Watermark>,
    interval: Duration,
    metrics: SharedMetrics,
}

impl Checkpointer {
    pub fn new(
        store: Arc<dyn CursorStore>,
        watermark: Arc<Watermark>,
        interval: Duration,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            watermark,
            interval,
            metrics,
        }
    }

    /// Run until `stop` fires, then write the exit cursor.
    ///
    /// Aborting the task instead of cancelling `stop` skips the exit save,
    /// leaving the last periodic cursor in place.
    pub async fn run(self, stop: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => self.save(false).await,
            }
        }

        self.save(true).await;
    }

    async fn save(&self, saved_on_exit: bool) {
        let Some(sequence) = self.watermark.get() else {
            debug!("No sequence observed yet, skipping cursor save");
            return;
        };

        let cursor = SequenceCursor {
            sequence,
            saved_on_exit,
        };
        match self.store.save(cursor).await {
            Ok(()) => {
                self.metrics.incr("firehose_cursor_saves", &[("status", "ok")]);
                if saved_on_exit {
                    info!(sequence, "Saved exit cursor");
                } else {
                    debug!(sequence, "Saved cursor");
                }
            }
            Err(e) => {
                self.metrics.incr("firehose_cursor_saves", &[("status", "error")]);
                error!(sequence, "Failed to save cursor: {:#}", e);
            }
        }
    }
}

/// Sequence to resume from, if any progress was ever saved
pub async fn resume_point(store: &dyn CursorStore) -> anyhow::Result<Option<i64>> {
    match store.load().await? {
        Some(cursor) if cursor.saved_on_exit => {
            info!(
                sequence = cursor.sequence,
                "Resuming from exit cursor"
            );
            Ok(Some(cursor.sequence))
        }
        Some(cursor) => {
            warn!(
                sequence = cursor.sequence,
                "Previous run did not exit cleanly, resuming from last periodic cursor; recent events may be redelivered"
            );
            Ok(Some(cursor.sequence))
        }
        None => {
            info!("No saved cursor, starting from the live stream");
            Ok(None)
        }
    }
}

/// Process-local cursor store
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    saved: Mutex<Vec<SequenceCursor>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every cursor written, oldest first
    pub fn history(&self) -> Vec<SequenceCursor> {
        self.saved.lock().clone()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self) -> anyhow::Result<Option<SequenceCursor>> {
        Ok(self.saved.lock().last().copied())
    }

    async fn save(&self, cursor: SequenceCursor) -> anyhow::Result<()> {
        self.saved.lock().push(cursor);
        Ok(())
    }
}
