// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::log::LogStore;
use crate::events::SequenceCursor;
use crate::firehose::CursorStore;

const CURSOR_PARTITION: u32 = 0;
const CURSOR_KEY: &str = "cursor";

/// Ingestion cursor kept on its own single-partition relay topic. Only the
/// newest entry matters, so older ones are compacted away after each save.
pub struct LogCursorStore {
    log: Arc<dyn LogStore>,
    topic: String,
}

impl LogCursorStore {
    pub fn new(log: Arc<dyn LogStore>, topic: impl Into<String>) -> Self {
        Self {
            log,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl CursorStore for LogCursorStore {
    async fn load(&self) -> anyhow::Result<Option<SequenceCursor>> {
        let Some(record) = self.log.latest(&self.topic, CURSOR_PARTITION).await? else {
            return Ok(None);
        };
        let cursor = SequenceCursor::decode(&record.payload)
            .with_context(|| format!("malformed cursor at offset {}", record.offset))?;
        Ok(Some(cursor))
    }

    async fn save(&self, cursor: SequenceCursor) -> anyhow::Result<()> {
        let offset = self
            .log
            .append(&self.topic, CURSOR_PARTITION, CURSOR_KEY, cursor.encode()?)
            .await?;
        let removed = self.log.compact(&self.topic, CURSOR_PARTITION, offset).await?;
        debug!(sequence = cursor.sequence, offset, removed, "Cursor persisted");
        Ok(())
    }
}
