// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Consumer-group member.
//!
//! Each owned partition is drained by its own task, one message at a time.
//! The committed offset only moves past a message after the handler accepts
//! it; a failing handler is retried with exponential backoff, so delivery is
//! at-least-once and handlers must tolerate redelivery.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::log::{LogRecord, LogStore};
use super::BusError;
use crate::events::FirehoseEvent;
use crate::metrics::SharedMetrics;

/// Receives relayed events. Returning `Err` withholds the acknowledgement.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &FirehoseEvent) -> anyhow::Result<()>;
}

/// Exponential retry delay: `initial * multiplier^attempt`, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(64) as i32);
        let millis = (self.initial.as_millis() as f64 * exp).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

pub struct ConsumerGroup {
    log: Arc<dyn LogStore>,
    group: String,
    topic: String,
    partitions: u32,
    member_index: u32,
    member_count: u32,
    poll_interval: Duration,
    batch_size: usize,
    backoff: Backoff,
    metrics: SharedMetrics,
}

impl ConsumerGroup {
    pub fn new(
        log: Arc<dyn LogStore>,
        group: impl Into<String>,
        topic: impl Into<String>,
        partitions: u32,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            log,
            group: group.into(),
            topic: topic.into(),
            partitions: partitions.max(1),
            member_index: 0,
            member_count: 1,
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            backoff: Backoff::default(),
            metrics,
        }
    }

    /// Static assignment: this member owns partitions `p` with
    /// `p % count == index`
    pub fn with_membership(mut self, index: u32, count: u32) -> Self {
        self.member_count = count.max(1);
        self.member_index = index % self.member_count;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn owned_partitions(&self) -> Vec<u32> {
        (0..self.partitions)
            .filter(|p| p % self.member_count == self.member_index)
            .collect()
    }

    /// Consume until `cancel` fires. A relay backend failure on any
    /// partition stops the member and is returned.
    pub async fn run(
        self,
        handler: Arc<dyn EventHandler>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let this = Arc::new(self);
        let owned = this.owned_partitions();
        info!(
            group = %this.group,
            topic = %this.topic,
            partitions = ?owned,
            "Starting consumer group member"
        );

        let mut tasks = JoinSet::new();
        for partition in owned {
            let this = this.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { this.consume_partition(partition, handler, cancel).await });
        }

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result.map_err(anyhow::Error::from),
                Err(e) => Err(anyhow::anyhow!("partition task failed: {}", e)),
            };
            if let Err(e) = result {
                error!(group = %this.group, "Consumer stopped: {:#}", e);
                cancel.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        info!(group = %this.group, "Consumer group member stopped");
        outcome
    }

    async fn consume_partition(
        &self,
        partition: u32,
        handler: Arc<dyn EventHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BusError> {
        let mut next = self
            .log
            .committed(&self.group, &self.topic, partition)
            .await?;
        debug!(group = %self.group, partition, next, "Resuming partition");

        while !cancel.is_cancelled() {
            let records = self
                .log
                .read(&self.topic, partition, next, self.batch_size)
                .await?;
            if records.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            for record in records {
                if !self.deliver(&record, handler.as_ref(), &cancel).await {
                    return Ok(());
                }
                next = record.offset + 1;
                self.log
                    .commit(&self.group, &self.topic, partition, next)
                    .await?;
            }
        }
        Ok(())
    }

    /// Hand one record to the handler until it is accepted. Returns `false`
    /// if cancelled before that happened.
    async fn deliver(
        &self,
        record: &LogRecord,
        handler: &dyn EventHandler,
        cancel: &CancellationToken,
    ) -> bool {
        let event = match FirehoseEvent::decode(&record.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    group = %self.group,
                    offset = record.offset,
                    key = %record.key,
                    "Skipping undecodable message: {}", e
                );
                self.metrics.incr(
                    "bus_messages_consumed",
                    &[("group", self.group.as_str()), ("status", "undecodable")],
                );
                return true;
            }
        };

        let mut attempt = 0;
        loop {
            match handler.handle_event(&event).await {
                Ok(()) => {
                    self.metrics.incr(
                        "bus_messages_consumed",
                        &[("group", self.group.as_str()), ("status", "ok")],
                    );
                    return true;
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    self.metrics.incr(
                        "bus_messages_consumed",
                        &[("group", self.group.as_str()), ("status", "retry")],
                    );
                    warn!(
                        group = %self.group,
                        offset = record.offset,
                        did = %event.did,
                        attempt,
                        "Handler failed, retrying in {:?}: {:#}", delay, e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Periodically drop relay records older than `retention` from `topic`
pub async fn run_retention(
    log: Arc<dyn LogStore>,
    topic: String,
    retention: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            error!("Retention period out of range: {:?}", retention);
            return;
        };
        match log.expire(&topic, Utc::now() - retention).await {
            Ok(0) => {}
            Ok(removed) => info!(topic = %topic, removed, "Expired relay records"),
            Err(e) => error!(topic = %topic, "Failed to expire relay records: {}", e),
        }
    }
}
