// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous, bounded producer.
//!
//! Each partition has a single writer task, so messages sharing a key are
//! appended in the order they were produced. The number of messages queued
//! or in flight is capped; `produce_async` waits for room and never for the
//! delivery itself.

use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

use super::log::LogStore;
use super::{partition_for, BusError};
use crate::events::FirehoseEvent;
use crate::metrics::SharedMetrics;

/// Invoked once a message is durably appended, or failed to be
pub type DeliveryCallback = Box<dyn FnOnce(Result<i64, BusError>) + Send>;

struct Pending {
    key: String,
    payload: Vec<u8>,
    callback: Option<DeliveryCallback>,
    _permit: OwnedSemaphorePermit,
}

pub struct Producer {
    topic: String,
    partitions: u32,
    max_in_flight: usize,
    in_flight: Arc<Semaphore>,
    writers: Vec<mpsc::UnboundedSender<Pending>>,
}

impl Producer {
    /// Start one writer task per partition. Must be called inside a runtime.
    pub fn new(
        log: Arc<dyn LogStore>,
        topic: impl Into<String>,
        partitions: u32,
        max_in_flight: usize,
        metrics: SharedMetrics,
    ) -> Self {
        let topic = topic.into();
        let partitions = partitions.max(1);
        let max_in_flight = max_in_flight.max(1);

        let writers = (0..partitions)
            .map(|partition| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(write_partition(
                    log.clone(),
                    topic.clone(),
                    partition,
                    rx,
                    metrics.clone(),
                ));
                tx
            })
            .collect();

        Self {
            topic,
            partitions,
            max_in_flight,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            writers,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Queue `event` under `key`. Encoding failures are returned directly;
    /// delivery failures are reported to `callback` and counted.
    pub async fn produce_async(
        &self,
        key: &str,
        event: &FirehoseEvent,
        callback: Option<DeliveryCallback>,
    ) -> Result<(), BusError> {
        let payload = event
            .encode()
            .map_err(|e| BusError::Encode(e.to_string()))?;
        self.produce_bytes(key, payload, callback).await
    }

    pub async fn produce_bytes(
        &self,
        key: &str,
        payload: Vec<u8>,
        callback: Option<DeliveryCallback>,
    ) -> Result<(), BusError> {
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BusError::Closed)?;

        let partition = partition_for(key, self.partitions);
        let writer = self
            .writers
            .get(partition as usize)
            .ok_or(BusError::Closed)?;
        writer
            .send(Pending {
                key: key.to_string(),
                payload,
                callback,
                _permit: permit,
            })
            .map_err(|_| BusError::Closed)
    }

    /// Wait until every queued message has been delivered or failed
    pub async fn flush(&self) {
        match self.in_flight.acquire_many(self.max_in_flight as u32).await {
            Ok(_all) => debug!("Producer flushed"),
            Err(_) => error!("Producer semaphore closed during flush"),
        }
    }
}

async fn write_partition(
    log: Arc<dyn LogStore>,
    topic: String,
    partition: u32,
    mut rx: mpsc::UnboundedReceiver<Pending>,
    metrics: SharedMetrics,
) {
    while let Some(pending) = rx.recv().await {
        let result = log
            .append(&topic, partition, &pending.key, pending.payload)
            .await;
        match &result {
            Ok(_) => metrics.incr("bus_messages_produced", &[("status", "ok")]),
            Err(e) => {
                metrics.incr("bus_messages_produced", &[("status", "error")]);
                error!(
                    key = %pending.key,
                    partition,
                    "Failed to produce message: {}", e
                );
            }
        }
        if let Some(callback) = pending.callback {
            callback(result);
        }
        // permit released here
    }
}
