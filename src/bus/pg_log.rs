// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Relay log on Postgres.
//!
//! Offsets come from a per-partition counter row bumped in the same
//! transaction as the insert. The row lock serialises concurrent appenders,
//! so offsets become visible in the order they were assigned.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use scoped_futures::ScopedFutureExt;
use std::sync::Arc;
use tracing::{debug, error};

use super::log::{LogRecord, LogStore};
use super::BusError;
use crate::db::{Database, DbConnection};
use crate::schema::{relay_log, relay_offsets, relay_partitions};

#[derive(Queryable)]
struct RelayRow {
    log_offset: i64,
    record_key: String,
    payload: Vec<u8>,
    appended_at: DateTime<Utc>,
}

impl From<RelayRow> for LogRecord {
    fn from(row: RelayRow) -> Self {
        LogRecord {
            offset: row.log_offset,
            key: row.record_key,
            payload: row.payload,
            appended_at: row.appended_at,
        }
    }
}

pub struct PgLog {
    db: Arc<Database>,
}

impl PgLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn get_connection(&self) -> Result<DbConnection, BusError> {
        self.db.get_connection().await.map_err(|e| {
            error!("Failed to get database connection: {}", e);
            BusError::backend(e)
        })
    }
}

fn partition_id(partition: u32) -> Result<i32, BusError> {
    i32::try_from(partition)
        .map_err(|_| BusError::Backend(format!("partition {} out of range", partition)))
}

#[async_trait]
impl LogStore for PgLog {
    async fn append(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<i64, BusError> {
        let partition_id = partition_id(partition)?;
        let mut conn = self.get_connection().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let payload = &payload;

        conn.transaction::<i64, BusError, _>(|conn| {
            async move {
                let next: i64 = diesel::insert_into(relay_partitions::table)
                    .values((
                        relay_partitions::topic.eq(topic),
                        relay_partitions::partition_id.eq(partition_id),
                        relay_partitions::next_offset.eq(1i64),
                    ))
                    .on_conflict((relay_partitions::topic, relay_partitions::partition_id))
                    .do_update()
                    .set(relay_partitions::next_offset.eq(relay_partitions::next_offset + 1i64))
                    .returning(relay_partitions::next_offset)
                    .get_result(conn)
                    .await?;
                let offset = next - 1;

                diesel::insert_into(relay_log::table)
                    .values((
                        relay_log::topic.eq(topic),
                        relay_log::partition_id.eq(partition_id),
                        relay_log::log_offset.eq(offset),
                        relay_log::record_key.eq(key),
                        relay_log::payload.eq(payload),
                        relay_log::appended_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;
                Ok(offset)
            }
            .scope_boxed()
        })
        .await
    }

    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: i64,
        max: usize,
    ) -> Result<Vec<LogRecord>, BusError> {
        let partition_id = partition_id(partition)?;
        let mut conn = self.get_connection().await?;
        let rows = relay_log::table
            .filter(relay_log::topic.eq(topic))
            .filter(relay_log::partition_id.eq(partition_id))
            .filter(relay_log::log_offset.ge(from))
            .order(relay_log::log_offset.asc())
            .limit(max as i64)
            .select((
                relay_log::log_offset,
                relay_log::record_key,
                relay_log::payload,
                relay_log::appended_at,
            ))
            .load::<RelayRow>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(LogRecord::from).collect())
    }

    async fn latest(&self, topic: &str, partition: u32) -> Result<Option<LogRecord>, BusError> {
        let partition_id = partition_id(partition)?;
        let mut conn = self.get_connection().await?;
        let row = relay_log::table
            .filter(relay_log::topic.eq(topic))
            .filter(relay_log::partition_id.eq(partition_id))
            .order(relay_log::log_offset.desc())
            .select((
                relay_log::log_offset,
                relay_log::record_key,
                relay_log::payload,
                relay_log::appended_at,
            ))
            .first::<RelayRow>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(LogRecord::from))
    }

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<i64, BusError> {
        let partition_id = partition_id(partition)?;
        let mut conn = self.get_connection().await?;
        let next = relay_offsets::table
            .filter(relay_offsets::consumer_group.eq(group))
            .filter(relay_offsets::topic.eq(topic))
            .filter(relay_offsets::partition_id.eq(partition_id))
            .select(relay_offsets::next_offset)
            .first::<i64>(&mut conn)
            .await
            .optional()?;
        Ok(next.unwrap_or(0))
    }

    async fn commit(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        next_offset: i64,
    ) -> Result<(), BusError> {
        let partition_id = partition_id(partition)?;
        let mut conn = self.get_connection().await?;
        diesel::insert_into(relay_offsets::table)
            .values((
                relay_offsets::consumer_group.eq(group),
                relay_offsets::topic.eq(topic),
                relay_offsets::partition_id.eq(partition_id),
                relay_offsets::next_offset.eq(next_offset),
                relay_offsets::updated_at.eq(Utc::now()),
            ))
            .on_conflict((
                relay_offsets::consumer_group,
                relay_offsets::topic,
                relay_offsets::partition_id,
            ))
            .do_update()
            .set((
                relay_offsets::next_offset.eq(excluded(relay_offsets::next_offset)),
                relay_offsets::updated_at.eq(excluded(relay_offsets::updated_at)),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn compact(
        &self,
        topic: &str,
        partition: u32,
        keep_from: i64,
    ) -> Result<u64, BusError> {
        let partition_id = partition_id(partition)?;
        let mut conn = self.get_connection().await?;
        let removed = diesel::delete(
            relay_log::table
                .filter(relay_log::topic.eq(topic))
                .filter(relay_log::partition_id.eq(partition_id))
                .filter(relay_log::log_offset.lt(keep_from)),
        )
        .execute(&mut conn)
        .await?;
        Ok(removed as u64)
    }

    async fn expire(&self, topic: &str, before: DateTime<Utc>) -> Result<u64, BusError> {
        let mut conn = self.get_connection().await?;
        let removed = diesel::delete(
            relay_log::table
                .filter(relay_log::topic.eq(topic))
                .filter(relay_log::appended_at.lt(before)),
        )
        .execute(&mut conn)
        .await?;
        debug!("Expired {} relay records from {}", removed, topic);
        Ok(removed as u64)
    }
}
