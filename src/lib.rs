// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Vylet social indexer: firehose ingestion, a partitioned relay bus,
//! collection indexers and the denormalized storage engine they write to.

pub mod api;
pub mod blobs;
pub mod bus;
pub mod config;
pub mod db;
pub mod events;
pub mod firehose;
pub mod indexer;
pub mod metrics;
pub mod models;
pub mod schema;
pub mod store;

#[macro_use]
extern crate diesel;
