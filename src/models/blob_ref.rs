// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use crate::schema::blob_refs;

/// Sighting of a media blob in some actor's repository
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = blob_refs, primary_key(did, cid), treat_none_as_null = true)]
#[serde(rename_all = "camelCase")]
pub struct BlobRef {
    pub did: String,
    pub cid: String,
    pub first_seen_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub taken_down: bool,
    pub takedown_reason: Option<String>,
    pub taken_down_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl BlobRef {
    /// A fresh, not-taken-down reference first seen at `now`
    pub fn first_sighting(did: &str, cid: &str, now: DateTime<Utc>) -> Self {
        Self {
            did: did.to_string(),
            cid: cid.to_string(),
            first_seen_at: now,
            processed_at: Some(now),
            updated_at: now,
            taken_down: false,
            takedown_reason: None,
            taken_down_at: None,
            tags: Vec::new(),
        }
    }
}
