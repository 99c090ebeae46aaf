// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use crate::schema::profiles;

/// Actor profile, one row per DID
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = profiles, primary_key(did), treat_none_as_null = true)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub did: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub pronouns: Option<String>,
    /// CID of the avatar blob
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub indexed_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}
