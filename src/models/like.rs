// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// Like of a post; loads from any of the four like views
#[derive(Debug, Clone, PartialEq, Queryable, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Like {
    pub uri: String,
    pub cid: String,
    pub subject_uri: String,
    pub subject_cid: String,
    pub author_did: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub indexed_at: DateTime<Utc>,
}
