// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// Follow relationship; loads from any of the four follow views
#[derive(Debug, Clone, PartialEq, Queryable, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Follow {
    pub uri: String,
    pub cid: String,
    pub subject_did: String,
    pub author_did: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub indexed_at: DateTime<Utc>,
}
