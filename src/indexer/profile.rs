// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use chrono::Utc;

use super::{decode_record, parse_time, IndexResult};
use crate::events::{Commit, CommitOperation, FirehoseEvent, ProfileRecord};
use crate::models::Profile;
use crate::store::SocialStore;

pub(super) async fn handle(
    store: &dyn SocialStore,
    event: &FirehoseEvent,
    commit: &Commit,
) -> IndexResult<()> {
    match commit.operation {
        CommitOperation::Create => {
            let record: ProfileRecord = decode_record(commit)?;
            let raw_created_at = record.created_at.as_deref().ok_or_else(|| {
                super::IndexError::InvalidRecord("profile is missing createdAt".to_string())
            })?;
            let created_at = parse_time(raw_created_at)?;
            store
                .create_profile(to_profile(&event.did, record, created_at))
                .await?;
        }
        CommitOperation::Update => {
            let record: ProfileRecord = decode_record(commit)?;
            // The stored creation time wins; this only matters for a first sighting
            let created_at = match record.created_at.as_deref() {
                Some(raw) => parse_time(raw)?,
                None => Utc::now(),
            };
            store
                .update_profile(to_profile(&event.did, record, created_at))
                .await?;
        }
        CommitOperation::Delete => store.delete_profile(&event.did).await?,
    }
    Ok(())
}

fn to_profile(did: &str, record: ProfileRecord, created_at: chrono::DateTime<Utc>) -> Profile {
    let now = Utc::now();
    Profile {
        did: did.to_string(),
        display_name: record.display_name,
        description: record.description,
        pronouns: record.pronouns,
        avatar: record.avatar.map(|blob| blob.cid().to_string()),
        created_at,
        indexed_at: now,
        updated_at: now,
    }
}
