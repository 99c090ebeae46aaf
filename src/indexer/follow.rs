// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use chrono::Utc;

use super::{decode_record, parse_time, IndexError, IndexResult};
use crate::events::{Commit, CommitOperation, FirehoseEvent, FollowRecord};
use crate::models::Follow;
use crate::store::SocialStore;

pub(super) async fn handle(
    store: &dyn SocialStore,
    event: &FirehoseEvent,
    commit: &Commit,
    uri: &str,
) -> IndexResult<()> {
    match commit.operation {
        CommitOperation::Create => {
            let record: FollowRecord = decode_record(commit)?;
            if !record.subject.starts_with("did:") {
                return Err(IndexError::InvalidRecord(format!(
                    "follow subject is not a DID: {}",
                    record.subject
                )));
            }
            let follow = Follow {
                uri: uri.to_string(),
                cid: commit.cid.clone(),
                subject_did: record.subject,
                author_did: event.did.clone(),
                created_at: parse_time(&record.created_at)?,
                indexed_at: Utc::now(),
            };
            store.create_follow(follow).await?;
        }
        CommitOperation::Update => {
            return Err(IndexError::Unsupported(
                "follows cannot be edited".to_string(),
            ))
        }
        CommitOperation::Delete => store.delete_follow(uri).await?,
    }
    Ok(())
}
