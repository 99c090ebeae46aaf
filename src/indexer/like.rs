// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use chrono::Utc;

use super::{decode_record, parse_time, IndexError, IndexResult};
use crate::events::{Commit, CommitOperation, FirehoseEvent, LikeRecord};
use crate::models::Like;
use crate::store::SocialStore;

pub(super) async fn handle(
    store: &dyn SocialStore,
    event: &FirehoseEvent,
    commit: &Commit,
    uri: &str,
) -> IndexResult<()> {
    match commit.operation {
        CommitOperation::Create => {
            let record: LikeRecord = decode_record(commit)?;
            let like = Like {
                uri: uri.to_string(),
                cid: commit.cid.clone(),
                subject_uri: record.subject.uri,
                subject_cid: record.subject.cid,
                author_did: event.did.clone(),
                created_at: parse_time(&record.created_at)?,
                indexed_at: Utc::now(),
            };
            store.create_like(like).await?;
        }
        CommitOperation::Update => {
            return Err(IndexError::Unsupported("likes cannot be edited".to_string()))
        }
        CommitOperation::Delete => store.delete_like(uri).await?,
    }
    Ok(())
}
