// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

pub mod records;
pub mod wire;

use anyhow::Result;
use serde::de::DeserializeOwned;

pub use records::{
    record_uri, Blob, BlobLink, FollowRecord, LikeRecord, PostImage, PostMedia, PostRecord,
    ProfileRecord, ReplyRef, StrongRef, FOLLOW_COLLECTION, LIKE_COLLECTION, POST_COLLECTION,
    PROFILE_COLLECTION,
};
pub use wire::{Commit, CommitOperation, EventKind, FirehoseEvent, SequenceCursor};

/// Parse a typed record from the JSON bytes carried on a commit
pub fn parse_record<T: DeserializeOwned>(record: &[u8]) -> Result<T> {
    tracing::trace!("Parsing record JSON: {}", String::from_utf8_lossy(record));
    let parsed = serde_json::from_slice::<T>(record)?;
    Ok(parsed)
}
