// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Upstream repository event stream: decoding, filtering, relaying and
//! cursor checkpointing.

pub mod car;
pub mod checkpoint;
pub mod filter;
pub mod frames;
pub mod ingestor;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

pub use car::BlockStore;
pub use checkpoint::{resume_point, Checkpointer, CursorStore, MemoryCursorStore, Watermark};
pub use filter::CollectionFilter;
pub use frames::{decode_frame, AccountFrame, CommitFrame, RepoOp, StreamFrame};
pub use ingestor::Ingestor;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("invalid CBOR: {0}")]
    Cbor(String),
    #[error("unexpected frame shape: {0}")]
    Shape(String),
    #[error("invalid CAR archive: {0}")]
    Car(String),
    #[error("invalid CID: {0}")]
    Cid(String),
    #[error("block {0} missing from commit")]
    MissingBlock(String),
    #[error("content hash does not match {0}")]
    HashMismatch(String),
}
