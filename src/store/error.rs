// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Sentinel text that marks a "not found" outcome on the RPC envelope
pub const NOT_FOUND: &str = "not found";

pub const INVALID_CURSOR: &str = "invalid cursor format";

/// Outcome of a storage engine call that did not produce data.
///
/// The display text of each variant is exactly what travels in the `error`
/// field of an RPC response, so callers on either side of the wire can branch
/// on "not found" without a structured code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    /// Usage error such as a non-positive page size
    #[error("{0}")]
    InvalidArgument(String),
    #[error("invalid cursor format")]
    InvalidCursor,
    /// Query failure, timeout or transport problem
    #[error("{0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Whether an envelope error string denotes the "not found" sentinel
pub fn is_not_found(message: &str) -> bool {
    message == NOT_FOUND
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        StoreError::Backend(err.to_string())
    }

    /// Rebuild an error from envelope text received over the wire
    pub fn from_message(message: String) -> Self {
        if is_not_found(&message) {
            StoreError::NotFound
        } else if message == INVALID_CURSOR {
            StoreError::InvalidCursor
        } else {
            StoreError::Backend(message)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => StoreError::NotFound,
            other => StoreError::Backend(other.to_string()),
        }
    }
}
