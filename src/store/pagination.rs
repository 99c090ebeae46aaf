// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Opaque `"<RFC3339 nanos>|<uri>"` cursors over `(created_at DESC, uri DESC)`
//! ordered partitions.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::error::{StoreError, StoreResult};

/// Page size and optional continuation cursor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl PageRequest {
    pub fn new(limit: i64) -> Self {
        Self { limit, cursor: None }
    }

    pub fn after(limit: i64, cursor: impl Into<String>) -> Self {
        Self {
            limit,
            cursor: Some(cursor.into()),
        }
    }

    /// Validated page size and decoded cursor
    pub fn resolve(&self) -> StoreResult<(usize, Option<PageCursor>)> {
        let limit = validate_limit(self.limit)?;
        let cursor = match self.cursor.as_deref() {
            Some(raw) if !raw.is_empty() => Some(PageCursor::parse(raw)?),
            _ => None,
        };
        Ok((limit, cursor))
    }
}

/// One page of results; `cursor` is present only when more rows exist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub cursor: Option<String>,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            cursor: None,
        }
    }
}

/// Position of the last row of a page
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub uri: String,
}

impl PageCursor {
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let (timestamp, uri) = raw.split_once('|').ok_or(StoreError::InvalidCursor)?;
        let created_at = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|_| StoreError::InvalidCursor)?
            .with_timezone(&Utc);
        Ok(Self {
            created_at,
            uri: uri.to_string(),
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "{}|{}",
            self.created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.uri
        )
    }

    /// Strict `(created_at, uri) < cursor` predicate
    pub fn admits(&self, created_at: &DateTime<Utc>, uri: &str) -> bool {
        (created_at, uri) < (&self.created_at, self.uri.as_str())
    }
}

pub fn validate_limit(limit: i64) -> StoreResult<usize> {
    if limit <= 0 {
        return Err(StoreError::InvalidArgument(
            "limit must be greater than 0".to_string(),
        ));
    }
    Ok(limit as usize)
}

/// Turn a `limit + 1` fetch into a page, emitting a cursor from the last kept
/// row only when the extra row came back.
pub fn finish_page<T>(
    mut rows: Vec<T>,
    limit: usize,
    position: impl Fn(&T) -> (DateTime<Utc>, String),
) -> Page<T> {
    let cursor = if rows.len() > limit {
        rows.truncate(limit);
        rows.last().map(|last| {
            let (created_at, uri) = position(last);
            PageCursor { created_at, uri }.encode()
        })
    } else {
        None
    };
    Page {
        items: rows,
        cursor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cursor_keeps_nanoseconds_and_pipes_in_uri() {
        let created_at = Utc.timestamp_opt(1_704_067_200, 123_456_789).unwrap();
        let cursor = PageCursor {
            created_at,
            uri: "at://did:example:abc/app.vylet.feed.post/a|b".to_string(),
        };
        let encoded = cursor.encode();
        assert!(encoded.starts_with("2024-01-01T00:00:00.123456789Z|"));
        assert_eq!(PageCursor::parse(&encoded).unwrap(), cursor);
    }

    #[test]
    fn malformed_cursors_are_rejected() {
        assert_eq!(PageCursor::parse("no-separator"), Err(StoreError::InvalidCursor));
        assert_eq!(PageCursor::parse("yesterday|at://x"), Err(StoreError::InvalidCursor));
    }

    #[test]
    fn non_positive_limits_are_usage_errors() {
        assert!(matches!(validate_limit(0), Err(StoreError::InvalidArgument(_))));
        assert!(matches!(validate_limit(-5), Err(StoreError::InvalidArgument(_))));
        assert_eq!(validate_limit(3).unwrap(), 3);
    }

    #[test]
    fn empty_cursor_string_means_first_page() {
        let (limit, cursor) = PageRequest::after(10, "").resolve().unwrap();
        assert_eq!(limit, 10);
        assert!(cursor.is_none());
    }

    #[test]
    fn strict_predicate_breaks_ties_on_uri() {
        let t = Utc.timestamp_opt(10, 0).unwrap();
        let cursor = PageCursor { created_at: t, uri: "m".to_string() };
        assert!(cursor.admits(&t, "a"));
        assert!(!cursor.admits(&t, "m"));
        assert!(!cursor.admits(&t, "z"));
        assert!(cursor.admits(&Utc.timestamp_opt(9, 0).unwrap(), "z"));
    }

    #[test]
    fn cursor_only_when_extra_row_exists() {
        let t = Utc.timestamp_opt(10, 0).unwrap();
        let rows = vec![(t, "c"), (t, "b"), (t, "a")];
        let page = finish_page(rows.clone(), 2, |r| (r.0, r.1.to_string()));
        assert_eq!(page.items.len(), 2);
        assert_eq!(
            PageCursor::parse(page.cursor.as_deref().unwrap()).unwrap().uri,
            "b"
        );

        let page = finish_page(rows, 3, |r| (r.0, r.1.to_string()));
        assert_eq!(page.items.len(), 3);
        assert!(page.cursor.is_none());
    }
}
