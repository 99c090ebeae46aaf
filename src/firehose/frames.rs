// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Upstream frame decoding.
//!
//! Every binary websocket message is two concatenated DAG-CBOR values: a
//! header `{op, t}` followed by the body. `op = -1` marks an error frame.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use cid::Cid;
use ciborium::value::Value;
use serde_json::{json, Map, Value as Json};

use super::DecodeError;

/// CBOR tag carrying a CID link in DAG-CBOR
pub const CID_TAG: u64 = 42;

/// Decoded upstream frame
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Commit(CommitFrame),
    Identity(AccountFrame),
    Account(AccountFrame),
    Info {
        name: String,
        message: Option<String>,
    },
    Sync {
        seq: i64,
    },
    Error {
        error: String,
        message: Option<String>,
    },
    Unknown(String),
}

impl StreamFrame {
    /// Label used for the `kind` metric dimension
    pub fn kind(&self) -> &'static str {
        match self {
            StreamFrame::Commit(_) => "commit",
            StreamFrame::Identity(_) => "identity",
            StreamFrame::Account(_) => "account",
            StreamFrame::Info { .. } => "info",
            StreamFrame::Sync { .. } => "sync",
            StreamFrame::Error { .. } => "error",
            StreamFrame::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitFrame {
    pub seq: i64,
    pub repo: String,
    pub rev: String,
    pub time: String,
    /// CAR v1 archive holding the blocks touched by this commit
    pub blocks: Vec<u8>,
    /// Ops decode independently so one bad entry does not sink the commit
    pub ops: Vec<Result<RepoOp, DecodeError>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepoOp {
    pub action: String,
    /// `<collection>/<rkey>`
    pub path: String,
    /// Absent for deletes
    pub cid: Option<Cid>,
}

/// Identity and account frames are relayed as-is, so the body is kept whole
#[derive(Debug, Clone, PartialEq)]
pub struct AccountFrame {
    pub seq: i64,
    pub did: String,
    pub time: String,
    pub body: Json,
}

pub fn decode_frame(bytes: &[u8]) -> Result<StreamFrame, DecodeError> {
    let mut reader = bytes;
    let header: Value = ciborium::de::from_reader(&mut reader)
        .map_err(|e| DecodeError::Cbor(format!("header: {:?}", e)))?;
    let body: Value = ciborium::de::from_reader(&mut reader)
        .map_err(|e| DecodeError::Cbor(format!("body: {:?}", e)))?;

    let header = as_map(&header, "header")?;
    let op = int_field(header, "op")?;
    let body_map = as_map(&body, "body")?;

    if op == -1 {
        return Ok(StreamFrame::Error {
            error: opt_text_field(body_map, "error").unwrap_or_default(),
            message: opt_text_field(body_map, "message"),
        });
    }

    let kind = text_field(header, "t")?;
    let frame = match kind.as_str() {
        "#commit" => StreamFrame::Commit(decode_commit(body_map)?),
        "#identity" => StreamFrame::Identity(decode_account(body_map, &body)?),
        "#account" => StreamFrame::Account(decode_account(body_map, &body)?),
        "#info" => StreamFrame::Info {
            name: opt_text_field(body_map, "name").unwrap_or_default(),
            message: opt_text_field(body_map, "message"),
        },
        "#sync" => StreamFrame::Sync {
            seq: int_field(body_map, "seq")?,
        },
        _ => StreamFrame::Unknown(kind),
    };
    Ok(frame)
}

fn decode_commit(body: &[(Value, Value)]) -> Result<CommitFrame, DecodeError> {
    let blocks = match field(body, "blocks") {
        Some(Value::Bytes(bytes)) => bytes.clone(),
        _ => Vec::new(),
    };

    let ops = match field(body, "ops") {
        Some(Value::Array(items)) => items.iter().map(decode_op).collect(),
        _ => Vec::new(),
    };

    Ok(CommitFrame {
        seq: int_field(body, "seq")?,
        repo: text_field(body, "repo")?,
        rev: opt_text_field(body, "rev").unwrap_or_default(),
        time: text_field(body, "time")?,
        blocks,
        ops,
    })
}

fn decode_op(value: &Value) -> Result<RepoOp, DecodeError> {
    let op = as_map(value, "op")?;
    let cid = match field(op, "cid") {
        None | Some(Value::Null) => None,
        Some(link) => Some(decode_link(link)?),
    };
    Ok(RepoOp {
        action: text_field(op, "action")?,
        path: text_field(op, "path")?,
        cid,
    })
}

fn decode_account(body: &[(Value, Value)], raw: &Value) -> Result<AccountFrame, DecodeError> {
    Ok(AccountFrame {
        seq: int_field(body, "seq")?,
        did: text_field(body, "did")?,
        time: text_field(body, "time")?,
        body: cbor_to_json(raw)?,
    })
}

/// Decode a tag-42 CID link. The byte string carries a leading multibase
/// identity prefix (0x00) before the binary CID.
pub fn decode_link(value: &Value) -> Result<Cid, DecodeError> {
    match value {
        Value::Tag(CID_TAG, inner) => match inner.as_ref() {
            Value::Bytes(bytes) if bytes.first() == Some(&0) => {
                Cid::try_from(&bytes[1..]).map_err(|e| DecodeError::Cid(e.to_string()))
            }
            _ => Err(DecodeError::Cid("malformed link payload".to_string())),
        },
        _ => Err(DecodeError::Shape("expected a CID link".to_string())),
    }
}

/// Convert a DAG-CBOR value into its JSON form: links become
/// `{"$link": "<cid>"}` and byte strings `{"$bytes": "<base64>"}`.
pub fn cbor_to_json(value: &Value) -> Result<Json, DecodeError> {
    let converted = match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(i) => {
            let n = i128::from(*i);
            if let Ok(v) = i64::try_from(n) {
                json!(v)
            } else if let Ok(v) = u64::try_from(n) {
                json!(v)
            } else {
                return Err(DecodeError::Shape(format!("integer out of range: {}", n)));
            }
        }
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(bytes) => json!({ "$bytes": STANDARD_NO_PAD.encode(bytes) }),
        Value::Array(items) => Json::Array(
            items
                .iter()
                .map(cbor_to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Map(entries) => {
            let mut object = Map::with_capacity(entries.len());
            for (key, item) in entries {
                let Value::Text(key) = key else {
                    return Err(DecodeError::Shape("map keys must be strings".to_string()));
                };
                object.insert(key.clone(), cbor_to_json(item)?);
            }
            Json::Object(object)
        }
        Value::Tag(CID_TAG, _) => json!({ "$link": decode_link(value)?.to_string() }),
        Value::Tag(tag, _) => {
            return Err(DecodeError::Shape(format!("unsupported CBOR tag {}", tag)))
        }
        _ => return Err(DecodeError::Shape("unsupported CBOR value".to_string())),
    };
    Ok(converted)
}

/// Decode a DAG-CBOR record block and render it as JSON bytes
pub fn record_to_json(block: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let value: Value =
        ciborium::de::from_reader(block).map_err(|e| DecodeError::Cbor(format!("{:?}", e)))?;
    if !matches!(value, Value::Map(_)) {
        return Err(DecodeError::Shape("record is not a map".to_string()));
    }
    serde_json::to_vec(&cbor_to_json(&value)?).map_err(|e| DecodeError::Shape(e.to_string()))
}

pub(crate) fn as_map<'a>(
    value: &'a Value,
    what: &str,
) -> Result<&'a [(Value, Value)], DecodeError> {
    match value {
        Value::Map(entries) => Ok(entries),
        _ => Err(DecodeError::Shape(format!("{} is not a map", what))),
    }
}

pub(crate) fn field<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| matches!(k, Value::Text(text) if text == key))
        .map(|(_, v)| v)
}

fn int_field(map: &[(Value, Value)], key: &str) -> Result<i64, DecodeError> {
    match field(map, key) {
        Some(Value::Integer(i)) => {
            i64::try_from(i128::from(*i)).map_err(|_| DecodeError::Shape(format!("{} out of range", key)))
        }
        _ => Err(DecodeError::Shape(format!("missing integer field {}", key))),
    }
}

fn text_field(map: &[(Value, Value)], key: &str) -> Result<String, DecodeError> {
    opt_text_field(map, key).ok_or_else(|| DecodeError::Shape(format!("missing text field {}", key)))
}

fn opt_text_field(map: &[(Value, Value)], key: &str) -> Option<String> {
    match field(map, key) {
        Some(Value::Text(text)) => Some(text.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firehose::testing::{cid_for, encode_frame, link, text};

    #[test]
    fn decodes_identity_frame() {
        let frame = encode_frame(
            "#identity",
            vec![
                (text("seq"), Value::Integer(7.into())),
                (text("did"), text("did:plc:abc")),
                (text("time"), text("2024-01-01T00:00:00.000Z")),
                (text("handle"), text("abc.test")),
            ],
        );

        match decode_frame(&frame).unwrap() {
            StreamFrame::Identity(identity) => {
                assert_eq!(identity.seq, 7);
                assert_eq!(identity.did, "did:plc:abc");
                assert_eq!(identity.body["handle"], json!("abc.test"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn error_frames_and_unknown_kinds() {
        let mut bytes = Vec::new();
        let header = Value::Map(vec![(text("op"), Value::Integer((-1).into()))]);
        let body = Value::Map(vec![
            (text("error"), text("FutureCursor")),
            (text("message"), text("cursor in the future")),
        ]);
        ciborium::ser::into_writer(&header, &mut bytes).unwrap();
        ciborium::ser::into_writer(&body, &mut bytes).unwrap();
        assert_eq!(
            decode_frame(&bytes).unwrap(),
            StreamFrame::Error {
                error: "FutureCursor".to_string(),
                message: Some("cursor in the future".to_string()),
            }
        );

        let frame = encode_frame("#labels", vec![(text("seq"), Value::Integer(1.into()))]);
        assert_eq!(decode_frame(&frame).unwrap().kind(), "unknown");
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let frame = encode_frame("#commit", vec![(text("seq"), Value::Integer(1.into()))]);
        assert!(decode_frame(&frame[..frame.len() - 1]).is_err());
    }

    #[test]
    fn bad_op_does_not_fail_the_commit() {
        let cid = cid_for(b"record");
        let op = |cid: Value| {
            Value::Map(vec![
                (text("action"), text("create")),
                (text("path"), text("app.vylet.graph.follow/3k1")),
                (text("cid"), cid),
            ])
        };
        let frame = encode_frame(
            "#commit",
            vec![
                (text("seq"), Value::Integer(77.into())),
                (text("repo"), text("did:plc:alice")),
                (text("time"), text("2024-01-01T00:00:00Z")),
                (text("ops"), Value::Array(vec![op(link(&cid)), op(text("bafy"))])),
            ],
        );

        let StreamFrame::Commit(commit) = decode_frame(&frame).unwrap() else {
            panic!("expected a commit frame");
        };
        assert_eq!(commit.seq, 77);
        assert_eq!(commit.ops.len(), 2);
        assert_eq!(commit.ops[0].as_ref().unwrap().cid, Some(cid));
        assert!(matches!(commit.ops[1], Err(DecodeError::Shape(_))));
    }

    #[test]
    fn json_conversion_of_links_and_bytes() {
        let cid = cid_for(b"image");
        let value = Value::Map(vec![
            (text("$type"), text("blob")),
            (text("ref"), link(&cid)),
            (text("size"), Value::Integer(12.into())),
            (text("raw"), Value::Bytes(vec![1, 2, 3])),
        ]);
        let converted = cbor_to_json(&value).unwrap();
        assert_eq!(converted["ref"], json!({"$link": cid.to_string()}));
        assert_eq!(converted["raw"], json!({"$bytes": "AQID"}));
        assert_eq!(converted["size"], json!(12));
    }
}
