// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Builders for upstream frames and CAR archives used by the tests.

use cid::multihash::Multihash;
use cid::Cid;
use ciborium::value::Value;
use sha2::{Digest, Sha256};

const DAG_CBOR: u64 = 0x71;
const SHA2_256: u64 = 0x12;

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub fn cbor(value: &Value) -> Vec<u8> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).unwrap();
    bytes
}

pub fn cid_for(data: &[u8]) -> Cid {
    let digest = Sha256::digest(data);
    Cid::new_v1(DAG_CBOR, Multihash::<64>::wrap(SHA2_256, &digest).unwrap())
}

pub fn link(cid: &Cid) -> Value {
    let mut bytes = vec![0u8];
    bytes.extend(cid.to_bytes());
    Value::Tag(42, Box::new(Value::Bytes(bytes)))
}

fn write_varint(out: &mut Vec<u8>, mut value: usize) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn car_bytes(blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
    let roots = blocks.first().map(|(cid, _)| vec![link(cid)]).unwrap_or_default();
    let header = cbor(&Value::Map(vec![
        (text("version"), Value::Integer(1.into())),
        (text("roots"), Value::Array(roots)),
    ]));

    let mut out = Vec::new();
    write_varint(&mut out, header.len());
    out.extend(header);
    for (cid, data) in blocks {
        let cid_bytes = cid.to_bytes();
        write_varint(&mut out, cid_bytes.len() + data.len());
        out.extend(cid_bytes);
        out.extend(data);
    }
    out
}

pub fn encode_frame(kind: &str, body: Vec<(Value, Value)>) -> Vec<u8> {
    let mut bytes = cbor(&Value::Map(vec![
        (text("op"), Value::Integer(1.into())),
        (text("t"), text(kind)),
    ]));
    bytes.extend(cbor(&Value::Map(body)));
    bytes
}

/// One op of a test commit; `record` is required for create and update
pub struct TestOp {
    pub action: &'static str,
    pub path: String,
    pub record: Option<Value>,
}

impl TestOp {
    pub fn create(path: &str, record: Value) -> Self {
        Self { action: "create", path: path.to_string(), record: Some(record) }
    }

    pub fn update(path: &str, record: Value) -> Self {
        Self { action: "update", path: path.to_string(), record: Some(record) }
    }

    pub fn delete(path: &str) -> Self {
        Self { action: "delete", path: path.to_string(), record: None }
    }
}

/// `#commit` frame whose CAR carries the CBOR blocks of every record
pub fn commit_frame(seq: i64, repo: &str, ops: Vec<TestOp>) -> Vec<u8> {
    let mut blocks = Vec::new();
    let mut op_values = Vec::new();
    for op in ops {
        let cid = op.record.as_ref().map(|record| {
            let data = cbor(record);
            let cid = cid_for(&data);
            blocks.push((cid, data));
            cid
        });
        op_values.push(Value::Map(vec![
            (text("action"), text(op.action)),
            (text("path"), Value::Text(op.path)),
            (text("cid"), cid.as_ref().map(link).unwrap_or(Value::Null)),
        ]));
    }

    encode_frame(
        "#commit",
        vec![
            (text("seq"), Value::Integer(seq.into())),
            (text("repo"), text(repo)),
            (text("rev"), text("3kabc")),
            (text("time"), text("2024-01-01T00:00:00.000Z")),
            (text("blocks"), Value::Bytes(car_bytes(&blocks))),
            (text("ops"), Value::Array(op_values)),
        ],
    )
}

/// A minimal record map with `$type` and `createdAt`
pub fn record(kind: &str, fields: Vec<(&str, Value)>) -> Value {
    let mut entries = vec![
        (text("$type"), text(kind)),
        (text("createdAt"), text("2024-01-01T00:00:00.000Z")),
    ];
    entries.extend(fields.into_iter().map(|(k, v)| (text(k), v)));
    Value::Map(entries)
}
