// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! CAR v1 archive reader for commit block payloads.

use cid::Cid;
use ciborium::value::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Cursor;

use super::frames::{as_map, decode_link, field};
use super::DecodeError;

/// Multihash code of SHA2-256
const SHA2_256: u64 = 0x12;

/// Blocks of one commit, addressed by CID
#[derive(Debug, Default)]
pub struct BlockStore {
    roots: Vec<Cid>,
    blocks: HashMap<Cid, Vec<u8>>,
}

impl BlockStore {
    pub fn from_car(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut rest = bytes;

        let header_len = read_varint(&mut rest)?;
        let (header, tail) = split(rest, header_len)?;
        let header: Value = ciborium::de::from_reader(header)
            .map_err(|e| DecodeError::Car(format!("header: {:?}", e)))?;
        let header = as_map(&header, "car header")?;
        match field(header, "version") {
            Some(Value::Integer(version)) if i128::from(*version) == 1 => {}
            _ => return Err(DecodeError::Car("unsupported CAR version".to_string())),
        }
        let roots = match field(header, "roots") {
            Some(Value::Array(items)) => items
                .iter()
                .map(decode_link)
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        rest = tail;

        let mut blocks = HashMap::new();
        while !rest.is_empty() {
            let section_len = read_varint(&mut rest)?;
            let (section, tail) = split(rest, section_len)?;
            let mut cursor = Cursor::new(section);
            let cid = Cid::read_bytes(&mut cursor).map_err(|e| DecodeError::Cid(e.to_string()))?;
            let data = &section[cursor.position() as usize..];
            blocks.insert(cid, data.to_vec());
            rest = tail;
        }

        Ok(Self { roots, blocks })
    }

    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block bytes for `cid`, after checking the content hash matches
    pub fn verified(&self, cid: &Cid) -> Result<&[u8], DecodeError> {
        let data = self
            .blocks
            .get(cid)
            .ok_or_else(|| DecodeError::MissingBlock(cid.to_string()))?;
        verify_block(cid, data)?;
        Ok(data)
    }
}

/// Recompute the SHA-256 digest of `data` and compare with the one in `cid`
pub fn verify_block(cid: &Cid, data: &[u8]) -> Result<(), DecodeError> {
    let hash = cid.hash();
    if hash.code() != SHA2_256 {
        return Err(DecodeError::Cid(format!(
            "unsupported hash function 0x{:x} in {}",
            hash.code(),
            cid
        )));
    }
    if hash.digest() != Sha256::digest(data).as_slice() {
        return Err(DecodeError::HashMismatch(cid.to_string()));
    }
    Ok(())
}

fn read_varint(input: &mut &[u8]) -> Result<usize, DecodeError> {
    let mut value: u64 = 0;
    for shift in (0..64).step_by(7) {
        let Some((&byte, rest)) = input.split_first() else {
            return Err(DecodeError::Car("truncated varint".to_string()));
        };
        *input = rest;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return usize::try_from(value)
                .map_err(|_| DecodeError::Car("varint out of range".to_string()));
        }
    }
    Err(DecodeError::Car("varint too long".to_string()))
}

fn split(input: &[u8], len: usize) -> Result<(&[u8], &[u8]), DecodeError> {
    if input.len() < len {
        return Err(DecodeError::Car(format!(
            "section of {} bytes exceeds remaining {}",
            len,
            input.len()
        )));
    }
    Ok(input.split_at(len))
}
