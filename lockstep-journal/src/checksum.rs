//! Canonical model encoding and checksums.
//!
//! The model is written as named MessagePack and read back into an
//! `rmpv::Value` tree. Every map in that tree is reordered by the encoded
//! bytes of its keys, so the encoding does not depend on the iteration order
//! of hash maps inside the model and keys may be any serializable type. The
//! tree is written back behind a one-byte encoding version and hashed with
//! CRC-32.
//!
//! Sets serialize as sequences and keep their iteration order. Models hold
//! them in ordered collections or serialize them through [`sorted_set`].

use std::collections::HashSet;
use std::hash::BuildHasher;

use rmpv::Value;
use serde::{Serialize, Serializer};

use crate::error::{JournalError, Result};

/// Version byte prefixed to every canonical encoding.
pub const CHECKSUM_ENCODING_VERSION: u8 = 2;

fn encoding_error(e: impl std::fmt::Display) -> JournalError {
    JournalError::Encoding(e.to_string())
}

/// Write the canonical encoding of `value` into `out`, replacing its contents.
pub fn encode_canonical<T: Serialize>(value: &T, out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    let named = rmp_serde::to_vec_named(value).map_err(encoding_error)?;
    let tree = rmpv::decode::read_value(&mut named.as_slice()).map_err(encoding_error)?;
    let tree = canonicalize(tree)?;
    out.push(CHECKSUM_ENCODING_VERSION);
    rmpv::encode::write_value(out, &tree).map_err(encoding_error)?;
    Ok(())
}

fn canonicalize(value: Value) -> Result<Value> {
    match value {
        Value::Array(items) => Ok(Value::Array(
            items.into_iter().map(canonicalize).collect::<Result<_>>()?,
        )),
        Value::Map(entries) => {
            let mut keyed = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                let key = canonicalize(key)?;
                let mut key_bytes = Vec::new();
                rmpv::encode::write_value(&mut key_bytes, &key).map_err(encoding_error)?;
                keyed.push((key_bytes, key, canonicalize(value)?));
            }
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(Value::Map(
                keyed.into_iter().map(|(_, key, value)| (key, value)).collect(),
            ))
        }
        other => Ok(other),
    }
}

/// Serialize a hash set as a sequence in ascending order.
///
/// Use with `#[serde(serialize_with = "lockstep_journal::sorted_set")]` on
/// model fields that hold a `HashSet`.
pub fn sorted_set<T, H, S>(
    set: &HashSet<T, H>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    T: Serialize + Ord,
    H: BuildHasher,
    S: Serializer,
{
    let mut items: Vec<&T> = set.iter().collect();
    items.sort();
    serializer.collect_seq(items)
}

/// Checksum of already-encoded canonical bytes.
pub fn checksum_bytes(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Compute the checksum of `value`, using `scratch` as the encoding buffer.
pub fn compute_checksum<T: Serialize>(value: &T, scratch: &mut Vec<u8>) -> Result<u32> {
    encode_canonical(value, scratch)?;
    Ok(checksum_bytes(scratch))
}

/// Decode canonical bytes back into a JSON tree for inspection.
///
/// Map keys that are not strings are rendered as their JSON text.
pub fn decode_canonical(bytes: &[u8]) -> Result<serde_json::Value> {
    match bytes.split_first() {
        Some((&CHECKSUM_ENCODING_VERSION, mut body)) => {
            let tree = rmpv::decode::read_value(&mut body).map_err(encoding_error)?;
            Ok(to_json(tree))
        }
        Some((&version, _)) => Err(JournalError::Encoding(format!(
            "unsupported canonical encoding version {version}"
        ))),
        None => Err(JournalError::Encoding("empty canonical encoding".to_string())),
    }
}

fn to_json(value: Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(b),
        Value::Integer(n) => match (n.as_u64(), n.as_i64()) {
            (Some(u), _) => Json::from(u),
            (None, Some(i)) => Json::from(i),
            (None, None) => Json::Null,
        },
        Value::F32(f) => float_to_json(f64::from(f)),
        Value::F64(f) => float_to_json(f),
        Value::String(s) => Json::String(s.into_str().unwrap_or_default()),
        Value::Binary(bytes) => Json::Array(bytes.into_iter().map(Json::from).collect()),
        Value::Array(items) => Json::Array(items.into_iter().map(to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .into_iter()
                .map(|(key, value)| {
                    let key = match to_json(key) {
                        Json::String(s) => s,
                        other => other.to_string(),
                    };
                    (key, to_json(value))
                })
                .collect(),
        ),
        Value::Ext(tag, bytes) => Json::Array(vec![
            Json::from(tag),
            Json::Array(bytes.into_iter().map(Json::from).collect()),
        ]),
    }
}

fn float_to_json(f: f64) -> serde_json::Value {
    serde_json::Number::from_f64(f)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}
