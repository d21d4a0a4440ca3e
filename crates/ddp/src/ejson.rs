// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! EJSON scalar wrappers and value canonicalization.
//!
//! DDP carries non-JSON scalars as tagged single-key objects:
//! `{"$date": epoch-ms}` for instants and `{"$binary": base64}` for opaque
//! bytes. Typed documents embed [`EjsonDate`] / [`EjsonBinary`] fields whose
//! serde impls produce exactly those wrappers; [`encode_value`] walks
//! arbitrary parameter trees and normalizes wrapped scalars for the wire.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

pub const DATE_KEY: &str = "$date";
pub const BINARY_KEY: &str = "$binary";

/// Instant in time as epoch milliseconds, `{"$date": ms}` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EjsonDate(pub i64);

impl EjsonDate {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(epoch_ms())
    }

    pub fn epoch_ms(self) -> i64 {
        self.0
    }
}

impl Serialize for EjsonDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(DATE_KEY, &self.0)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for EjsonDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr {
            // Some servers emit fractional milliseconds.
            #[serde(rename = "$date")]
            date: f64,
        }
        let repr = Repr::deserialize(deserializer)?;
        Ok(Self(repr.date as i64))
    }
}

/// Opaque binary payload, `{"$binary": base64}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EjsonBinary(pub Bytes);

impl EjsonBinary {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for EjsonBinary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(BINARY_KEY, &STANDARD.encode(&self.0))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for EjsonBinary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr {
            #[serde(rename = "$binary")]
            b64: String,
        }
        let repr = Repr::deserialize(deserializer)?;
        let data = STANDARD.decode(repr.b64.as_bytes()).map_err(D::Error::custom)?;
        Ok(Self(Bytes::from(data)))
    }
}

// -- Value helpers -------------------------------------------------------------

/// Build a `{"$date": ms}` wrapper.
pub fn date_value(epoch_ms: i64) -> Value {
    let mut map = serde_json::Map::with_capacity(1);
    map.insert(DATE_KEY.to_owned(), Value::Number(Number::from(epoch_ms)));
    Value::Object(map)
}

/// Extract epoch milliseconds from a `{"$date"}` wrapper.
pub fn as_date(value: &Value) -> Option<i64> {
    value.as_object()?.get(DATE_KEY)?.as_f64().map(|ms| ms as i64)
}

/// Build a `{"$binary": base64}` wrapper.
pub fn binary_value(data: &[u8]) -> Value {
    let mut map = serde_json::Map::with_capacity(1);
    map.insert(BINARY_KEY.to_owned(), Value::String(STANDARD.encode(data)));
    Value::Object(map)
}

/// Extract the payload of a `{"$binary"}` wrapper.
pub fn as_binary(value: &Value) -> Option<Vec<u8>> {
    let b64 = value.as_object()?.get(BINARY_KEY)?.as_str()?;
    STANDARD.decode(b64.as_bytes()).ok()
}

// -- Outgoing walker -----------------------------------------------------------

/// Canonicalize one outgoing value: `{$date}` wrappers get integral
/// milliseconds, everything else passes through. Arrays and objects
/// recurse element-wise.
pub fn encode_value(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(encode_value).collect()),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(ms) = map.get(DATE_KEY).and_then(Value::as_f64) {
                    return date_value(ms as i64);
                }
            }
            Value::Object(map.into_iter().map(|(k, v)| (k, encode_value(v))).collect())
        }
        other => other,
    }
}

/// Run every element of an outgoing `params` array through [`encode_value`].
pub fn encode_params(params: Vec<Value>) -> Vec<Value> {
    params.into_iter().map(encode_value).collect()
}

/// Current epoch milliseconds.
pub(crate) fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
#[path = "ejson_tests.rs"]
mod tests;
