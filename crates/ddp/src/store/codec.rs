// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed documents and per-collection codecs.
//!
//! A collection may register at most one codec. Documents arriving after
//! registration are stored decoded; documents stored earlier stay raw.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// A decoded, strongly-typed collection element.
///
/// Implementations are ordinary serde structs; this is the minimal
/// object-safe surface the store needs to address and re-encode values.
pub trait TypedDocument: Any + Send + Sync + fmt::Debug {
    /// The document's `_id`.
    fn id(&self) -> &str;

    /// Upcast for caller-side downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Bidirectional mapping between a typed object and an EJSON document,
/// carried as raw JSON bytes.
pub trait DocumentCodec: Send + Sync {
    /// Decode raw JSON bytes into a typed object.
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Arc<dyn TypedDocument>>;

    /// Encode a typed object back to raw JSON bytes.
    fn encode(&self, object: &dyn TypedDocument) -> anyhow::Result<Vec<u8>>;
}

/// Codec backed by a serde-(de)serializable document type.
pub struct SerdeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeCodec<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for SerdeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DocumentCodec for SerdeCodec<T>
where
    T: TypedDocument + Serialize + DeserializeOwned,
{
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Arc<dyn TypedDocument>> {
        let value: T = serde_json::from_slice(bytes)?;
        Ok(Arc::new(value))
    }

    fn encode(&self, object: &dyn TypedDocument) -> anyhow::Result<Vec<u8>> {
        let concrete = object
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| anyhow::anyhow!("object is not a {}", std::any::type_name::<T>()))?;
        Ok(serde_json::to_vec(concrete)?)
    }
}

/// Encode a typed object and parse the bytes back into a document map.
pub fn encode_document(
    codec: &dyn DocumentCodec,
    object: &dyn TypedDocument,
) -> anyhow::Result<Map<String, Value>> {
    let bytes = codec.encode(object)?;
    match serde_json::from_slice(&bytes)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("encoded document is not an object: {other}"),
    }
}

/// Collection name → codec table.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn DocumentCodec>>,
}

impl CodecRegistry {
    /// Register a codec, replacing any previous one for the collection.
    pub fn register(&mut self, collection: &str, codec: Arc<dyn DocumentCodec>) {
        self.codecs.insert(collection.to_owned(), codec);
    }

    pub fn get(&self, collection: &str) -> Option<&Arc<dyn DocumentCodec>> {
        self.codecs.get(collection)
    }
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
