// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The replicated document store.
//!
//! Collections are insertion-ordered maps from `_id` to a stored value —
//! either a raw EJSON document or, when a codec is registered, a decoded
//! typed object. Mutations are driven exclusively by incoming frames (plus
//! the optimistic local paths); each mutation yields a [`ChangeEvent`]
//! which the session loop hands to the dispatcher after releasing the
//! store lock.

pub mod codec;
pub mod dispatch;
pub mod offline;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::ordered::OrderedMap;
use crate::store::codec::{encode_document, CodecRegistry, DocumentCodec, TypedDocument};
use crate::store::dispatch::ChangeReason;

/// A plain EJSON document: string fields, mandatory string `_id`.
pub type Document = Map<String, Value>;

/// A value held by a collection.
#[derive(Debug, Clone)]
pub enum StoredValue {
    /// Untyped document, as received.
    Raw(Document),
    /// Decoded object from the collection's codec.
    Typed(Arc<dyn TypedDocument>),
}

impl StoredValue {
    /// The document's `_id`, if present.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Raw(doc) => doc.get("_id").and_then(Value::as_str),
            Self::Typed(obj) => Some(obj.id()),
        }
    }

    pub fn as_raw(&self) -> Option<&Document> {
        match self {
            Self::Raw(doc) => Some(doc),
            Self::Typed(_) => None,
        }
    }

    /// Downcast a typed value to its concrete type.
    pub fn as_typed<T: 'static>(&self) -> Option<&T> {
        match self {
            Self::Raw(_) => None,
            Self::Typed(obj) => obj.as_any().downcast_ref::<T>(),
        }
    }

    /// Wrap a concrete typed document.
    pub fn from_typed<T: TypedDocument>(value: T) -> Self {
        Self::Typed(Arc::new(value))
    }

    /// Convert back to a plain document. Typed values re-encode through
    /// the collection codec.
    pub(crate) fn to_document(
        &self,
        codec: Option<&Arc<dyn DocumentCodec>>,
    ) -> anyhow::Result<Document> {
        match self {
            Self::Raw(doc) => Ok(doc.clone()),
            Self::Typed(obj) => {
                let codec = codec
                    .ok_or_else(|| anyhow::anyhow!("typed value without a registered codec"))?;
                encode_document(codec.as_ref(), obj.as_ref())
            }
        }
    }
}

impl From<Document> for StoredValue {
    fn from(doc: Document) -> Self {
        Self::Raw(doc)
    }
}

impl From<Arc<dyn TypedDocument>> for StoredValue {
    fn from(obj: Arc<dyn TypedDocument>) -> Self {
        Self::Typed(obj)
    }
}

/// Where a stored entry came from. `Cache` entries survive the
/// reset-on-reconnect and are the targets of `clear_offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Server,
    Cache,
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub value: StoredValue,
    pub origin: Origin,
}

/// One store change, consumed by the dispatcher after the store lock is
/// released. `value` is the post-operation value, or the prior value for
/// `Removed` (absent when there was none).
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: String,
    pub reason: ChangeReason,
    pub id: String,
    pub value: Option<StoredValue>,
}

#[derive(Default)]
pub(crate) struct Collection {
    pub docs: OrderedMap<String, Entry>,
}

/// All collections plus the codec table. Shared behind the client's
/// coarse lock; only the session loop mutates it.
#[derive(Default)]
pub struct Store {
    collections: HashMap<String, Collection>,
    codecs: CodecRegistry,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec for a collection. Documents already stored raw are
    /// not retroactively converted.
    pub fn register_codec(&mut self, collection: &str, codec: Arc<dyn DocumentCodec>) {
        self.codecs.register(collection, codec);
    }

    pub(crate) fn codec(&self, collection: &str) -> Option<Arc<dyn DocumentCodec>> {
        self.codecs.get(collection).cloned()
    }

    /// Ordered snapshot of a collection's values.
    pub fn snapshot(&self, collection: &str) -> Vec<StoredValue> {
        self.collections
            .get(collection)
            .map(|c| c.docs.values().map(|e| e.value.clone()).collect())
            .unwrap_or_default()
    }

    /// Ordered document ids of a collection.
    pub fn order(&self, collection: &str) -> Vec<String> {
        self.collections
            .get(collection)
            .map(|c| c.docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<StoredValue> {
        self.collections.get(collection)?.docs.get(id).map(|e| e.value.clone())
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.docs.len())
    }

    /// Values passing a caller-supplied predicate, in collection order.
    pub fn find(
        &self,
        collection: &str,
        predicate: impl Fn(&StoredValue) -> bool,
    ) -> Vec<StoredValue> {
        self.collections
            .get(collection)
            .map(|c| {
                c.docs
                    .values()
                    .filter(|e| predicate(&e.value))
                    .map(|e| e.value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether an entry was restored from the offline cache.
    pub fn is_from_cache(&self, collection: &str, id: &str) -> bool {
        self.collections
            .get(collection)
            .and_then(|c| c.docs.get(id))
            .is_some_and(|e| e.origin == Origin::Cache)
    }

    // -- Frame application ----------------------------------------------------

    /// `added`: append to the end of the collection.
    pub(crate) fn apply_added(&mut self, collection: &str, id: &str, fields: Document) -> ChangeEvent {
        let value = self.decode_or_raw(collection, build_document(id, fields));
        let entry = Entry { value: value.clone(), origin: Origin::Server };
        self.collection_mut(collection).docs.put(id.to_owned(), entry);
        ChangeEvent {
            collection: collection.to_owned(),
            reason: ChangeReason::Added,
            id: id.to_owned(),
            value: Some(value),
        }
    }

    /// `addedBefore`: insert before `before`; unknown or absent `before`
    /// appends.
    pub(crate) fn apply_added_before(
        &mut self,
        collection: &str,
        id: &str,
        fields: Document,
        before: Option<&str>,
    ) -> ChangeEvent {
        let value = self.decode_or_raw(collection, build_document(id, fields));
        let entry = Entry { value: value.clone(), origin: Origin::Server };
        let col = self.collection_mut(collection);
        match before.and_then(|b| col.docs.index_of(b)) {
            Some(index) => {
                col.docs.put_at(id.to_owned(), entry, index);
            }
            None => {
                col.docs.put(id.to_owned(), entry);
            }
        }
        ChangeEvent {
            collection: collection.to_owned(),
            reason: ChangeReason::AddedBefore,
            id: id.to_owned(),
            value: Some(value),
        }
    }

    /// `changed`: re-encode the stored value to a plain document, apply
    /// `fields` and `cleared`, re-decode, replace in place. An unknown
    /// document is stored as if newly added.
    pub(crate) fn apply_changed(
        &mut self,
        collection: &str,
        id: &str,
        fields: Document,
        cleared: &[String],
    ) -> ChangeEvent {
        let Some(entry) = self.collections.get(collection).and_then(|c| c.docs.get(id)).cloned()
        else {
            tracing::warn!(collection, id, "changed for unknown document, storing as added");
            return self.apply_added(collection, id, fields);
        };

        let codec = self.codec(collection);
        let mut doc = match entry.value.to_document(codec.as_ref()) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(collection, id, err = %e, "stored value not re-encodable, rebuilding from frame");
                Document::new()
            }
        };
        doc.insert("_id".to_owned(), Value::String(id.to_owned()));
        for (field, value) in fields {
            doc.insert(field, value);
        }
        for field in cleared {
            doc.remove(field);
        }

        let value = self.decode_or_raw(collection, doc);
        if let Some(slot) = self.collection_mut(collection).docs.get_mut(id) {
            *slot = Entry { value: value.clone(), origin: entry.origin };
        }
        ChangeEvent {
            collection: collection.to_owned(),
            reason: ChangeReason::Changed,
            id: id.to_owned(),
            value: Some(value),
        }
    }

    /// `movedBefore`: reposition an existing entry. The target index is
    /// resolved before the entry is removed; absent or unknown `before`
    /// moves it to the end.
    pub(crate) fn apply_moved_before(
        &mut self,
        collection: &str,
        id: &str,
        before: Option<&str>,
    ) -> Option<ChangeEvent> {
        let col = self.collections.get_mut(collection)?;
        let target = before.and_then(|b| col.docs.index_of(b));
        let entry = col.docs.remove(id);
        let Some(entry) = entry else {
            tracing::warn!(collection, id, "movedBefore for unknown document");
            return None;
        };
        let value = entry.value.clone();
        match target {
            Some(index) => {
                col.docs.put_at(id.to_owned(), entry, index);
            }
            None => {
                col.docs.put(id.to_owned(), entry);
            }
        }
        Some(ChangeEvent {
            collection: collection.to_owned(),
            reason: ChangeReason::MovedBefore,
            id: id.to_owned(),
            value: Some(value),
        })
    }

    /// `removed`: drop the entry; the event carries the prior value
    /// (absent when the document was unknown).
    pub(crate) fn apply_removed(&mut self, collection: &str, id: &str) -> ChangeEvent {
        let prior = self.collections.get_mut(collection).and_then(|c| c.docs.remove(id));
        ChangeEvent {
            collection: collection.to_owned(),
            reason: ChangeReason::Removed,
            id: id.to_owned(),
            value: prior.map(|e| e.value),
        }
    }

    // -- Local paths ----------------------------------------------------------

    /// Optimistic local add (no frame involved).
    pub(crate) fn insert_local(
        &mut self,
        collection: &str,
        value: StoredValue,
        origin: Origin,
    ) -> Option<ChangeEvent> {
        let id = value.id()?.to_owned();
        let entry = Entry { value: value.clone(), origin };
        self.collection_mut(collection).docs.put(id.clone(), entry);
        Some(ChangeEvent {
            collection: collection.to_owned(),
            reason: ChangeReason::Added,
            id,
            value: Some(value),
        })
    }

    /// Drop every server-sourced entry, keeping cache-restored ones.
    /// Runs on reconnect before subscriptions replay.
    pub(crate) fn reset_keeping_cache(&mut self) {
        for col in self.collections.values_mut() {
            col.docs.retain(|_, entry| entry.origin == Origin::Cache);
        }
    }

    // -- Internals ------------------------------------------------------------

    pub(crate) fn collection_mut(&mut self, name: &str) -> &mut Collection {
        self.collections.entry(name.to_owned()).or_default()
    }

    /// Decode through the collection codec when one is registered; fall
    /// back to the raw document on failure.
    fn decode_or_raw(&self, collection: &str, doc: Document) -> StoredValue {
        let Some(codec) = self.codecs.get(collection) else {
            return StoredValue::Raw(doc);
        };
        let bytes = match serde_json::to_vec(&doc) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(collection, err = %e, "document not serializable for decode");
                return StoredValue::Raw(doc);
            }
        };
        match codec.decode(&bytes) {
            Ok(typed) => StoredValue::Typed(typed),
            Err(e) => {
                tracing::warn!(collection, err = %e, "document decode failed, storing raw");
                StoredValue::Raw(doc)
            }
        }
    }
}

/// `{_id, ...fields}` as one document.
fn build_document(id: &str, fields: Document) -> Document {
    let mut doc = fields;
    doc.insert("_id".to_owned(), Value::String(id.to_owned()));
    doc
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
