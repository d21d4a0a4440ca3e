// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Offline overlay: persist typed collections to cache files and restore
//! them with a from-cache marker.
//!
//! One file per collection, `<cache-dir>/<collection>.cache`, holding a
//! UTF-8 JSON array of typed documents. No header, no version field.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::ejson;
use crate::store::{ChangeEvent, Origin, Store};

/// Reserved field stamped at persist time when absent.
pub const LAST_UPDATED_FIELD: &str = "_lastUpdated_";

/// Reserved field set on cache-restored documents; cleared when the
/// server first delivers a replacement for the same id.
pub const WAS_OFFLINE_FIELD: &str = "_wasOffline_";

/// Cache file path for a collection.
pub(crate) fn cache_path(cache_dir: &Path, collection: &str) -> PathBuf {
    cache_dir.join(format!("{collection}.cache"))
}

/// A serialized collection ready for a background write.
#[derive(Debug)]
pub(crate) struct PersistPayload {
    pub path: PathBuf,
    pub json: String,
}

/// Stamp `_lastUpdated_` on entries lacking one and serialize the
/// collection in order. Stamped documents are re-decoded into the store
/// so the in-memory value matches what lands on disk.
pub(crate) fn prepare_persist(
    store: &mut Store,
    collection: &str,
    cache_dir: &Path,
) -> anyhow::Result<PersistPayload> {
    let codec = store
        .codec(collection)
        .ok_or_else(|| anyhow::anyhow!("offline persistence requires a codec for {collection}"))?;
    let now = ejson::epoch_ms();

    let ids = store.order(collection);
    let mut docs = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(value) = store.document(collection, &id) else {
            continue;
        };
        let mut doc = value.to_document(Some(&codec))?;
        if !doc.contains_key(LAST_UPDATED_FIELD) {
            doc.insert(LAST_UPDATED_FIELD.to_owned(), ejson::date_value(now));
            let restamped = store.decode_or_raw(collection, doc.clone());
            if let Some(entry) = store.collection_mut(collection).docs.get_mut(&id) {
                entry.value = restamped;
            }
        }
        docs.push(Value::Object(doc));
    }

    let json = serde_json::to_string(&Value::Array(docs))?;
    Ok(PersistPayload { path: cache_path(cache_dir, collection), json })
}

/// Write a payload atomically (tmp + rename), creating the cache
/// directory as needed. Runs on a background task, off the session loop.
pub(crate) fn write_payload(payload: &PersistPayload) -> anyhow::Result<()> {
    if let Some(parent) = payload.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = payload.path.with_extension("tmp");
    std::fs::write(&tmp_path, &payload.json)?;
    std::fs::rename(&tmp_path, &payload.path)?;
    Ok(())
}

/// Read the cache file (if present) and insert each document with
/// `_wasOffline_ = true` and `Origin::Cache`. No RPCs are sent; the
/// collection is created if absent. Returns the `added` events to
/// dispatch.
pub(crate) fn restore(
    store: &mut Store,
    collection: &str,
    cache_dir: &Path,
) -> anyhow::Result<Vec<ChangeEvent>> {
    if store.codec(collection).is_none() {
        anyhow::bail!("offline restore requires a codec for {collection}");
    }
    store.collection_mut(collection);

    let path = cache_path(cache_dir, collection);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let Value::Array(items) = serde_json::from_str(&contents)? else {
        anyhow::bail!("cache file for {collection} is not a JSON array");
    };

    let mut events = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(mut doc) = item else {
            tracing::warn!(collection, "skipping non-object cache entry");
            continue;
        };
        doc.insert(WAS_OFFLINE_FIELD.to_owned(), Value::Bool(true));
        let value = store.decode_or_raw(collection, doc);
        match store.insert_local(collection, value, Origin::Cache) {
            Some(event) => events.push(event),
            None => tracing::warn!(collection, "skipping cache entry without _id"),
        }
    }
    Ok(events)
}

/// Remove every entry still carrying the from-cache marker, then delete
/// the cache file. Returns the `removed` events to dispatch.
pub(crate) fn clear_offline(
    store: &mut Store,
    collection: &str,
    cache_dir: &Path,
) -> anyhow::Result<Vec<ChangeEvent>> {
    let cached: Vec<String> = store
        .order(collection)
        .into_iter()
        .filter(|id| store.is_from_cache(collection, id))
        .collect();

    let events = cached.into_iter().map(|id| store.apply_removed(collection, &id)).collect();

    let path = cache_path(cache_dir, collection);
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(events)
}

#[cfg(test)]
#[path = "offline_tests.rs"]
mod tests;
