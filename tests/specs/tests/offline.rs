// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Offline overlay: persist in one client, restore in a fresh one,
//! reconcile with server truth, clear.

use serde::{Deserialize, Serialize};
use serde_json::json;

use ddp_client::{ClientEvent, EjsonDate, TypedDocument};
use ddp_specs::{collection_order, spec_client, wait_event, wait_for, SpecServer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    _id: String,
    text: String,
    #[serde(rename = "_lastUpdated_", default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<EjsonDate>,
    #[serde(rename = "_wasOffline_", default)]
    was_offline: bool,
}

impl TypedDocument for Note {
    fn id(&self) -> &str {
        &self._id
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn was_offline(value: &ddp_client::StoredValue) -> Option<bool> {
    value.as_typed::<Note>().map(|n| n.was_offline)
}

#[tokio::test]
async fn persist_restore_reconcile_clear() -> anyhow::Result<()> {
    let mut server = SpecServer::start().await?;
    let dir = tempfile::tempdir()?;
    let cache_file = dir.path().join("notes.cache");

    // First client: receive two documents, persist them.
    {
        let client = spec_client(&server.ws_url(), dir.path());
        let mut events = client.events();
        client.register_type::<Note>("notes").await;

        client.connect();
        let conn = server.accept().await?;
        wait_event(&mut events, |e| *e == ClientEvent::Connected).await?;

        conn.send(json!({"msg": "added", "collection": "notes", "id": "n1", "fields": {"text": "one"}}));
        conn.send(json!({"msg": "added", "collection": "notes", "id": "n2", "fields": {"text": "two"}}));
        wait_for(|| {
            let client = client.clone();
            async move { client.documents("notes").await.len() == 2 }
        })
        .await?;

        client.persist_collection("notes");
        // Short debounce in the spec config; wait for the background write.
        let path = cache_file.clone();
        wait_for(|| {
            let path = path.clone();
            async move { path.exists() }
        })
        .await?;

        // The process "drops" here.
        client.shutdown();
    }

    // Fresh client: restore before connecting.
    let client = spec_client(&server.ws_url(), dir.path());
    let mut events = client.events();
    client.register_type::<Note>("notes").await;
    client.restore_collection("notes");

    wait_for(|| {
        let client = client.clone();
        async move {
            let docs = client.documents("notes").await;
            docs.len() == 2 && docs.iter().all(|v| was_offline(v) == Some(true))
        }
    })
    .await?;

    // The reconnect reset spares cache-restored documents.
    client.connect();
    let conn = server.accept().await?;
    wait_event(&mut events, |e| *e == ClientEvent::Connected).await?;
    assert_eq!(collection_order(&client, "notes").await, ["n1", "n2"]);

    // Server truth replaces n1 and clears its offline marker.
    conn.send(json!({"msg": "added", "collection": "notes", "id": "n1", "fields": {"text": "fresh"}}));
    wait_for(|| {
        let client = client.clone();
        async move {
            client.document("notes", "n1").await.as_ref().and_then(was_offline) == Some(false)
        }
    })
    .await?;
    assert_eq!(
        client.document("notes", "n2").await.as_ref().and_then(was_offline),
        Some(true)
    );

    // Clear removes only the still-cached entry, plus the file.
    client.clear_offline("notes");
    wait_for(|| {
        let client = client.clone();
        async move { collection_order(&client, "notes").await == ["n1"] }
    })
    .await?;
    wait_for(|| {
        let path = cache_file.clone();
        async move { !path.exists() }
    })
    .await?;

    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn persist_requests_coalesce_into_one_write() -> anyhow::Result<()> {
    let mut server = SpecServer::start().await?;
    let dir = tempfile::tempdir()?;
    let client = spec_client(&server.ws_url(), dir.path());
    let mut events = client.events();
    client.register_type::<Note>("notes").await;

    client.connect();
    let conn = server.accept().await?;
    wait_event(&mut events, |e| *e == ClientEvent::Connected).await?;

    conn.send(json!({"msg": "added", "collection": "notes", "id": "n1", "fields": {"text": "one"}}));
    wait_for(|| {
        let client = client.clone();
        async move { client.documents("notes").await.len() == 1 }
    })
    .await?;

    // Burst of requests inside the debounce window.
    for _ in 0..5 {
        client.persist_collection("notes");
    }
    let path = dir.path().join("notes.cache");
    wait_for(|| {
        let path = path.clone();
        async move { path.exists() }
    })
    .await?;

    let contents = std::fs::read_to_string(&path)?;
    let docs: Vec<serde_json::Value> = serde_json::from_str(&contents)?;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["text"], json!("one"));
    assert!(docs[0]["_lastUpdated_"]["$date"].is_number());

    client.shutdown();
    Ok(())
}
