// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Login, resume, signup, and OAuth flows against the scripted server.

use std::sync::{Arc, Mutex};

use serde_json::json;

use ddp_client::{AuthState, ClientEvent, DdpError, LoginCallback, LoginSession};
use ddp_specs::{spec_client, wait_event, wait_for, SpecServer};

type LoginOutcomes = Arc<Mutex<Vec<Result<LoginSession, DdpError>>>>;

fn login_cb(outcomes: &LoginOutcomes) -> LoginCallback {
    let outcomes = Arc::clone(outcomes);
    Box::new(move |outcome| {
        if let Ok(mut entries) = outcomes.lock() {
            entries.push(outcome);
        }
    })
}

fn recorded(outcomes: &LoginOutcomes) -> Vec<Result<LoginSession, DdpError>> {
    outcomes.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

const PW_DIGEST: &str = "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8";

#[tokio::test]
async fn password_login_stores_session_and_notifies() -> anyhow::Result<()> {
    let mut server = SpecServer::start().await?;
    let dir = tempfile::tempdir()?;
    let client = spec_client(&server.ws_url(), dir.path());
    let mut events = client.events();

    client.connect();
    let mut conn = server.accept().await?;
    wait_event(&mut events, |e| *e == ClientEvent::Connected).await?;

    let outcomes: LoginOutcomes = Arc::default();
    client.login_with_username("alice", "password", Some(login_cb(&outcomes)));

    let frame = conn.expect("method").await?;
    assert_eq!(frame["method"], "login");
    let params = &frame["params"][0];
    assert_eq!(params["user"], json!({"username": "alice"}));
    assert_eq!(params["password"]["digest"], json!(PW_DIGEST));
    assert_eq!(params["password"]["algorithm"], json!("sha-256"));

    conn.send(json!({
        "msg": "result",
        "id": frame["id"],
        "result": {"id": "u1", "token": "tok-1", "tokenExpires": {"$date": 1_800_000_000_000i64}},
    }));

    wait_event(
        &mut events,
        |e| matches!(e, ClientEvent::SessionUpdate { user_id: Some(u) } if u == "u1"),
    )
    .await?;
    match &recorded(&outcomes)[0] {
        Ok(session) => {
            assert_eq!(session.user_id, "u1");
            assert_eq!(session.token, "tok-1");
        }
        Err(e) => anyhow::bail!("login failed: {e}"),
    }

    assert_eq!(client.auth_state(), AuthState::LoggedIn);
    let session = client.login_session().await;
    assert_eq!(session.map(|s| s.user_id), Some("u1".to_owned()));

    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn reconnect_resumes_with_stored_token() -> anyhow::Result<()> {
    let mut server = SpecServer::start().await?;
    let dir = tempfile::tempdir()?;
    let client = spec_client(&server.ws_url(), dir.path());
    let mut events = client.events();

    client.connect();
    let mut conn = server.accept().await?;
    wait_event(&mut events, |e| *e == ClientEvent::Connected).await?;

    // Establish a session.
    client.login_with_username("alice", "password", None);
    let frame = conn.expect("method").await?;
    conn.send(json!({
        "msg": "result",
        "id": frame["id"],
        "result": {"id": "u1", "token": "tok-1"},
    }));
    wait_event(&mut events, |e| matches!(e, ClientEvent::SessionUpdate { .. })).await?;

    // Renegotiate; the client resumes with the stored token on its own.
    client.connect();
    let mut conn2 = server.accept().await?;
    let resume = conn2.expect("method").await?;
    assert_eq!(resume["method"], "login");
    assert_eq!(resume["params"][0], json!({"resume": "tok-1"}));

    // Ready is withheld until the resume settles.
    conn2.send(json!({
        "msg": "result",
        "id": resume["id"],
        "result": {"id": "u1", "token": "tok-2"},
    }));
    wait_event(&mut events, |e| *e == ClientEvent::Ready).await?;

    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn second_in_flight_logon_is_rejected() -> anyhow::Result<()> {
    let mut server = SpecServer::start().await?;
    let dir = tempfile::tempdir()?;
    let client = spec_client(&server.ws_url(), dir.path());
    let mut events = client.events();

    client.connect();
    let mut conn = server.accept().await?;
    wait_event(&mut events, |e| *e == ClientEvent::Connected).await?;

    let first: LoginOutcomes = Arc::default();
    let second: LoginOutcomes = Arc::default();
    client.login_with_username("alice", "pw", Some(login_cb(&first)));
    client.login_with_username("bob", "pw", Some(login_cb(&second)));

    wait_for(|| {
        let second = Arc::clone(&second);
        async move { !second.lock().unwrap_or_else(|e| e.into_inner()).is_empty() }
    })
    .await?;
    assert!(matches!(recorded(&second)[0], Err(DdpError::LogonRejected(_))));

    // The first logon is still live and completes normally.
    let frame = conn.expect("method").await?;
    conn.send(json!({
        "msg": "result",
        "id": frame["id"],
        "result": {"id": "u1", "token": "t"},
    }));
    wait_for(|| {
        let first = Arc::clone(&first);
        async move { !first.lock().unwrap_or_else(|e| e.into_inner()).is_empty() }
    })
    .await?;
    assert!(recorded(&first)[0].is_ok());

    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn login_rejection_maps_to_logon_rejected() -> anyhow::Result<()> {
    let mut server = SpecServer::start().await?;
    let dir = tempfile::tempdir()?;
    let client = spec_client(&server.ws_url(), dir.path());
    let mut events = client.events();

    client.connect();
    let mut conn = server.accept().await?;
    wait_event(&mut events, |e| *e == ClientEvent::Connected).await?;

    let outcomes: LoginOutcomes = Arc::default();
    client.login_with_username("alice", "wrong", Some(login_cb(&outcomes)));
    let frame = conn.expect("method").await?;
    conn.send(json!({
        "msg": "result",
        "id": frame["id"],
        "error": {"error": 403, "reason": "Incorrect password", "errorType": "Meteor.Error"},
    }));

    wait_for(|| {
        let outcomes = Arc::clone(&outcomes);
        async move { !outcomes.lock().unwrap_or_else(|e| e.into_inner()).is_empty() }
    })
    .await?;
    match &recorded(&outcomes)[0] {
        Err(DdpError::LogonRejected(reason)) => assert!(reason.contains("Incorrect password")),
        other => anyhow::bail!("unexpected outcome: {other:?}"),
    }
    assert_eq!(client.auth_state(), AuthState::LoggedOut);

    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn signup_uses_create_user_method() -> anyhow::Result<()> {
    let mut server = SpecServer::start().await?;
    let dir = tempfile::tempdir()?;
    let client = spec_client(&server.ws_url(), dir.path());
    let mut events = client.events();

    client.connect();
    let mut conn = server.accept().await?;
    wait_event(&mut events, |e| *e == ClientEvent::Connected).await?;

    let mut profile = ddp_client::Document::new();
    profile.insert("fullName".to_owned(), json!("Alice B"));
    client.signup(Some("alice"), Some("a@b.c"), "password", profile, None);

    let frame = conn.expect("method").await?;
    assert_eq!(frame["method"], "createUser");
    let params = &frame["params"][0];
    assert_eq!(params["username"], json!("alice"));
    assert_eq!(params["email"], json!("a@b.c"));
    assert_eq!(params["password"]["digest"], json!(PW_DIGEST));
    assert_eq!(params["profile"]["fullName"], json!("Alice B"));

    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn logout_is_fire_and_forget_with_local_transition() -> anyhow::Result<()> {
    let mut server = SpecServer::start().await?;
    let dir = tempfile::tempdir()?;
    let client = spec_client(&server.ws_url(), dir.path());
    let mut events = client.events();

    client.connect();
    let mut conn = server.accept().await?;
    wait_event(&mut events, |e| *e == ClientEvent::Connected).await?;

    client.login_with_username("alice", "pw", None);
    let frame = conn.expect("method").await?;
    conn.send(json!({
        "msg": "result",
        "id": frame["id"],
        "result": {"id": "u1", "token": "t"},
    }));
    wait_event(&mut events, |e| matches!(e, ClientEvent::SessionUpdate { .. })).await?;

    client.logout();
    let frame = conn.expect("method").await?;
    assert_eq!(frame["method"], "logout");
    wait_event(&mut events, |e| *e == ClientEvent::SessionUpdate { user_id: None }).await?;
    assert_eq!(client.auth_state(), AuthState::LoggedOut);
    assert!(client.login_session().await.is_none());

    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn oauth_login_scrapes_the_config_div() -> anyhow::Result<()> {
    let mut server = SpecServer::start().await?;
    let dir = tempfile::tempdir()?;
    let client = spec_client(&server.ws_url(), dir.path());
    let mut events = client.events();

    client.connect();
    let mut conn = server.accept().await?;
    wait_event(&mut events, |e| *e == ClientEvent::Connected).await?;

    let outcomes: LoginOutcomes = Arc::default();
    client.login_with_oauth("github", "auth-code-1", Some(login_cb(&outcomes))).await;

    let frame = conn.expect("method").await?;
    assert_eq!(frame["method"], "login");
    let oauth = &frame["params"][0]["oauth"];
    assert_eq!(oauth["credentialSecret"], json!("secret-for-github"));
    assert!(oauth["credentialToken"].is_string());

    conn.send(json!({
        "msg": "result",
        "id": frame["id"],
        "result": {"id": "u-oauth", "token": "t"},
    }));
    wait_for(|| {
        let outcomes = Arc::clone(&outcomes);
        async move { !outcomes.lock().unwrap_or_else(|e| e.into_inner()).is_empty() }
    })
    .await?;
    let entries = recorded(&outcomes);
    assert_eq!(entries[0].as_ref().map(|s| s.user_id.as_str()), Ok("u-oauth"));

    client.shutdown();
    Ok(())
}
