// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Logon parameter building and the OAuth redirect flow.
//!
//! All logon variants reduce to the `login` (or `createUser`) method over
//! the normal method path; this module builds the parameter documents and
//! handles the one HTTP excursion: fetching the OAuth completion page and
//! scraping the credential secret out of its hidden config div.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::ejson::{self, EjsonDate};
use crate::error::DdpError;
use crate::store::Document;

/// Authentication lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    NoAuth,
    LoggingIn,
    LoggedIn,
    LoggedOut,
}

/// Identifies the account for a password login.
#[derive(Debug, Clone)]
pub enum UserIdent {
    Username(String),
    Email(String),
}

/// An established server session.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginSession {
    pub user_id: String,
    pub token: String,
    pub token_expires: Option<EjsonDate>,
}

/// Callback for a logon or signup outcome.
pub type LoginCallback = Box<dyn FnOnce(Result<LoginSession, DdpError>) + Send>;

// -- Parameter documents -------------------------------------------------------

/// Lowercase-hex SHA-256 digest of the cleartext password.
pub fn password_digest(password: &str) -> String {
    let hash = Sha256::digest(password.as_bytes());
    let mut hex = String::with_capacity(hash.len() * 2);
    for byte in hash {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn password_document(password: &str) -> Value {
    json!({"digest": password_digest(password), "algorithm": "sha-256"})
}

/// `login` parameters for a username/email + password logon.
pub(crate) fn password_params(user: &UserIdent, password: &str) -> Value {
    let user = match user {
        UserIdent::Username(username) => json!({"username": username}),
        UserIdent::Email(email) => json!({"email": email}),
    };
    json!({"user": user, "password": password_document(password)})
}

/// `login` parameters for a session-token resume.
pub(crate) fn resume_params(token: &str) -> Value {
    json!({"resume": token})
}

/// `createUser` parameters for a signup.
pub(crate) fn signup_params(
    username: Option<&str>,
    email: Option<&str>,
    password: &str,
    profile: &Document,
) -> Value {
    let mut params = serde_json::Map::new();
    if let Some(username) = username {
        params.insert("username".to_owned(), Value::String(username.to_owned()));
    }
    if let Some(email) = email {
        params.insert("email".to_owned(), Value::String(email.to_owned()));
    }
    params.insert("password".to_owned(), password_document(password));
    params.insert("profile".to_owned(), Value::Object(profile.clone()));
    Value::Object(params)
}

/// Parse a `login`/`createUser` result value into a session.
pub(crate) fn parse_login_result(result: &Value) -> Option<LoginSession> {
    let user_id = result.get("id")?.as_str()?.to_owned();
    let token = result.get("token")?.as_str()?.to_owned();
    let token_expires =
        result.get("tokenExpires").and_then(ejson::as_date).map(EjsonDate);
    Some(LoginSession { user_id, token, token_expires })
}

// -- OAuth redirect flow -------------------------------------------------------

/// Rewrite `ws[s]://host/websocket` to `http[s]://host` for the OAuth
/// completion fetch.
pub(crate) fn http_base_url(ws_url: &str) -> String {
    let base = if ws_url.starts_with("wss://") {
        ws_url.replacen("wss://", "https://", 1)
    } else {
        ws_url.replacen("ws://", "http://", 1)
    };
    let base = base.trim_end_matches('/');
    base.strip_suffix("/websocket").unwrap_or(base).to_owned()
}

/// Token query parameter name: Facebook hands over an access token, the
/// other services an authorization code.
pub(crate) fn token_type(service: &str) -> &'static str {
    if service == "facebook" {
        "accessToken"
    } else {
        "code"
    }
}

/// Random credential token for the OAuth handshake.
pub(crate) fn generate_credential_token() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the `/_oauth/<service>/` completion URL.
pub(crate) fn oauth_url(
    ws_url: &str,
    service: &str,
    token: &str,
    credential_token: &str,
) -> String {
    let state = json!({"credentialToken": credential_token, "loginStyle": "popup"});
    let state = STANDARD.encode(state.to_string());
    format!(
        "{base}/_oauth/{service}/?{token_type}={token}&state={state}",
        base = http_base_url(ws_url),
        token_type = token_type(service),
        token = urlencoding(token),
        state = urlencoding(&state),
    )
}

/// Extract the JSON payload hidden in the completion page's
/// `<div id="config" style="display:none;">…</div>`.
pub(crate) fn extract_oauth_config(html: &str) -> Option<Value> {
    let marker = r#"<div id="config" style="display:none;">"#;
    let start = html.find(marker)? + marker.len();
    let end = html[start..].find("</div>")? + start;
    serde_json::from_str(html[start..end].trim()).ok()
}

/// Fetch the OAuth completion page and build the `login` parameters
/// `{oauth: {credentialToken, credentialSecret}}`.
pub(crate) async fn oauth_login_params(
    http: &reqwest::Client,
    ws_url: &str,
    service: &str,
    token: &str,
) -> Result<Value, DdpError> {
    let credential_token = generate_credential_token();
    let url = oauth_url(ws_url, service, token, &credential_token);

    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| DdpError::LogonRejected(format!("oauth fetch failed: {e}")))?;
    let html = response
        .text()
        .await
        .map_err(|e| DdpError::LogonRejected(format!("oauth fetch failed: {e}")))?;

    let config = extract_oauth_config(&html)
        .ok_or_else(|| DdpError::LogonRejected("oauth config payload missing".to_owned()))?;
    if config.get("setCredentialToken").and_then(Value::as_bool) != Some(true) {
        return Err(DdpError::LogonRejected("credential token was not set".to_owned()));
    }
    let secret = config
        .get("credentialSecret")
        .and_then(Value::as_str)
        .ok_or_else(|| DdpError::LogonRejected("credential secret missing".to_owned()))?;

    Ok(json!({
        "oauth": {
            "credentialToken": credential_token,
            "credentialSecret": secret,
        }
    }))
}

/// Percent-encode a query value (unreserved characters pass through).
fn urlencoding(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(char::from(b));
            }
            _ => {
                out.push('%');
                out.push(char::from(HEX[(b >> 4) as usize]));
                out.push(char::from(HEX[(b & 0xf) as usize]));
            }
        }
    }
    out
}

const HEX: &[u8; 16] = b"0123456789ABCDEF";

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
