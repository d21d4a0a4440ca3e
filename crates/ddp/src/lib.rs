// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! DDP client: JSON-framed RPC + pub/sub over WebSocket, backed by a
//! replicated, insertion-ordered document store.
//!
//! The client speaks the Distributed Data Protocol used by Meteor
//! servers: it negotiates a session over a WebSocket, invokes remote
//! methods, subscribes to named publications, and mirrors the server's
//! document streams into per-collection ordered maps. Collections may
//! register typed codecs, watch for per-document changes, and persist
//! their contents to an offline cache that survives reconnects.

pub mod auth;
pub mod client;
pub mod config;
pub mod ejson;
pub mod error;
pub mod events;
pub mod ordered;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;

pub use auth::{AuthState, LoginCallback, LoginSession, UserIdent};
pub use client::Client;
pub use config::{ClientConfig, ProtocolVersion};
pub use ejson::{EjsonBinary, EjsonDate};
pub use error::DdpError;
pub use events::ClientEvent;
pub use ordered::OrderedMap;
pub use session::method::MethodCallback;
pub use session::subscription::{GroupReadyCallback, ReadyCallback};
pub use session::SessionState;
pub use store::codec::{DocumentCodec, SerdeCodec, TypedDocument};
pub use store::dispatch::{ChangeReason, WatchCallback, WatchPredicate, WatcherId};
pub use store::offline::{LAST_UPDATED_FIELD, WAS_OFFLINE_FIELD};
pub use store::{ChangeEvent, Document, Store, StoredValue};
