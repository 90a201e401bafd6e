//! # Session Relay Server Library
//!
//! This library provides the session and channel layer of a distributed game
//! server cluster. Frontend processes hold client connections and the
//! authoritative state of each connection's session. Backend processes run
//! game logic and reach those sessions through read-mostly snapshots and
//! explicit remote calls.
//!
//! ## Core Responsibilities
//!
//! ### Session Ownership
//! Every client connection on a frontend gets a [`session::Session`] with a
//! process-unique id, an optional bound user id and a map of settings. The
//! frontend's [`session::SessionService`] is the only place those fields are
//! ever written authoritatively.
//!
//! ### Backend Snapshots
//! Backends fetch [`backend_session::BackendSession`] copies by session id or
//! user id. Local changes to a copy stay local until the backend pushes them
//! back with an explicit call, so a write is never propagated by accident.
//!
//! ### Channels and Fan-Out
//! A [`channel::Channel`] groups users by the frontend that holds them.
//! Pushing to a channel makes one remote call per frontend, never one per
//! user, and failures are reported per frontend partition.
//!
//! ## Architecture Design
//!
//! ### Explicit Process Context
//! There is no process-global application object. A
//! [`context::ProcessContext`] is built once at start from the server's
//! config, its cluster topology and an RPC gateway, and handed to whatever
//! needs it.
//!
//! ### Sequential Remote Handling
//! Requests arriving at a process are taken off its inbound queue one at a
//! time. Writes to a session therefore land in the order the frontend
//! received them.
//!
//! ### Plain-Data Boundary
//! Everything crossing a process boundary is a [`shared::RemoteRequest`] or
//! [`shared::RemoteResponse`], encoded with bincode. No handle or closure
//! ever leaves its process.
//!
//! ## Module Organization
//!
//! - `session`: frontend sessions, their registry and connection events
//! - `backend_session`: snapshots and the remote calls that change sessions
//! - `channel` / `channel_service`: channel membership and pushes
//! - `push`: receiver partitioning and concurrent per-frontend fan-out
//! - `rpc`: the [`rpc::RpcGateway`] trait and the in-process [`rpc::LocalCluster`]
//! - `filter`: before/after filters around every served request
//! - `topology`: which servers exist and which of them are frontends
//! - `context`: component registration and request serving
//! - `config` / `error`: settings and the shared error type
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::context::{ProcessContext, ProcessHooks};
//! use server::rpc::LocalCluster;
//! use server::topology::StaticTopology;
//! use shared::ServerInfo;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let connector = ServerInfo::frontend("connector-1", "connector", "127.0.0.1", 3010);
//!     let topology = Arc::new(StaticTopology::new(vec![connector.clone()]));
//!     let cluster = Arc::new(LocalCluster::new(Duration::from_secs(5)));
//!
//!     let context = Arc::new(ProcessContext::start(
//!         ServerConfig::new(connector),
//!         topology,
//!         cluster.clone(),
//!         ProcessHooks::default(),
//!     ));
//!     context.serve(cluster.register("connector-1").await).await;
//! }
//! ```

pub mod backend_session;
pub mod channel;
pub mod channel_service;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod push;
pub mod rpc;
pub mod session;
pub mod topology;

pub use error::{Error, Result};
