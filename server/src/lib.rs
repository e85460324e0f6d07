//! # Relay Server Library
//!
//! This library provides the relay server for a shared social-VR session.
//! Peers authenticate with a decentralized identifier (or a shared password),
//! then stream avatar movement, voice and scene data through the server,
//! which fans each message out to the right set of other peers.
//!
//! ## Core Responsibilities
//!
//! ### Authentication
//! A connecting peer claims an identity. In DID mode the server answers with
//! a random nonce; the peer signs it with the key behind its `did:key`, and
//! the server resolves the DID and checks the signature before admitting it.
//! Banned identities are refused before any challenge is issued.
//!
//! ### Relay
//! Every inbound packet is routed by channel to one handler. Lossy traffic
//! (movement, voice) is subject to per-peer queue-depth backpressure; reliable
//! traffic never is. Unreliable traffic rides the fall channel behind a
//! one-byte redirect.
//!
//! ### Shared State
//! The server is authoritative for object ownership, short network ids,
//! loaded resources, the admin set and the ban list. It caches each player's
//! last avatar, metadata, voice routing and movement so late joiners can be
//! brought up to date immediately.
//!
//! ## Architecture Design
//!
//! ### Event Loop and Workers
//! The transport raises events on one channel. The server loop handles
//! connect requests itself and hands packets and disconnects to a fixed pool
//! of dispatch workers, picking the worker by peer id so one peer's traffic is
//! always processed in order.
//!
//! ### No Globals
//! All state hangs off one [`context::ServerContext`] built at startup. Tests
//! build as many as they like, each over an in-memory transport.
//!
//! ## Module Organization
//!
//! - [`transport`]: the transport seam and an in-memory implementation
//! - [`network`], [`client_manager`]: the UDP transport and its connections
//! - [`buffer`]: size-classed packet buffers
//! - [`auth`], [`session`]: authentication, identities, admins and bans
//! - [`dispatch`], [`relay`]: inbound routing and outbound fan-out
//! - [`ownership`], [`cache`], [`net_ids`], [`stats`]: shared state
//! - [`store`]: the encrypted key/JSON store
//! - [`config`], [`error`]: configuration and error types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::Configuration;
//! use server::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Configuration {
//!         admins: vec!["did:key:z6MkhaXgBZDvotDkL5257faiztiGiC2QtKLGpbnnEGta2doK".into()],
//!         ..Configuration::default()
//!     };
//!
//!     let server = Server::bind(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod buffer;
pub mod cache;
pub mod client_manager;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod net_ids;
pub mod network;
pub mod ownership;
pub mod relay;
pub mod server;
pub mod session;
pub mod stats;
pub mod store;
pub mod transport;
