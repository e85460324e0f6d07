//! Error types for the relay server.
//!
//! Authentication errors live next to the code that produces them in
//! [`crate::auth`] and [`crate::session`].

use crate::auth::AuthFailure;
use crate::transport::PeerId;
use shared::Channel;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("refusing to send an empty payload")]
    EmptyPayload,
    #[error("payload of {0} bytes is too large for its delivery method")]
    Oversized(usize),
    #[error("connection limit reached")]
    ServerFull,
    #[error("no socket bound")]
    NoSocket,
    #[error("transport is shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored entry is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("encryption failed")]
    Encrypt,
    #[error("stored entry `{0}` failed to decrypt")]
    Decrypt(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown channel {0}")]
    UnknownChannel(u8),
    #[error("packet ended early")]
    Truncated,
    #[error("payload failed to decode: {0}")]
    Decode(#[from] bincode::Error),
    #[error("fall channel used with a non-unreliable delivery method")]
    FallNotUnreliable,
    #[error("fall channel redirected into itself")]
    NestedFall,
    #[error("{0} only accepts reliable delivery")]
    ReliableOnly(Channel),
    #[error("peer is not authenticated")]
    NotAuthenticated,
    #[error("{0} requires an admin session")]
    NotAdmin(Channel),
    #[error("{0} is server-to-client only")]
    ClientBound(Channel),
    #[error("{0} is reserved")]
    Reserved(Channel),
    #[error("unexpected message on {0}")]
    Unexpected(Channel),
    #[error("store name `{0}` is reserved")]
    ReservedStoreName(String),
    #[error("store payload of {0} bytes exceeds the cap")]
    PayloadTooLarge(usize),
    #[error("network id space exhausted")]
    NetIdsExhausted,
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthFailure),
    #[error("send failed: {0}")]
    Transport(#[from] TransportError),
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Failures that stop the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
