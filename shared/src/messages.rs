//! Channel payloads.
//!
//! Each channel carries one message family encoded with `bincode`. Avatar
//! movement and voice frames are produced by client-side codecs and are
//! carried as opaque bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub type PlayerId = u32;

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(message)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Payload of the transport's connect frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub protocol_version: u16,
    /// Claimed identity. For DID authentication this is the DID itself.
    pub identity: String,
    pub auth: AuthPayload,
    pub ready: ReadyMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthPayload {
    Password(String),
    Did,
}

/// State a joining peer brings with it so others can spawn it immediately.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadyMessage {
    pub avatar: AvatarChangeMessage,
    pub meta: MetaDataMessage,
    pub movement: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthIdentityMessage {
    Challenge { nonce: Vec<u8> },
    Response { signature: Vec<u8>, key_fragment: String },
    Accepted { player_id: PlayerId },
}

// ---------------------------------------------------------------------------
// Player state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AvatarChangeMessage {
    pub loading_mode: u8,
    pub avatar_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetaDataMessage {
    pub display_name: String,
    /// Overwritten by the server with the verified identity before relaying.
    pub player_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoiceReceiversMessage {
    pub recipients: Vec<PlayerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAvatarMovement {
    pub player_id: PlayerId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVoiceData {
    pub player_id: PlayerId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAvatarChange {
    pub player_id: PlayerId,
    pub change: AvatarChangeMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetaData {
    pub player_id: PlayerId,
    pub meta: MetaDataMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePlayer {
    pub player_id: PlayerId,
    pub avatar: AvatarChangeMessage,
    pub meta: MetaDataMessage,
    pub movement: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemotePlayers {
    pub players: Vec<RemotePlayer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectionMessage {
    pub player_id: PlayerId,
}

// ---------------------------------------------------------------------------
// Scene and avatar data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneDataMessage {
    pub message_index: u16,
    pub payload: Vec<u8>,
    /// `None` relays to every other peer.
    pub recipients: Option<Vec<PlayerId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSceneDataMessage {
    pub sender: PlayerId,
    pub message_index: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarDataMessage {
    pub avatar_link_index: u8,
    pub message_index: u8,
    pub payload: Vec<u8>,
    pub recipients: Option<Vec<PlayerId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAvatarDataMessage {
    pub sender: PlayerId,
    pub avatar_link_index: u8,
    pub message_index: u8,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Ownership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRequest {
    pub key: String,
    /// When set, a transfer only succeeds if the record is still at this version.
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipState {
    pub key: String,
    pub owner: Option<PlayerId>,
    pub version: u64,
}

// ---------------------------------------------------------------------------
// Network ids
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetIdRequest {
    pub unique_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetIdAssignment {
    pub unique_id: String,
    pub net_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetIdAssignments {
    pub assignments: Vec<NetIdAssignment>,
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResourceMessage {
    pub load_mode: u8,
    pub unique_id: String,
    pub url: String,
    pub unlock_password: String,
    pub persistent: bool,
    /// Placement and other mode-specific parameters, opaque to the server.
    pub parameters: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadResourceMessage {
    pub load_mode: u8,
    pub unique_id: String,
}

// ---------------------------------------------------------------------------
// Administration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminRequest {
    Ban { identity: String, reason: String },
    Unban { identity: String },
    Kick { identity: String },
    AddAdmin { identity: String },
    RemoveAdmin { identity: String },
    ListBans,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub identity: String,
    pub reason: String,
    pub banned_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminResponse {
    Done,
    NotFound,
    Failed,
    Bans(Vec<BanEntry>),
}

// ---------------------------------------------------------------------------
// Persistent store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDatabaseMessage {
    pub name: String,
    /// JSON document.
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStoreDatabaseMessage {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseResponse {
    pub name: String,
    pub payload: Option<String>,
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatisticsRequest {
    Toggle { enabled: bool },
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCounter {
    pub channel: u8,
    pub bytes: u64,
    pub messages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub enabled: bool,
    pub inbound: Vec<ChannelCounter>,
    pub outbound: Vec<ChannelCounter>,
}
