//! Channel table and delivery methods.
//!
//! Channel numbers are a contract with deployed clients and must never be
//! renumbered. The transport packs the delivery method next to the channel
//! number, which caps the table at [`MAX_CHANNELS`] entries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on channel numbers imposed by the transport's bit packing.
pub const MAX_CHANNELS: usize = 64;

/// Number of channels currently assigned.
pub const CHANNEL_COUNT: usize = 26;

/// Reliability and ordering class of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMethod {
    /// Acked, resent until delivered, handed over in send order.
    ReliableOrdered,
    /// Acked and resent, handed over in arrival order with duplicates removed.
    ReliableUnordered,
    /// Never resent; anything older than the newest delivered frame is dropped.
    Sequenced,
    /// Fire and forget.
    Unreliable,
}

impl DeliveryMethod {
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryMethod::ReliableOrdered | DeliveryMethod::ReliableUnordered
        )
    }

    /// Lossy methods are subject to queue-depth backpressure.
    pub fn is_lossy(self) -> bool {
        !self.is_reliable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Channel {
    Fall = 0,
    AuthIdentity = 1,
    PlayerAvatar = 2,
    Voice = 3,
    Scene = 4,
    Avatar = 5,
    CreateRemotePlayer = 6,
    CreateRemotePlayersForNewPeer = 7,
    AvatarChangeMessage = 8,
    GetCurrentOwnerRequest = 9,
    ChangeCurrentOwnerRequest = 10,
    RemoveCurrentOwnerRequest = 11,
    AudioRecipients = 12,
    Disconnection = 13,
    NetIdAssign = 14,
    NetIdAssigns = 15,
    LoadResource = 16,
    UnloadResource = 17,
    Admin = 18,
    AvatarCloneRequest = 19,
    AvatarCloneResponse = 20,
    ServerBound = 21,
    MetaData = 22,
    StoreDatabase = 23,
    RequestStoreDatabase = 24,
    ServerStatistics = 25,
}

impl Channel {
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::Fall,
        Channel::AuthIdentity,
        Channel::PlayerAvatar,
        Channel::Voice,
        Channel::Scene,
        Channel::Avatar,
        Channel::CreateRemotePlayer,
        Channel::CreateRemotePlayersForNewPeer,
        Channel::AvatarChangeMessage,
        Channel::GetCurrentOwnerRequest,
        Channel::ChangeCurrentOwnerRequest,
        Channel::RemoveCurrentOwnerRequest,
        Channel::AudioRecipients,
        Channel::Disconnection,
        Channel::NetIdAssign,
        Channel::NetIdAssigns,
        Channel::LoadResource,
        Channel::UnloadResource,
        Channel::Admin,
        Channel::AvatarCloneRequest,
        Channel::AvatarCloneResponse,
        Channel::ServerBound,
        Channel::MetaData,
        Channel::StoreDatabase,
        Channel::RequestStoreDatabase,
        Channel::ServerStatistics,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Channel> {
        Channel::ALL.get(id as usize).copied()
    }

    /// Delivery method the server uses when it originates traffic on this channel.
    pub fn default_delivery(self) -> DeliveryMethod {
        match self {
            Channel::PlayerAvatar | Channel::Voice => DeliveryMethod::Sequenced,
            Channel::Fall => DeliveryMethod::Unreliable,
            _ => DeliveryMethod::ReliableOrdered,
        }
    }

    /// Whether traffic for this channel may arrive tunneled through the fall
    /// channel. Channels whose state must not be lost only accept reliable
    /// delivery.
    pub fn accepts_unreliable(self) -> bool {
        matches!(
            self,
            Channel::PlayerAvatar
                | Channel::Voice
                | Channel::Scene
                | Channel::Avatar
                | Channel::ServerBound
        )
    }

    /// Channels only the server may originate.
    pub fn is_client_bound(self) -> bool {
        matches!(
            self,
            Channel::CreateRemotePlayer
                | Channel::CreateRemotePlayersForNewPeer
                | Channel::Disconnection
                | Channel::NetIdAssigns
                | Channel::AvatarCloneResponse
        )
    }

    /// Channels whose sender must hold an admin session.
    pub fn is_admin_gated(self) -> bool {
        matches!(
            self,
            Channel::LoadResource
                | Channel::UnloadResource
                | Channel::Admin
                | Channel::ServerStatistics
        )
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.id())
    }
}
