//! Last-known per-player state, replayed to peers that join later.

use crate::transport::PeerId;
use dashmap::DashMap;
use parking_lot::RwLock;
use shared::messages::{
    AvatarChangeMessage, LoadResourceMessage, MetaDataMessage, RemotePlayer, VoiceReceiversMessage,
};

/// One map per message kind, keyed by peer. A later write always replaces the
/// earlier one.
#[derive(Debug, Default)]
pub struct StateCaches {
    avatars: DashMap<PeerId, AvatarChangeMessage>,
    metadata: DashMap<PeerId, MetaDataMessage>,
    voice_recipients: DashMap<PeerId, VoiceReceiversMessage>,
    movement: DashMap<PeerId, Vec<u8>>,
}

impl StateCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_last_avatar(&self, peer: PeerId, message: AvatarChangeMessage) {
        self.avatars.insert(peer, message);
    }

    pub fn add_last_metadata(&self, peer: PeerId, message: MetaDataMessage) {
        self.metadata.insert(peer, message);
    }

    pub fn add_last_voice_recipients(&self, peer: PeerId, message: VoiceReceiversMessage) {
        self.voice_recipients.insert(peer, message);
    }

    pub fn add_last_movement(&self, peer: PeerId, data: Vec<u8>) {
        self.movement.insert(peer, data);
    }

    pub fn get_last_avatar(&self, peer: PeerId) -> Option<AvatarChangeMessage> {
        self.avatars.get(&peer).map(|entry| entry.clone())
    }

    pub fn get_last_metadata(&self, peer: PeerId) -> Option<MetaDataMessage> {
        self.metadata.get(&peer).map(|entry| entry.clone())
    }

    pub fn get_last_voice_recipients(&self, peer: PeerId) -> Option<VoiceReceiversMessage> {
        self.voice_recipients.get(&peer).map(|entry| entry.clone())
    }

    pub fn get_last_movement(&self, peer: PeerId) -> Option<Vec<u8>> {
        self.movement.get(&peer).map(|entry| entry.clone())
    }

    pub fn remove_player(&self, peer: PeerId) {
        self.avatars.remove(&peer);
        self.metadata.remove(&peer);
        self.voice_recipients.remove(&peer);
        self.movement.remove(&peer);
    }

    /// Everything a newcomer needs to spawn `peer`. Missing parts are empty.
    pub fn remote_player(&self, peer: PeerId) -> RemotePlayer {
        RemotePlayer {
            player_id: peer,
            avatar: self.get_last_avatar(peer).unwrap_or_default(),
            meta: self.get_last_metadata(peer).unwrap_or_default(),
            movement: self.get_last_movement(peer).unwrap_or_default(),
        }
    }
}

/// Resources currently loaded into the world, in load order.
#[derive(Debug, Default)]
pub struct ResourceCache {
    loaded: RwLock<Vec<LoadResourceMessage>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a load, replacing any earlier load with the same unique id.
    pub fn load(&self, message: LoadResourceMessage) {
        let mut loaded = self.loaded.write();
        loaded.retain(|existing| existing.unique_id != message.unique_id);
        loaded.push(message);
    }

    pub fn unload(&self, unique_id: &str) -> bool {
        let mut loaded = self.loaded.write();
        let before = loaded.len();
        loaded.retain(|existing| existing.unique_id != unique_id);
        loaded.len() != before
    }

    pub fn all(&self) -> Vec<LoadResourceMessage> {
        self.loaded.read().clone()
    }
}
