//! Per-packet routing.
//!
//! Every inbound payload arrives as a [`PacketReader`] that owns its pooled
//! buffer. The reader moves into exactly one handler, which decodes it and
//! lets it go; an early return on any error path drops it the same way, so a
//! buffer goes back to the pool once and only once.

use crate::auth::Response;
use crate::buffer::PacketReader;
use crate::context::ServerContext;
use crate::error::{DispatchError, StoreError};
use crate::ownership::{RemoveOutcome, TransferOutcome};
use crate::session::RESERVED_PREFIX;
use crate::transport::PeerId;
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use shared::messages::{
    AdminRequest, AdminResponse, AuthIdentityMessage, AvatarChangeMessage, AvatarDataMessage,
    DatabaseResponse, LoadResourceMessage, MetaDataMessage, NetIdAssignment, NetIdRequest,
    OwnershipRequest, RequestStoreDatabaseMessage, SceneDataMessage, ServerAvatarChange,
    ServerAvatarDataMessage, ServerAvatarMovement, ServerMetaData, ServerSceneDataMessage,
    ServerVoiceData, StatisticsRequest, StoreDatabaseMessage, UnloadResourceMessage,
    VoiceReceiversMessage,
};
use shared::{Channel, DeliveryMethod};

/// Decodes the reader's unread bytes and releases it.
fn take<T: DeserializeOwned>(reader: PacketReader) -> Result<T, DispatchError> {
    let message = reader.decode()?;
    reader.recycle();
    Ok(message)
}

/// Copies out the unread bytes of an opaque payload and releases the reader.
fn take_raw(reader: PacketReader) -> Result<Vec<u8>, DispatchError> {
    if reader.is_empty() {
        return Err(DispatchError::Truncated);
    }
    let bytes = reader.remaining().to_vec();
    reader.recycle();
    Ok(bytes)
}

/// Unwraps one level of fall-channel tunnelling.
///
/// Only unreliable traffic may use the fall channel, and it may only be
/// redirected into channels that tolerate loss.
pub fn resolve_fall(
    channel: u8,
    delivery: DeliveryMethod,
    mut reader: PacketReader,
) -> Result<(Channel, DeliveryMethod, PacketReader), DispatchError> {
    let channel = Channel::from_id(channel).ok_or(DispatchError::UnknownChannel(channel))?;
    if channel != Channel::Fall {
        return Ok((channel, delivery, reader));
    }
    if delivery != DeliveryMethod::Unreliable {
        return Err(DispatchError::FallNotUnreliable);
    }

    let inner = reader.read_u8().ok_or(DispatchError::Truncated)?;
    let inner = Channel::from_id(inner).ok_or(DispatchError::UnknownChannel(inner))?;
    if inner == Channel::Fall {
        return Err(DispatchError::NestedFall);
    }
    if !inner.accepts_unreliable() {
        return Err(DispatchError::ReliableOnly(inner));
    }
    Ok((inner, delivery, reader))
}

impl ServerContext {
    /// Routes one inbound packet. Never fails: problems are logged with the
    /// peer's context and the packet is dropped.
    pub async fn dispatch(
        &self,
        peer: PeerId,
        reader: PacketReader,
        channel: u8,
        delivery: DeliveryMethod,
    ) {
        if let Err(e) = self.route(peer, reader, channel, delivery).await {
            let addr = self.transport.peer_addr(peer);
            match e {
                DispatchError::Store(_) => error!(
                    "Peer {} ({:?}) channel {} [{:?}]: {}",
                    peer, addr, channel, delivery, e
                ),
                _ => warn!(
                    "Dropped packet from peer {} ({:?}) on channel {} [{:?}]: {}",
                    peer, addr, channel, delivery, e
                ),
            }
        }
    }

    async fn route(
        &self,
        peer: PeerId,
        reader: PacketReader,
        channel: u8,
        delivery: DeliveryMethod,
    ) -> Result<(), DispatchError> {
        let (channel, delivery, reader) = resolve_fall(channel, delivery, reader)?;
        self.stats.record_inbound(channel.id(), reader.remaining().len());

        if channel == Channel::AuthIdentity {
            let outcome = self.handle_auth(peer, reader).await;
            if outcome.is_err() && !self.session.is_authenticated(peer) {
                self.kick(peer);
            }
            return outcome;
        }

        if !self.session.is_authenticated(peer) {
            return Err(DispatchError::NotAuthenticated);
        }
        if channel.is_client_bound() {
            return Err(DispatchError::ClientBound(channel));
        }
        if channel.is_admin_gated() && !self.session.is_net_peer_admin(peer) {
            return Err(DispatchError::NotAdmin(channel));
        }

        match channel {
            Channel::PlayerAvatar => self.handle_movement(peer, reader, delivery),
            Channel::Voice => self.handle_voice(peer, reader, delivery),
            Channel::Scene => self.handle_scene(peer, reader, delivery),
            Channel::Avatar => self.handle_avatar_data(peer, reader, delivery),
            Channel::AvatarChangeMessage => self.handle_avatar_change(peer, reader),
            Channel::MetaData => self.handle_metadata(peer, reader),
            Channel::AudioRecipients => {
                let recipients: VoiceReceiversMessage = take(reader)?;
                self.caches.add_last_voice_recipients(peer, recipients);
                Ok(())
            }
            Channel::GetCurrentOwnerRequest => self.handle_owner_query(peer, reader),
            Channel::ChangeCurrentOwnerRequest => self.handle_owner_transfer(peer, reader),
            Channel::RemoveCurrentOwnerRequest => self.handle_owner_remove(peer, reader),
            Channel::NetIdAssign => self.handle_net_id(reader),
            Channel::LoadResource => self.handle_load_resource(reader),
            Channel::UnloadResource => self.handle_unload_resource(reader),
            Channel::Admin => self.handle_admin(peer, reader),
            Channel::ServerBound => {
                match self.server_bound_hook() {
                    Some(hook) => hook(peer, reader.remaining()),
                    None => debug!("No server-bound handler; dropping message from {}", peer),
                }
                reader.recycle();
                Ok(())
            }
            Channel::StoreDatabase => self.handle_store(reader),
            Channel::RequestStoreDatabase => self.handle_store_request(peer, reader),
            Channel::ServerStatistics => self.handle_statistics(peer, reader),
            Channel::AvatarCloneRequest => Err(DispatchError::Reserved(channel)),
            Channel::Fall => Err(DispatchError::NestedFall),
            Channel::AuthIdentity
            | Channel::CreateRemotePlayer
            | Channel::CreateRemotePlayersForNewPeer
            | Channel::Disconnection
            | Channel::NetIdAssigns
            | Channel::AvatarCloneResponse => Err(DispatchError::Unexpected(channel)),
        }
    }

    async fn handle_auth(&self, peer: PeerId, reader: PacketReader) -> Result<(), DispatchError> {
        let message: AuthIdentityMessage = take(reader)?;
        let AuthIdentityMessage::Response {
            signature,
            key_fragment,
        } = message
        else {
            return Err(DispatchError::Unexpected(Channel::AuthIdentity));
        };
        if self.session.is_authenticated(peer) {
            return Err(DispatchError::Unexpected(Channel::AuthIdentity));
        }

        self.complete_authentication(
            peer,
            Response {
                signature,
                key_fragment,
            },
        )
        .await
    }

    fn handle_movement(
        &self,
        peer: PeerId,
        reader: PacketReader,
        delivery: DeliveryMethod,
    ) -> Result<(), DispatchError> {
        let data = take_raw(reader)?;
        self.caches.add_last_movement(peer, data.clone());
        if !self.reduction.should_forward(peer) {
            return Ok(());
        }

        self.relay.broadcast_message(
            Channel::PlayerAvatar,
            Some(peer),
            &self.session.authenticated_peers(),
            delivery,
            &ServerAvatarMovement {
                player_id: peer,
                data,
            },
        )?;
        Ok(())
    }

    fn handle_voice(
        &self,
        peer: PeerId,
        reader: PacketReader,
        delivery: DeliveryMethod,
    ) -> Result<(), DispatchError> {
        let data = take_raw(reader)?;
        let Some(recipients) = self.caches.get_last_voice_recipients(peer) else {
            return Ok(());
        };
        let targets = self.connected(recipients.recipients);

        self.relay.broadcast_message(
            Channel::Voice,
            Some(peer),
            &targets,
            delivery,
            &ServerVoiceData {
                player_id: peer,
                data,
            },
        )?;
        Ok(())
    }

    fn handle_scene(
        &self,
        peer: PeerId,
        reader: PacketReader,
        delivery: DeliveryMethod,
    ) -> Result<(), DispatchError> {
        let message: SceneDataMessage = take(reader)?;
        let targets = self.targets(message.recipients);

        self.relay.broadcast_message(
            Channel::Scene,
            Some(peer),
            &targets,
            delivery,
            &ServerSceneDataMessage {
                sender: peer,
                message_index: message.message_index,
                payload: message.payload,
            },
        )?;
        Ok(())
    }

    fn handle_avatar_data(
        &self,
        peer: PeerId,
        reader: PacketReader,
        delivery: DeliveryMethod,
    ) -> Result<(), DispatchError> {
        let message: AvatarDataMessage = take(reader)?;
        let targets = self.targets(message.recipients);

        self.relay.broadcast_message(
            Channel::Avatar,
            Some(peer),
            &targets,
            delivery,
            &ServerAvatarDataMessage {
                sender: peer,
                avatar_link_index: message.avatar_link_index,
                message_index: message.message_index,
                payload: message.payload,
            },
        )?;
        Ok(())
    }

    fn handle_avatar_change(
        &self,
        peer: PeerId,
        reader: PacketReader,
    ) -> Result<(), DispatchError> {
        let change: AvatarChangeMessage = take(reader)?;
        self.caches.add_last_avatar(peer, change.clone());

        self.relay.broadcast_message(
            Channel::AvatarChangeMessage,
            Some(peer),
            &self.session.authenticated_peers(),
            DeliveryMethod::ReliableOrdered,
            &ServerAvatarChange {
                player_id: peer,
                change,
            },
        )?;
        Ok(())
    }

    fn handle_metadata(&self, peer: PeerId, reader: PacketReader) -> Result<(), DispatchError> {
        let mut meta: MetaDataMessage = take(reader)?;
        // The identity field always carries the verified identity.
        meta.player_uuid = self.session.net_id_to_uuid(peer).unwrap_or_default();
        self.caches.add_last_metadata(peer, meta.clone());

        self.relay.broadcast_message(
            Channel::MetaData,
            Some(peer),
            &self.session.authenticated_peers(),
            DeliveryMethod::ReliableOrdered,
            &ServerMetaData {
                player_id: peer,
                meta,
            },
        )?;
        Ok(())
    }

    fn handle_owner_query(&self, peer: PeerId, reader: PacketReader) -> Result<(), DispatchError> {
        let request: OwnershipRequest = take(reader)?;
        self.relay.send_message(
            peer,
            Channel::GetCurrentOwnerRequest,
            DeliveryMethod::ReliableOrdered,
            &self.ownership.current(&request.key),
        )?;
        Ok(())
    }

    fn handle_owner_transfer(
        &self,
        peer: PeerId,
        reader: PacketReader,
    ) -> Result<(), DispatchError> {
        let request: OwnershipRequest = take(reader)?;
        match self
            .ownership
            .transfer(&request.key, peer, request.expected_version)
        {
            TransferOutcome::Granted(state) => {
                // The peer was removed on another worker while the claim was
                // in flight; its release sweep may already have run.
                if !self.session.is_authenticated(peer) {
                    self.revoke(peer, &state.key)?;
                    return Err(DispatchError::NotAuthenticated);
                }
                debug!("Peer {} now owns {} (v{})", peer, state.key, state.version);
                self.relay.broadcast_message(
                    Channel::ChangeCurrentOwnerRequest,
                    None,
                    &self.session.authenticated_peers(),
                    DeliveryMethod::ReliableOrdered,
                    &state,
                )?;
            }
            TransferOutcome::Unchanged(state) | TransferOutcome::Conflict(state) => {
                self.relay.send_message(
                    peer,
                    Channel::ChangeCurrentOwnerRequest,
                    DeliveryMethod::ReliableOrdered,
                    &state,
                )?;
            }
        }
        Ok(())
    }

    fn revoke(&self, peer: PeerId, key: &str) -> Result<(), DispatchError> {
        if let RemoveOutcome::Released(state) = self.ownership.remove(key, peer, false) {
            debug!("Revoked {} from departed peer {}", key, peer);
            self.relay.broadcast_message(
                Channel::RemoveCurrentOwnerRequest,
                None,
                &self.session.authenticated_peers(),
                DeliveryMethod::ReliableOrdered,
                &state,
            )?;
        }
        Ok(())
    }

    fn handle_owner_remove(
        &self,
        peer: PeerId,
        reader: PacketReader,
    ) -> Result<(), DispatchError> {
        let request: OwnershipRequest = take(reader)?;
        let is_admin = self.session.is_net_peer_admin(peer);
        match self.ownership.remove(&request.key, peer, is_admin) {
            RemoveOutcome::Released(state) => {
                self.relay.broadcast_message(
                    Channel::RemoveCurrentOwnerRequest,
                    None,
                    &self.session.authenticated_peers(),
                    DeliveryMethod::ReliableOrdered,
                    &state,
                )?;
            }
            RemoveOutcome::Rejected(state) => {
                debug!(
                    "Peer {} may not release {} (owner {:?})",
                    peer, state.key, state.owner
                );
            }
        }
        Ok(())
    }

    fn handle_net_id(&self, reader: PacketReader) -> Result<(), DispatchError> {
        let request: NetIdRequest = take(reader)?;
        let net_id = self
            .net_ids
            .assign(&request.unique_id)
            .ok_or(DispatchError::NetIdsExhausted)?;

        self.relay.broadcast_message(
            Channel::NetIdAssign,
            None,
            &self.session.authenticated_peers(),
            DeliveryMethod::ReliableOrdered,
            &NetIdAssignment {
                unique_id: request.unique_id,
                net_id,
            },
        )?;
        Ok(())
    }

    fn handle_load_resource(&self, reader: PacketReader) -> Result<(), DispatchError> {
        let message: LoadResourceMessage = take(reader)?;
        self.resources.load(message.clone());
        self.relay.broadcast_message(
            Channel::LoadResource,
            None,
            &self.session.authenticated_peers(),
            DeliveryMethod::ReliableOrdered,
            &message,
        )?;
        Ok(())
    }

    fn handle_unload_resource(&self, reader: PacketReader) -> Result<(), DispatchError> {
        let message: UnloadResourceMessage = take(reader)?;
        if !self.resources.unload(&message.unique_id) {
            debug!("Unload of unknown resource {}", message.unique_id);
        }
        self.relay.broadcast_message(
            Channel::UnloadResource,
            None,
            &self.session.authenticated_peers(),
            DeliveryMethod::ReliableOrdered,
            &message,
        )?;
        Ok(())
    }

    fn handle_admin(&self, peer: PeerId, reader: PacketReader) -> Result<(), DispatchError> {
        let request: AdminRequest = take(reader)?;
        let response = match self.apply_admin(&request) {
            Ok(response) => response,
            Err(e) => {
                error!("Admin request {:?} from peer {} failed: {}", request, peer, e);
                AdminResponse::Failed
            }
        };

        if self.transport.is_connected(peer) {
            self.relay
                .send_message(peer, Channel::Admin, DeliveryMethod::ReliableOrdered, &response)?;
        }
        Ok(())
    }

    /// Persists the change before returning, so the response never
    /// acknowledges something a restart would lose.
    fn apply_admin(&self, request: &AdminRequest) -> Result<AdminResponse, StoreError> {
        let response = match request {
            AdminRequest::Ban { identity, reason } => {
                self.session.ban(identity, reason)?;
                if let Some(target) = self.session.uuid_to_net_id(identity) {
                    self.kick(target);
                }
                AdminResponse::Done
            }
            AdminRequest::Unban { identity } => {
                if self.session.unban(identity)? {
                    AdminResponse::Done
                } else {
                    AdminResponse::NotFound
                }
            }
            AdminRequest::Kick { identity } => match self.session.uuid_to_net_id(identity) {
                Some(target) => {
                    self.kick(target);
                    AdminResponse::Done
                }
                None => AdminResponse::NotFound,
            },
            AdminRequest::AddAdmin { identity } => {
                self.session.add_admin(identity)?;
                AdminResponse::Done
            }
            AdminRequest::RemoveAdmin { identity } => {
                if self.session.remove_admin(identity)? {
                    AdminResponse::Done
                } else {
                    AdminResponse::NotFound
                }
            }
            AdminRequest::ListBans => AdminResponse::Bans(self.session.bans()),
        };
        Ok(response)
    }

    fn handle_store(&self, reader: PacketReader) -> Result<(), DispatchError> {
        let message: StoreDatabaseMessage = take(reader)?;
        if message.name.starts_with(RESERVED_PREFIX) {
            return Err(DispatchError::ReservedStoreName(message.name));
        }
        if message.payload.len() > self.config.max_store_payload {
            return Err(DispatchError::PayloadTooLarge(message.payload.len()));
        }
        self.store.add_or_update(&message.name, &message.payload)?;
        Ok(())
    }

    fn handle_store_request(
        &self,
        peer: PeerId,
        reader: PacketReader,
    ) -> Result<(), DispatchError> {
        let request: RequestStoreDatabaseMessage = take(reader)?;
        if request.name.starts_with(RESERVED_PREFIX) {
            return Err(DispatchError::ReservedStoreName(request.name));
        }

        let payload = self.store.get_by_name(&request.name);
        self.relay.send_message(
            peer,
            Channel::RequestStoreDatabase,
            DeliveryMethod::ReliableOrdered,
            &DatabaseResponse {
                name: request.name,
                payload,
            },
        )?;
        Ok(())
    }

    fn handle_statistics(&self, peer: PeerId, reader: PacketReader) -> Result<(), DispatchError> {
        let request: StatisticsRequest = take(reader)?;
        if let StatisticsRequest::Toggle { enabled } = request {
            self.stats.set_enabled(enabled);
        }
        self.relay.send_message(
            peer,
            Channel::ServerStatistics,
            DeliveryMethod::ReliableOrdered,
            &self.stats.snapshot(),
        )?;
        Ok(())
    }

    /// Explicit recipients filtered to authenticated peers, or everyone.
    fn targets(&self, recipients: Option<Vec<PeerId>>) -> Vec<PeerId> {
        match recipients {
            Some(recipients) => self.connected(recipients),
            None => self.session.authenticated_peers(),
        }
    }

    fn connected(&self, mut peers: Vec<PeerId>) -> Vec<PeerId> {
        peers.retain(|peer| self.session.is_authenticated(*peer));
        peers.sort_unstable();
        peers.dedup();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::config::{AuthMode, Configuration};
    use crate::transport::{MemoryTransport, SentMessage, Transport};
    use ed25519_dalek::{Signer, SigningKey};
    use parking_lot::Mutex;
    use rand::rngs::OsRng;
    use serde::Serialize;
    use shared::did::encode_pubkey_as_did;
    use shared::messages::{
        self, AuthPayload, ConnectionRequest, DisconnectionMessage, OwnershipState, ReadyMessage,
        RemotePlayer, RemotePlayers,
    };
    use shared::PROTOCOL_VERSION;
    use std::net::SocketAddr;
    use std::sync::Arc;

    struct Harness {
        transport: Arc<MemoryTransport>,
        context: ServerContext,
        pool: BufferPool,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(Configuration {
                auth_mode: AuthMode::Password,
                password: "pw".to_string(),
                admins: vec!["admin".to_string()],
                ..Configuration::default()
            })
        }

        fn with_config(config: Configuration) -> Self {
            let transport = Arc::new(MemoryTransport::new());
            let pool = BufferPool::new();
            let context = ServerContext::new(config, transport.clone(), pool.clone()).unwrap();
            Self {
                transport,
                context,
                pool,
            }
        }

        fn join(&self, port: u16, identity: &str) -> PeerId {
            let request = ConnectionRequest {
                protocol_version: PROTOCOL_VERSION,
                identity: identity.to_string(),
                auth: AuthPayload::Password("pw".to_string()),
                ready: ReadyMessage::default(),
            };
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            self.context
                .handle_connect(addr, &messages::encode(&request).unwrap());
            self.transport.accept(addr).unwrap()
        }

        /// Opens a DID connection and returns the peer with its nonce.
        fn connect_did(&self, port: u16, key: &SigningKey) -> (PeerId, Vec<u8>) {
            let request = ConnectionRequest {
                protocol_version: PROTOCOL_VERSION,
                identity: encode_pubkey_as_did(&key.verifying_key().to_bytes()),
                auth: AuthPayload::Did,
                ready: ReadyMessage::default(),
            };
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            self.context
                .handle_connect(addr, &messages::encode(&request).unwrap());
            let peer = self.transport.accept(addr).unwrap();

            let challenge = self.received(peer, Channel::AuthIdentity);
            let AuthIdentityMessage::Challenge { nonce } =
                messages::decode::<AuthIdentityMessage>(&challenge[0].payload).unwrap()
            else {
                panic!("expected a challenge");
            };
            (peer, nonce)
        }

        fn reader(&self, bytes: &[u8]) -> PacketReader {
            PacketReader::new(self.pool.copy_from(bytes))
        }

        async fn send<T: Serialize>(&self, peer: PeerId, channel: Channel, message: &T) {
            let bytes = messages::encode(message).unwrap();
            self.context
                .dispatch(peer, self.reader(&bytes), channel.id(), DeliveryMethod::ReliableOrdered)
                .await;
        }

        fn received(&self, peer: PeerId, channel: Channel) -> Vec<SentMessage> {
            self.transport
                .sent_to(peer)
                .into_iter()
                .filter(|message| message.channel == channel.id())
                .collect()
        }
    }

    #[test]
    fn test_resolve_fall_redirects_unreliable() {
        let pool = BufferPool::new();
        let reader = PacketReader::new(pool.copy_from(&[5, 0xAA, 0xBB]));

        let (channel, delivery, reader) =
            resolve_fall(0, DeliveryMethod::Unreliable, reader).unwrap();
        assert_eq!(channel, Channel::Avatar);
        assert_eq!(delivery, DeliveryMethod::Unreliable);
        assert_eq!(reader.remaining(), &[0xAA, 0xBB]);
    }

    #[test]
    fn test_resolve_fall_refusals() {
        let pool = BufferPool::new();
        let reader = |bytes: &[u8]| PacketReader::new(pool.copy_from(bytes));

        assert!(matches!(
            resolve_fall(0, DeliveryMethod::Unreliable, reader(&[])),
            Err(DispatchError::Truncated)
        ));
        assert!(matches!(
            resolve_fall(0, DeliveryMethod::ReliableOrdered, reader(&[2, 1])),
            Err(DispatchError::FallNotUnreliable)
        ));
        assert!(matches!(
            resolve_fall(0, DeliveryMethod::Unreliable, reader(&[0, 2, 1])),
            Err(DispatchError::NestedFall)
        ));
        assert!(matches!(
            resolve_fall(0, DeliveryMethod::Unreliable, reader(&[18, 1])),
            Err(DispatchError::ReliableOnly(Channel::Admin))
        ));
        assert!(matches!(
            resolve_fall(99, DeliveryMethod::Unreliable, reader(&[1])),
            Err(DispatchError::UnknownChannel(99))
        ));
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_join_brings_everyone_up_to_date() {
        let harness = Harness::new();
        let alice = harness.join(7001, "alice");
        let bob = harness.join(7002, "bob");

        let accepted = harness.received(bob, Channel::AuthIdentity);
        assert_eq!(
            messages::decode::<AuthIdentityMessage>(&accepted[0].payload).unwrap(),
            AuthIdentityMessage::Accepted { player_id: bob }
        );

        let existing = harness.received(bob, Channel::CreateRemotePlayersForNewPeer);
        let existing: RemotePlayers = messages::decode(&existing[0].payload).unwrap();
        assert_eq!(existing.players.len(), 1);
        assert_eq!(existing.players[0].player_id, alice);
        assert_eq!(existing.players[0].meta.player_uuid, "alice");

        let created = harness.received(alice, Channel::CreateRemotePlayer);
        let created: RemotePlayer = messages::decode(&created[0].payload).unwrap();
        assert_eq!(created.player_id, bob);
        assert!(harness.received(bob, Channel::CreateRemotePlayer).is_empty());
    }

    #[tokio::test]
    async fn test_bad_password_disconnects_without_admitting() {
        let harness = Harness::new();
        let request = ConnectionRequest {
            protocol_version: PROTOCOL_VERSION,
            identity: "eve".to_string(),
            auth: AuthPayload::Password("guess".to_string()),
            ready: ReadyMessage::default(),
        };
        let addr = SocketAddr::from(([127, 0, 0, 1], 7100));
        harness
            .context
            .handle_connect(addr, &messages::encode(&request).unwrap());

        assert_eq!(harness.transport.disconnected().len(), 1);
        assert!(harness.transport.sent().is_empty());
        assert_eq!(harness.context.session.uuid_to_net_id("eve"), None);

        harness.context.handle_connect(addr, &[0xFF]);
        assert_eq!(harness.transport.rejected(), vec![addr]);
    }

    #[tokio::test]
    async fn test_movement_relayed_to_others_only() {
        let harness = Harness::new();
        let alice = harness.join(7001, "alice");
        let bob = harness.join(7002, "bob");
        harness.transport.take_sent();

        harness
            .context
            .dispatch(
                alice,
                harness.reader(&[1, 2, 3, 4]),
                Channel::PlayerAvatar.id(),
                DeliveryMethod::Sequenced,
            )
            .await;

        let sent = harness.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].peer, bob);
        assert_eq!(sent[0].delivery, DeliveryMethod::Sequenced);
        let movement: ServerAvatarMovement = messages::decode(&sent[0].payload).unwrap();
        assert_eq!(movement.player_id, alice);
        assert_eq!(movement.data, vec![1, 2, 3, 4]);
        assert_eq!(harness.context.caches.get_last_movement(alice), Some(vec![1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn test_fall_channel_dispatches_as_inner_channel() {
        let harness = Harness::new();
        let alice = harness.join(7001, "alice");
        let bob = harness.join(7002, "bob");
        harness.transport.take_sent();

        let message = AvatarDataMessage {
            avatar_link_index: 1,
            message_index: 2,
            payload: vec![9, 9],
            recipients: None,
        };
        let mut tunneled = vec![Channel::Avatar.id()];
        tunneled.extend(messages::encode(&message).unwrap());
        harness
            .context
            .dispatch(alice, harness.reader(&tunneled), 0, DeliveryMethod::Unreliable)
            .await;

        let sent = harness.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].peer, bob);
        assert_eq!(sent[0].channel, Channel::Fall.id());
        assert_eq!(sent[0].payload[0], Channel::Avatar.id());
        let relayed: ServerAvatarDataMessage = messages::decode(&sent[0].payload[1..]).unwrap();
        assert_eq!(relayed.sender, alice);
        assert_eq!(relayed.payload, vec![9, 9]);
    }

    #[tokio::test]
    async fn test_voice_follows_recipient_list() {
        let harness = Harness::new();
        let alice = harness.join(7001, "alice");
        let bob = harness.join(7002, "bob");
        let carol = harness.join(7003, "carol");
        let recipients = VoiceReceiversMessage {
            recipients: vec![carol, 999],
        };
        harness.send(alice, Channel::AudioRecipients, &recipients).await;
        harness.transport.take_sent();

        harness
            .context
            .dispatch(
                alice,
                harness.reader(&[7; 10]),
                Channel::Voice.id(),
                DeliveryMethod::Sequenced,
            )
            .await;

        let sent = harness.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].peer, carol);
        assert!(harness.received(bob, Channel::Voice).is_empty());
    }

    #[tokio::test]
    async fn test_admin_gate_drops_silently() {
        let harness = Harness::new();
        let alice = harness.join(7001, "alice");
        harness.transport.take_sent();

        harness
            .send(alice, Channel::ServerStatistics, &StatisticsRequest::Toggle { enabled: true })
            .await;
        harness
            .send(
                alice,
                Channel::Admin,
                &AdminRequest::Ban {
                    identity: "bob".to_string(),
                    reason: "x".to_string(),
                },
            )
            .await;

        assert!(harness.transport.sent().is_empty());
        assert!(!harness.context.stats.is_enabled());
        assert!(!harness.context.session.is_banned("bob"));
    }

    #[tokio::test]
    async fn test_admin_ban_kicks_and_persists() {
        let harness = Harness::new();
        let admin = harness.join(7001, "admin");
        let bob = harness.join(7002, "bob");
        harness.transport.take_sent();

        harness
            .send(
                admin,
                Channel::Admin,
                &AdminRequest::Ban {
                    identity: "bob".to_string(),
                    reason: "spam".to_string(),
                },
            )
            .await;

        assert!(harness.context.session.is_banned("bob"));
        assert!(harness.transport.disconnected().contains(&bob));
        let response = harness.received(admin, Channel::Admin);
        assert_eq!(
            messages::decode::<AdminResponse>(&response[0].payload).unwrap(),
            AdminResponse::Done
        );
        let gone = harness.received(admin, Channel::Disconnection);
        assert_eq!(
            messages::decode::<DisconnectionMessage>(&gone[0].payload).unwrap(),
            DisconnectionMessage { player_id: bob }
        );
        assert!(harness.context.store.get_by_name("server.bans").is_some());
    }

    #[tokio::test]
    async fn test_ownership_flow_and_disconnect_release() {
        let harness = Harness::new();
        let alice = harness.join(7001, "alice");
        let bob = harness.join(7002, "bob");
        harness.transport.take_sent();

        let request = OwnershipRequest {
            key: "door".to_string(),
            expected_version: None,
        };
        harness.send(alice, Channel::ChangeCurrentOwnerRequest, &request).await;

        let granted = harness.received(bob, Channel::ChangeCurrentOwnerRequest);
        let state: OwnershipState = messages::decode(&granted[0].payload).unwrap();
        assert_eq!(state.owner, Some(alice));
        assert_eq!(harness.received(alice, Channel::ChangeCurrentOwnerRequest).len(), 1);

        // Not the owner: no release.
        harness.send(bob, Channel::RemoveCurrentOwnerRequest, &request).await;
        assert_eq!(harness.context.ownership.current("door").owner, Some(alice));

        harness.transport.disconnect(alice);
        harness.context.remove_peer(alice);
        harness.context.remove_peer(alice);

        assert_eq!(harness.context.ownership.current("door").owner, None);
        let released = harness.received(bob, Channel::RemoveCurrentOwnerRequest);
        assert_eq!(released.len(), 1);
        assert_eq!(harness.received(bob, Channel::Disconnection).len(), 1);
        assert_eq!(harness.context.session.net_id_to_uuid(alice), None);
        assert_eq!(harness.context.session.uuid_to_net_id("alice"), None);
        assert!(harness.context.caches.get_last_metadata(alice).is_none());
    }

    #[tokio::test]
    async fn test_store_rejects_reserved_names() {
        let harness = Harness::new();
        let alice = harness.join(7001, "alice");
        harness.transport.take_sent();

        harness
            .send(
                alice,
                Channel::StoreDatabase,
                &StoreDatabaseMessage {
                    name: "server.bans".to_string(),
                    payload: "[]".to_string(),
                },
            )
            .await;
        harness
            .send(
                alice,
                Channel::StoreDatabase,
                &StoreDatabaseMessage {
                    name: "world".to_string(),
                    payload: r#"{"doors":3}"#.to_string(),
                },
            )
            .await;
        let request = RequestStoreDatabaseMessage {
            name: "world".to_string(),
        };
        harness.send(alice, Channel::RequestStoreDatabase, &request).await;

        assert!(harness.context.store.get_by_name("server.bans").is_none());
        let reply = harness.received(alice, Channel::RequestStoreDatabase);
        let reply: DatabaseResponse = messages::decode(&reply[0].payload).unwrap();
        assert_eq!(reply.payload.as_deref(), Some(r#"{"doors":3}"#));
    }

    #[tokio::test]
    async fn test_unauthenticated_traffic_is_dropped() {
        let harness = Harness::new();
        let addr = SocketAddr::from(([127, 0, 0, 1], 7300));
        let stranger = harness.transport.accept(addr).unwrap();

        harness
            .context
            .dispatch(
                stranger,
                harness.reader(&[1, 2]),
                Channel::PlayerAvatar.id(),
                DeliveryMethod::Sequenced,
            )
            .await;
        assert!(harness.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_every_path_releases_its_buffer() {
        let harness = Harness::new();
        let alice = harness.join(7001, "alice");
        harness.join(7002, "bob");

        let cases: Vec<(Vec<u8>, u8, DeliveryMethod)> = vec![
            (vec![1, 2, 3], Channel::PlayerAvatar.id(), DeliveryMethod::Sequenced),
            (vec![0xFF], Channel::MetaData.id(), DeliveryMethod::ReliableOrdered),
            (vec![], 0, DeliveryMethod::Unreliable),
            (vec![3, 1], 0, DeliveryMethod::Unreliable),
            (vec![1], 77, DeliveryMethod::ReliableOrdered),
            (vec![1], Channel::Admin.id(), DeliveryMethod::ReliableOrdered),
            (vec![1], Channel::AvatarCloneRequest.id(), DeliveryMethod::ReliableOrdered),
            (vec![1], Channel::CreateRemotePlayer.id(), DeliveryMethod::ReliableOrdered),
            (vec![1], Channel::ServerBound.id(), DeliveryMethod::ReliableOrdered),
        ];
        for (bytes, channel, delivery) in cases {
            harness
                .context
                .dispatch(alice, harness.reader(&bytes), channel, delivery)
                .await;
        }
        assert_eq!(harness.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_did_login_and_replay() {
        let harness = Harness::with_config(Configuration::default());
        let key = SigningKey::generate(&mut OsRng);
        let did = encode_pubkey_as_did(&key.verifying_key().to_bytes());
        let request = ConnectionRequest {
            protocol_version: PROTOCOL_VERSION,
            identity: did.clone(),
            auth: AuthPayload::Did,
            ready: ReadyMessage::default(),
        };
        let addr = SocketAddr::from(([127, 0, 0, 1], 7400));
        harness
            .context
            .handle_connect(addr, &messages::encode(&request).unwrap());
        let peer = harness.transport.accept(addr).unwrap();

        let challenge = harness.transport.take_sent();
        let AuthIdentityMessage::Challenge { nonce } =
            messages::decode::<AuthIdentityMessage>(&challenge[0].payload).unwrap()
        else {
            panic!("expected a challenge");
        };
        let response = AuthIdentityMessage::Response {
            signature: key.sign(&nonce).to_bytes().to_vec(),
            key_fragment: String::new(),
        };

        harness.send(peer, Channel::AuthIdentity, &response).await;
        assert_eq!(harness.context.session.net_id_to_uuid(peer).as_deref(), Some(did.as_str()));

        // Replaying the same response is refused and leaves the session alone.
        harness.send(peer, Channel::AuthIdentity, &response).await;
        assert!(harness.context.session.is_authenticated(peer));
        assert!(harness.transport.disconnected().is_empty());
    }

    #[tokio::test]
    async fn test_bad_signature_disconnects() {
        let harness = Harness::with_config(Configuration::default());
        let key = SigningKey::generate(&mut OsRng);
        let did = encode_pubkey_as_did(&key.verifying_key().to_bytes());
        let request = ConnectionRequest {
            protocol_version: PROTOCOL_VERSION,
            identity: did,
            auth: AuthPayload::Did,
            ready: ReadyMessage::default(),
        };
        let addr = SocketAddr::from(([127, 0, 0, 1], 7401));
        harness
            .context
            .handle_connect(addr, &messages::encode(&request).unwrap());
        let peer = harness.transport.accept(addr).unwrap();

        let impostor = SigningKey::generate(&mut OsRng);
        let response = AuthIdentityMessage::Response {
            signature: impostor.sign(&[0u8; 32]).to_bytes().to_vec(),
            key_fragment: String::new(),
        };
        harness.send(peer, Channel::AuthIdentity, &response).await;

        assert!(!harness.context.session.is_authenticated(peer));
        assert_eq!(harness.transport.disconnected(), vec![peer]);
    }

    #[tokio::test]
    async fn test_ban_during_challenge_blocks_admission() {
        let harness = Harness::with_config(Configuration::default());
        let key = SigningKey::generate(&mut OsRng);
        let did = encode_pubkey_as_did(&key.verifying_key().to_bytes());
        let (peer, nonce) = harness.connect_did(7402, &key);

        harness.context.session.ban(&did, "griefing").unwrap();
        let response = AuthIdentityMessage::Response {
            signature: key.sign(&nonce).to_bytes().to_vec(),
            key_fragment: String::new(),
        };
        harness.send(peer, Channel::AuthIdentity, &response).await;

        assert!(!harness.context.session.is_authenticated(peer));
        assert_eq!(harness.context.session.uuid_to_net_id(&did), None);
        assert_eq!(harness.transport.disconnected(), vec![peer]);
        let accepted = harness
            .received(peer, Channel::AuthIdentity)
            .into_iter()
            .filter(|message| {
                matches!(
                    messages::decode::<AuthIdentityMessage>(&message.payload),
                    Ok(AuthIdentityMessage::Accepted { .. })
                )
            })
            .count();
        assert_eq!(accepted, 0);
    }

    #[tokio::test]
    async fn test_unanswered_challenge_expires() {
        let harness = Harness::with_config(Configuration {
            challenge_timeout_ms: 10,
            ..Configuration::default()
        });
        let key = SigningKey::generate(&mut OsRng);
        let (peer, _) = harness.connect_did(7403, &key);
        assert!(harness.context.session.has_pending_challenge(peer));

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        harness.context.expire_challenges();

        assert!(!harness.context.session.has_pending_challenge(peer));
        assert!(!harness.transport.is_connected(peer));
        assert_eq!(harness.transport.disconnected(), vec![peer]);
    }

    #[tokio::test]
    async fn test_server_bound_hook_sees_peer_and_payload() {
        let harness = Harness::new();
        let alice = harness.join(7001, "alice");
        let seen: Arc<Mutex<Vec<(PeerId, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        harness
            .context
            .set_server_bound_hook(Arc::new(move |peer, bytes| {
                sink.lock().push((peer, bytes.to_vec()));
            }));

        harness
            .context
            .dispatch(
                alice,
                harness.reader(&[4, 5, 6]),
                Channel::ServerBound.id(),
                DeliveryMethod::ReliableOrdered,
            )
            .await;

        assert_eq!(*seen.lock(), vec![(alice, vec![4, 5, 6])]);
        assert_eq!(harness.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_full_server_rejects_connect() {
        let harness = Harness::new();
        harness.transport.set_capacity(1);
        harness.join(7001, "alice");

        let request = ConnectionRequest {
            protocol_version: PROTOCOL_VERSION,
            identity: "bob".to_string(),
            auth: AuthPayload::Password("pw".to_string()),
            ready: ReadyMessage::default(),
        };
        let addr = SocketAddr::from(([127, 0, 0, 1], 7002));
        harness
            .context
            .handle_connect(addr, &messages::encode(&request).unwrap());

        assert_eq!(harness.transport.rejected(), vec![addr]);
        assert_eq!(harness.context.session.uuid_to_net_id("bob"), None);
    }

    #[tokio::test]
    async fn test_claim_racing_removal_is_revoked() {
        let harness = Harness::new();
        let alice = harness.join(7001, "alice");
        let bob = harness.join(7002, "bob");
        harness.transport.take_sent();

        // Alice's removal has started on another worker.
        harness.context.session.remove_connection(alice);
        let request = OwnershipRequest {
            key: "door".to_string(),
            expected_version: None,
        };
        let bytes = messages::encode(&request).unwrap();
        let outcome = harness
            .context
            .handle_owner_transfer(alice, harness.reader(&bytes));

        assert!(matches!(outcome, Err(DispatchError::NotAuthenticated)));
        assert_eq!(harness.context.ownership.current("door").owner, None);
        assert!(harness.received(bob, Channel::ChangeCurrentOwnerRequest).is_empty());
        let released = harness.received(bob, Channel::RemoveCurrentOwnerRequest);
        let state: OwnershipState = messages::decode(&released[0].payload).unwrap();
        assert_eq!(state.owner, None);
        assert_eq!(state.version, 2);
    }
}
