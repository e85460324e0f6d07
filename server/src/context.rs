//! Everything one server instance shares between its workers.
//!
//! A [`ServerContext`] is built once at startup and handed to every dispatch
//! worker behind an `Arc`. Several contexts can live in one process, which the
//! tests rely on.

use crate::auth::{AuthFailure, Authenticator, Response};
use crate::buffer::BufferPool;
use crate::cache::{ResourceCache, StateCaches};
use crate::config::Configuration;
use crate::error::{DispatchError, ServerError, TransportError};
use crate::net_ids::NetIdAllocator;
use crate::ownership::OwnershipManager;
use crate::relay::{ReductionSystem, RelayEngine};
use crate::session::{Admission, ConnectionRejection, SessionRegistry};
use crate::stats::Statistics;
use crate::store::Store;
use crate::transport::{PeerId, Transport};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use shared::messages::{
    self, AuthIdentityMessage, ConnectionRequest, DisconnectionMessage, NetIdAssignments,
    ReadyMessage, RemotePlayer, RemotePlayers,
};
use shared::{Channel, MAX_MESSAGE_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;

/// Receives every payload sent on [`Channel::ServerBound`].
pub type ServerBoundHook = Arc<dyn Fn(PeerId, &[u8]) + Send + Sync>;

/// Encoded size at which a catch-up list is split into another message.
const BATCH_BYTES: usize = MAX_MESSAGE_SIZE / 4;

/// Splits `items` into runs whose encoded size stays near `budget`. An item
/// larger than the budget travels alone.
fn batched<T: Serialize>(items: Vec<T>, budget: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut size = 0;
    for item in items {
        let item_size = bincode::serialized_size(&item).map_or(budget, |n| n as usize);
        if !current.is_empty() && size + item_size > budget {
            batches.push(std::mem::take(&mut current));
            size = 0;
        }
        size += item_size;
        current.push(item);
    }
    if !current.is_empty() || batches.is_empty() {
        batches.push(current);
    }
    batches
}

pub struct ServerContext {
    pub config: Configuration,
    pub transport: Arc<dyn Transport>,
    pub session: SessionRegistry,
    pub ownership: OwnershipManager,
    pub caches: StateCaches,
    pub resources: ResourceCache,
    pub net_ids: NetIdAllocator,
    pub relay: RelayEngine,
    pub reduction: ReductionSystem,
    pub stats: Arc<Statistics>,
    pub store: Arc<Store>,
    pub buffers: BufferPool,
    server_bound: RwLock<Option<ServerBoundHook>>,
}

impl ServerContext {
    pub fn new(
        config: Configuration,
        transport: Arc<dyn Transport>,
        buffers: BufferPool,
    ) -> Result<Self, ServerError> {
        let store = Arc::new(match &config.store_path {
            Some(path) => Store::open(path, &config.store_secret)?,
            None => Store::in_memory(),
        });
        let stats = Arc::new(Statistics::new(config.statistics_enabled));
        let session = SessionRegistry::new(
            Authenticator::from_config(&config),
            config.challenge_timeout(),
            Arc::clone(&store),
            &config.admins,
        )?;
        let relay = RelayEngine::new(
            Arc::clone(&transport),
            Arc::clone(&stats),
            config.max_queue_depth,
        );

        Ok(Self {
            reduction: ReductionSystem::from_config(&config.reduction),
            session,
            ownership: OwnershipManager::new(),
            caches: StateCaches::new(),
            resources: ResourceCache::new(),
            net_ids: NetIdAllocator::new(),
            relay,
            stats,
            store,
            buffers,
            transport,
            config,
            server_bound: RwLock::new(None),
        })
    }

    pub fn set_server_bound_hook(&self, hook: ServerBoundHook) {
        *self.server_bound.write() = Some(hook);
    }

    pub(crate) fn server_bound_hook(&self) -> Option<ServerBoundHook> {
        self.server_bound.read().clone()
    }

    /// Handles a connect frame: opens the transport connection, then admits,
    /// challenges or drops the peer.
    pub fn handle_connect(&self, addr: SocketAddr, payload: &[u8]) {
        let request: ConnectionRequest = match messages::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed connect request from {}: {}", addr, e);
                self.transport.reject(addr);
                return;
            }
        };

        let peer = match self.transport.accept(addr) {
            Ok(peer) => peer,
            Err(TransportError::ServerFull) => {
                info!(
                    "Rejected connection from {} claiming {:?}: {}",
                    addr,
                    request.identity,
                    ConnectionRejection::ServerFull
                );
                self.transport.reject(addr);
                return;
            }
            Err(e) => {
                warn!("Cannot accept {}: {}", addr, e);
                self.transport.reject(addr);
                return;
            }
        };

        // Retransmitted connect; reliable resends already cover the reply.
        if self.session.is_authenticated(peer) || self.session.has_pending_challenge(peer) {
            debug!("Ignoring repeated connect from peer {} ({})", peer, addr);
            return;
        }

        match self.session.process_connection(&request, peer) {
            Ok(Admission::Authenticated { identity, ready }) => {
                if let Err(e) = self.admit_peer(peer, identity, ready) {
                    warn!("Failed to bring peer {} up to date: {}", peer, e);
                }
            }
            Ok(Admission::Challenged { nonce }) => {
                let challenge = AuthIdentityMessage::Challenge {
                    nonce: nonce.to_vec(),
                };
                if let Err(e) = self.notify(peer, Channel::AuthIdentity, &challenge) {
                    warn!("Failed to challenge peer {}: {}", peer, e);
                    self.kick(peer);
                }
            }
            Err(rejection) => {
                info!(
                    "Rejected connection from {} claiming {:?}: {}",
                    addr, request.identity, rejection
                );
                self.kick(peer);
            }
        }
    }

    /// Verifies a challenge response and admits the peer on success.
    pub async fn complete_authentication(
        &self,
        peer: PeerId,
        response: Response,
    ) -> Result<(), DispatchError> {
        let (identity, ready) = self.session.complete_challenge(peer, response).await?;

        if !self.transport.is_connected(peer) {
            return Err(AuthFailure::PeerGone.into());
        }
        self.admit_peer(peer, identity, ready)
    }

    /// Registers an authenticated peer and brings both it and everyone else
    /// up to date. A failed catch-up send is logged and does not stop the
    /// others from learning about the newcomer.
    pub fn admit_peer(
        &self,
        peer: PeerId,
        identity: String,
        mut ready: ReadyMessage,
    ) -> Result<(), DispatchError> {
        ready.meta.player_uuid = identity.clone();
        self.caches.add_last_avatar(peer, ready.avatar);
        self.caches.add_last_metadata(peer, ready.meta);
        if !ready.movement.is_empty() {
            self.caches.add_last_movement(peer, ready.movement);
        }

        if let Some(previous) = self.session.register(peer, &identity) {
            info!(
                "Identity {} logged in again as peer {}, dropping peer {}",
                identity, peer, previous
            );
            self.kick(previous);
        }
        // A ban that landed while this peer was being verified.
        if self.session.is_banned(&identity) {
            info!("Peer {} was banned during authentication", peer);
            self.kick(peer);
            return Err(AuthFailure::Banned.into());
        }

        self.notify(
            peer,
            Channel::AuthIdentity,
            &AuthIdentityMessage::Accepted { player_id: peer },
        )?;

        let others = self.others(peer);
        self.catch_up(peer, &others);

        self.relay.broadcast_message(
            Channel::CreateRemotePlayer,
            Some(peer),
            &others,
            Channel::CreateRemotePlayer.default_delivery(),
            &self.caches.remote_player(peer),
        )?;

        info!(
            "Player {} joined as {} ({} others online)",
            peer,
            identity,
            others.len()
        );
        Ok(())
    }

    /// Sends a newcomer the room it joined: players, network ids and loaded
    /// resources.
    fn catch_up(&self, peer: PeerId, others: &[PeerId]) {
        let players: Vec<RemotePlayer> = others
            .iter()
            .map(|other| self.caches.remote_player(*other))
            .collect();
        for players in batched(players, BATCH_BYTES) {
            let batch = RemotePlayers { players };
            if let Err(e) = self.notify(peer, Channel::CreateRemotePlayersForNewPeer, &batch) {
                warn!(
                    "Failed to send {} players to peer {}: {}",
                    batch.players.len(),
                    peer,
                    e
                );
            }
        }

        for assignments in batched(self.net_ids.all().assignments, BATCH_BYTES) {
            let batch = NetIdAssignments { assignments };
            if let Err(e) = self.notify(peer, Channel::NetIdAssigns, &batch) {
                warn!("Failed to send network ids to peer {}: {}", peer, e);
            }
        }

        for resource in self.resources.all() {
            if let Err(e) = self.notify(peer, Channel::LoadResource, &resource) {
                warn!(
                    "Failed to send resource {} to peer {}: {}",
                    resource.unique_id, peer, e
                );
            }
        }
    }

    /// Sends a server-originated message with the channel's usual delivery.
    fn notify<T: Serialize>(
        &self,
        peer: PeerId,
        channel: Channel,
        message: &T,
    ) -> Result<(), TransportError> {
        let delivery = channel.default_delivery();
        self.relay.send_message(peer, channel, delivery, message)
    }

    /// Drops every trace of `peer` and tells the others. Safe to call more
    /// than once.
    pub fn remove_peer(&self, peer: PeerId) {
        let identity = self.session.remove_connection(peer);
        let released = self.ownership.release_all(peer);
        self.caches.remove_player(peer);
        self.reduction.remove_player(peer);

        let remaining = self.session.authenticated_peers();
        for state in released {
            if let Err(e) = self.relay.broadcast_message(
                Channel::RemoveCurrentOwnerRequest,
                None,
                &remaining,
                Channel::RemoveCurrentOwnerRequest.default_delivery(),
                &state,
            ) {
                warn!("Failed to announce release of {}: {}", state.key, e);
            }
        }

        if let Some(identity) = identity {
            if let Err(e) = self.relay.broadcast_message(
                Channel::Disconnection,
                None,
                &remaining,
                Channel::Disconnection.default_delivery(),
                &DisconnectionMessage { player_id: peer },
            ) {
                warn!("Failed to announce departure of peer {}: {}", peer, e);
            }
            info!("Player {} ({}) left", peer, identity);
        }
    }

    /// Closes the transport connection and cleans up after it.
    pub fn kick(&self, peer: PeerId) {
        self.transport.disconnect(peer);
        self.remove_peer(peer);
    }

    /// Disconnects peers that never answered their challenge.
    pub fn expire_challenges(&self) {
        for peer in self.session.expire_challenges() {
            info!("Peer {} did not answer its challenge in time", peer);
            self.kick(peer);
        }
    }

    /// Authenticated peers other than `peer`.
    pub fn others(&self, peer: PeerId) -> Vec<PeerId> {
        self.session
            .authenticated_peers()
            .into_iter()
            .filter(|other| *other != peer)
            .collect()
    }
}
