//! Session and identity registry.
//!
//! Maps transport peers to their verified identity, drives the connection
//! handshake through the configured [`Authenticator`], and owns the admin set
//! and ban list. Both lists are keyed by identity, survive reconnects, and are
//! written to the [`Store`] before a mutating call returns.

use crate::auth::{
    constant_time_eq, AuthFailure, Authenticator, PendingChallenge, PendingChallenges, Response,
};
use crate::config::AuthMode;
use crate::error::StoreError;
use crate::store::Store;
use crate::transport::PeerId;
use dashmap::{DashMap, DashSet};
use log::{debug, info};
use parking_lot::Mutex;
use shared::did::{self, DidError};
use shared::messages::{AuthPayload, BanEntry, ConnectionRequest, ReadyMessage};
use shared::{NONCE_LEN, PROTOCOL_VERSION};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Store names under this prefix belong to the server.
pub const RESERVED_PREFIX: &str = "server.";
pub const BANS_KEY: &str = "server.bans";
pub const ADMINS_KEY: &str = "server.admins";

const MAX_IDENTITY_LEN: usize = 256;

/// Why a connection was refused. Logged, never sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionRejection {
    #[error("connect payload did not decode")]
    Malformed,
    #[error("protocol version {got}, expected {expected}")]
    VersionMismatch { expected: u16, got: u16 },
    #[error("identity is banned")]
    Banned,
    #[error("wrong password")]
    BadPassword,
    #[error("identity is not a valid DID: {0}")]
    InvalidIdentity(DidError),
    #[error("proof kind does not match the server's auth mode")]
    WrongAuthKind,
    #[error("server is full")]
    ServerFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The proof in the connect request was sufficient.
    Authenticated { identity: String, ready: ReadyMessage },
    /// A challenge is pending; the peer must answer on the auth channel.
    Challenged { nonce: [u8; NONCE_LEN] },
}

pub struct SessionRegistry {
    authenticator: Authenticator,
    pending: PendingChallenges,
    identities: DashMap<PeerId, String>,
    peers: DashMap<String, PeerId>,
    admins: DashSet<String>,
    /// Per-peer cache of admin lookups, cleared whenever the admin set changes.
    admin_sessions: DashMap<PeerId, bool>,
    bans: DashMap<String, BanEntry>,
    store: Arc<Store>,
    /// Serialises list mutations with their flush so snapshots are never stale.
    persist: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(
        authenticator: Authenticator,
        challenge_timeout: Duration,
        store: Arc<Store>,
        initial_admins: &[String],
    ) -> Result<Self, StoreError> {
        let registry = Self {
            authenticator,
            pending: PendingChallenges::new(challenge_timeout),
            identities: DashMap::new(),
            peers: DashMap::new(),
            admins: DashSet::new(),
            admin_sessions: DashMap::new(),
            bans: DashMap::new(),
            store,
            persist: Mutex::new(()),
        };

        if let Some(saved) = registry.store.get_by_name(BANS_KEY) {
            let bans: Vec<BanEntry> = serde_json::from_str(&saved)?;
            for ban in bans {
                registry.bans.insert(ban.identity.clone(), ban);
            }
        }
        if let Some(saved) = registry.store.get_by_name(ADMINS_KEY) {
            let admins: Vec<String> = serde_json::from_str(&saved)?;
            for admin in admins {
                registry.admins.insert(admin);
            }
        }
        for admin in initial_admins {
            registry.admins.insert(admin.clone());
        }
        info!(
            "Session registry ready: {} admins, {} bans",
            registry.admins.len(),
            registry.bans.len()
        );

        Ok(registry)
    }

    pub fn mode(&self) -> AuthMode {
        self.authenticator.mode()
    }

    /// Checks a connect request and either admits the peer or issues a
    /// challenge. Banned identities are refused before any challenge exists.
    pub fn process_connection(
        &self,
        request: &ConnectionRequest,
        peer: PeerId,
    ) -> Result<Admission, ConnectionRejection> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(ConnectionRejection::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: request.protocol_version,
            });
        }
        if request.identity.is_empty() || request.identity.len() > MAX_IDENTITY_LEN {
            return Err(ConnectionRejection::Malformed);
        }
        if self.is_banned(&request.identity) {
            return Err(ConnectionRejection::Banned);
        }

        match (&self.authenticator, &request.auth) {
            (Authenticator::Password { password }, AuthPayload::Password(given)) => {
                if !constant_time_eq(password.as_bytes(), given.as_bytes()) {
                    return Err(ConnectionRejection::BadPassword);
                }
                Ok(Admission::Authenticated {
                    identity: request.identity.clone(),
                    ready: request.ready.clone(),
                })
            }
            (Authenticator::Did(engine), AuthPayload::Did) => {
                did::parse_did(&request.identity).map_err(ConnectionRejection::InvalidIdentity)?;
                let challenge = engine.make_challenge(&request.identity);
                let nonce = challenge.nonce;
                let pending = PendingChallenge::new(challenge, request.ready.clone());
                if self.pending.insert(peer, pending).is_some() {
                    debug!("Peer {} challenge superseded", peer);
                }
                Ok(Admission::Challenged { nonce })
            }
            _ => Err(ConnectionRejection::WrongAuthKind),
        }
    }

    /// Consumes the peer's pending challenge and verifies `response` against
    /// it. The challenge is gone afterwards whether or not verification passed.
    /// An identity banned after its challenge was issued is refused.
    pub async fn complete_challenge(
        &self,
        peer: PeerId,
        response: Response,
    ) -> Result<(String, ReadyMessage), AuthFailure> {
        let pending = self.pending.take(peer)?;
        let Authenticator::Did(engine) = &self.authenticator else {
            return Err(AuthFailure::NoPendingChallenge);
        };
        if response.signature.is_empty() {
            return Err(AuthFailure::Malformed);
        }
        engine.verify_response(&response, &pending.challenge).await?;
        if self.is_banned(&pending.challenge.identity) {
            return Err(AuthFailure::Banned);
        }
        Ok((pending.challenge.identity, pending.ready))
    }

    pub fn has_pending_challenge(&self, peer: PeerId) -> bool {
        self.pending.contains(peer)
    }

    /// Peers whose challenge ran out of time. Their slots are already freed.
    pub fn expire_challenges(&self) -> Vec<PeerId> {
        self.pending.expire(Instant::now())
    }

    /// Records `peer -> identity`. Returns an older peer holding the same
    /// identity, which the caller should disconnect.
    pub fn register(&self, peer: PeerId, identity: &str) -> Option<PeerId> {
        self.identities.insert(peer, identity.to_string());
        self.admin_sessions.remove(&peer);
        self.peers
            .insert(identity.to_string(), peer)
            .filter(|previous| *previous != peer)
    }

    /// Purges every per-peer entry. Returns the identity the peer held.
    pub fn remove_connection(&self, peer: PeerId) -> Option<String> {
        self.pending.discard(peer);
        self.admin_sessions.remove(&peer);
        let (_, identity) = self.identities.remove(&peer)?;
        self.peers.remove_if(&identity, |_, owner| *owner == peer);
        Some(identity)
    }

    pub fn net_id_to_uuid(&self, peer: PeerId) -> Option<String> {
        self.identities.get(&peer).map(|identity| identity.clone())
    }

    pub fn uuid_to_net_id(&self, identity: &str) -> Option<PeerId> {
        self.peers.get(identity).map(|peer| *peer)
    }

    pub fn is_authenticated(&self, peer: PeerId) -> bool {
        self.identities.contains_key(&peer)
    }

    pub fn authenticated_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.identities.iter().map(|entry| *entry.key()).collect();
        peers.sort_unstable();
        peers
    }

    pub fn is_net_peer_admin(&self, peer: PeerId) -> bool {
        if let Some(cached) = self.admin_sessions.get(&peer) {
            return *cached;
        }
        let Some(identity) = self.net_id_to_uuid(peer) else {
            return false;
        };
        let admin = self.admins.contains(&identity);
        self.admin_sessions.insert(peer, admin);
        admin
    }

    pub fn add_net_peer_as_admin(&self, peer: PeerId) -> Result<bool, StoreError> {
        match self.net_id_to_uuid(peer) {
            Some(identity) => self.add_admin(&identity),
            None => Ok(false),
        }
    }

    pub fn remove_net_peer_as_admin(&self, peer: PeerId) -> Result<bool, StoreError> {
        match self.net_id_to_uuid(peer) {
            Some(identity) => self.remove_admin(&identity),
            None => Ok(false),
        }
    }

    pub fn is_admin(&self, identity: &str) -> bool {
        self.admins.contains(identity)
    }

    pub fn add_admin(&self, identity: &str) -> Result<bool, StoreError> {
        let _guard = self.persist.lock();
        let added = self.admins.insert(identity.to_string());
        self.admin_sessions.clear();
        if added {
            self.persist_admins()?;
        }
        Ok(added)
    }

    pub fn remove_admin(&self, identity: &str) -> Result<bool, StoreError> {
        let _guard = self.persist.lock();
        let removed = self.admins.remove(identity).is_some();
        self.admin_sessions.clear();
        if removed {
            self.persist_admins()?;
        }
        Ok(removed)
    }

    pub fn is_banned(&self, identity: &str) -> bool {
        self.bans.contains_key(identity)
    }

    pub fn ban(&self, identity: &str, reason: &str) -> Result<(), StoreError> {
        let _guard = self.persist.lock();
        let banned_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_secs();
        self.bans.insert(
            identity.to_string(),
            BanEntry {
                identity: identity.to_string(),
                reason: reason.to_string(),
                banned_at,
            },
        );
        self.persist_bans()
    }

    pub fn unban(&self, identity: &str) -> Result<bool, StoreError> {
        let _guard = self.persist.lock();
        if self.bans.remove(identity).is_none() {
            return Ok(false);
        }
        self.persist_bans()?;
        Ok(true)
    }

    pub fn bans(&self) -> Vec<BanEntry> {
        let mut bans: Vec<BanEntry> = self.bans.iter().map(|entry| entry.value().clone()).collect();
        bans.sort_by(|a, b| a.identity.cmp(&b.identity));
        bans
    }

    fn persist_bans(&self) -> Result<(), StoreError> {
        let document = serde_json::to_string(&self.bans())?;
        self.store.add_or_update(BANS_KEY, &document)
    }

    fn persist_admins(&self) -> Result<(), StoreError> {
        let mut admins: Vec<String> = self.admins.iter().map(|admin| admin.clone()).collect();
        admins.sort();
        let document = serde_json::to_string(&admins)?;
        self.store.add_or_update(ADMINS_KEY, &document)
    }
}
