//! One pending-challenge slot per peer.
//!
//! A challenge leaves its slot exactly once: consumed by a response, replaced
//! by a newer challenge, discarded on disconnect, or expired. Whatever the
//! outcome of verification, a consumed nonce is never looked up again.

use super::did::Challenge;
use super::AuthFailure;
use crate::transport::PeerId;
use dashmap::DashMap;
use shared::messages::ReadyMessage;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PendingChallenge {
    pub challenge: Challenge,
    /// Join state carried by the connect request, applied once authenticated.
    pub ready: ReadyMessage,
    pub issued_at: Instant,
}

impl PendingChallenge {
    pub fn new(challenge: Challenge, ready: ReadyMessage) -> Self {
        Self {
            challenge,
            ready,
            issued_at: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub struct PendingChallenges {
    slots: DashMap<PeerId, PendingChallenge>,
    timeout: Duration,
}

impl PendingChallenges {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            timeout,
        }
    }

    /// Stores a challenge, returning the one it supersedes.
    pub fn insert(&self, peer: PeerId, pending: PendingChallenge) -> Option<PendingChallenge> {
        self.slots.insert(peer, pending)
    }

    /// Removes the peer's challenge for verification.
    pub fn take(&self, peer: PeerId) -> Result<PendingChallenge, AuthFailure> {
        let (_, pending) = self
            .slots
            .remove(&peer)
            .ok_or(AuthFailure::NoPendingChallenge)?;
        if pending.issued_at.elapsed() > self.timeout {
            return Err(AuthFailure::Expired);
        }
        Ok(pending)
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.slots.contains_key(&peer)
    }

    pub fn discard(&self, peer: PeerId) -> bool {
        self.slots.remove(&peer).is_some()
    }

    /// Removes and returns every peer whose challenge is older than the timeout.
    pub fn expire(&self, now: Instant) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .slots
            .iter()
            .filter(|slot| now.duration_since(slot.issued_at) > self.timeout)
            .map(|slot| *slot.key())
            .collect();
        expired
            .into_iter()
            .filter(|peer| {
                self.slots
                    .remove_if(peer, |_, slot| now.duration_since(slot.issued_at) > self.timeout)
                    .is_some()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
