//! Authoritative owner map for networked objects.
//!
//! Each key has one record holding its owner and a version that is bumped by
//! every mutation. Mutations take the record's shard lock through the
//! `DashMap` entry API, so two racing writers are serialised per key and never
//! observe each other half-applied. Released keys stay behind as unowned
//! records so their versions keep increasing.

use crate::transport::PeerId;
use dashmap::DashMap;
use shared::messages::OwnershipState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Record {
    owner: Option<PeerId>,
    version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Ownership moved to the requester.
    Granted(OwnershipState),
    /// The requester already owned the key.
    Unchanged(OwnershipState),
    /// `expected_version` did not match; carries the current state.
    Conflict(OwnershipState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    Released(OwnershipState),
    /// Requester is neither the owner nor an admin, or the key is unowned.
    Rejected(OwnershipState),
}

#[derive(Debug, Default)]
pub struct OwnershipManager {
    records: DashMap<String, Record>,
}

impl OwnershipManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key` for `peer`. Without `expected_version` the latest request
    /// wins; with it, the claim only succeeds against that exact version.
    pub fn transfer(
        &self,
        key: &str,
        peer: PeerId,
        expected_version: Option<u64>,
    ) -> TransferOutcome {
        let mut record = self.records.entry(key.to_string()).or_default();

        if let Some(expected) = expected_version {
            if expected != record.version {
                return TransferOutcome::Conflict(state(key, &record));
            }
        }
        if record.owner == Some(peer) {
            return TransferOutcome::Unchanged(state(key, &record));
        }

        record.owner = Some(peer);
        record.version += 1;
        TransferOutcome::Granted(state(key, &record))
    }

    pub fn current(&self, key: &str) -> OwnershipState {
        match self.records.get(key) {
            Some(record) => state(key, &record),
            None => state(key, &Record::default()),
        }
    }

    pub fn remove(&self, key: &str, peer: PeerId, is_admin: bool) -> RemoveOutcome {
        let Some(mut record) = self.records.get_mut(key) else {
            return RemoveOutcome::Rejected(state(key, &Record::default()));
        };

        match record.owner {
            Some(owner) if owner == peer || is_admin => {
                record.owner = None;
                record.version += 1;
                RemoveOutcome::Released(state(key, &record))
            }
            _ => RemoveOutcome::Rejected(state(key, &record)),
        }
    }

    /// Releases every key `peer` owns, returning the new states.
    pub fn release_all(&self, peer: PeerId) -> Vec<OwnershipState> {
        let mut released: Vec<OwnershipState> = self
            .records
            .iter_mut()
            .filter(|record| record.owner == Some(peer))
            .map(|mut record| {
                record.owner = None;
                record.version += 1;
                state(record.key(), &record)
            })
            .collect();
        released.sort_by(|a, b| a.key.cmp(&b.key));
        released
    }

    pub fn owned_by(&self, peer: PeerId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .records
            .iter()
            .filter(|record| record.owner == Some(peer))
            .map(|record| record.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

fn state(key: &str, record: &Record) -> OwnershipState {
    OwnershipState {
        key: key.to_string(),
        owner: record.owner,
        version: record.version,
    }
}
