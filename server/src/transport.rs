//! Transport seam between the relay core and the network.
//!
//! The core only talks to peers through [`Transport`]. [`crate::network::UdpTransport`] provides
//! the real implementation; [`MemoryTransport`] records traffic for tests.

use crate::buffer::PacketReader;
use crate::error::TransportError;
use parking_lot::Mutex;
use shared::DeliveryMethod;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Transport-level connection id, unique for the connection's lifetime.
pub type PeerId = u32;

#[derive(Debug)]
pub enum TransportEvent {
    ConnectRequest {
        addr: SocketAddr,
        payload: Vec<u8>,
    },
    Received {
        peer: PeerId,
        channel: u8,
        delivery: DeliveryMethod,
        reader: PacketReader,
    },
    /// The remote side left or timed out. Not raised for [`Transport::disconnect`].
    Disconnected { peer: PeerId },
}

pub trait Transport: Send + Sync {
    /// Opens a connection for `addr`, or returns the existing one.
    fn accept(&self, addr: SocketAddr) -> Result<PeerId, TransportError>;

    /// Refuses a connect request without opening a connection.
    fn reject(&self, addr: SocketAddr);

    fn send(
        &self,
        peer: PeerId,
        payload: &[u8],
        channel: u8,
        delivery: DeliveryMethod,
    ) -> Result<(), TransportError>;

    /// Frames for this stream that are queued or awaiting an ack.
    fn queue_depth(&self, peer: PeerId, channel: u8, delivery: DeliveryMethod) -> usize;

    fn disconnect(&self, peer: PeerId);

    fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr>;

    fn is_connected(&self, peer: PeerId) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub peer: PeerId,
    pub channel: u8,
    pub delivery: DeliveryMethod,
    pub payload: Vec<u8>,
}

/// In-process transport that records every send.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    next_id: AtomicU32,
    peers: Mutex<HashMap<PeerId, SocketAddr>>,
    sent: Mutex<Vec<SentMessage>>,
    depths: Mutex<HashMap<(PeerId, u8, DeliveryMethod), usize>>,
    rejected: Mutex<Vec<SocketAddr>>,
    disconnected: Mutex<Vec<PeerId>>,
    capacity: Mutex<Option<usize>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            ..Self::default()
        }
    }

    pub fn set_queue_depth(
        &self,
        peer: PeerId,
        channel: u8,
        delivery: DeliveryMethod,
        depth: usize,
    ) {
        self.depths.lock().insert((peer, channel, delivery), depth);
    }

    /// Caps how many peers [`Transport::accept`] admits.
    pub fn set_capacity(&self, capacity: usize) {
        *self.capacity.lock() = Some(capacity);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, peer: PeerId) -> Vec<SentMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|message| message.peer == peer)
            .cloned()
            .collect()
    }

    pub fn take_sent(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn rejected(&self) -> Vec<SocketAddr> {
        self.rejected.lock().clone()
    }

    pub fn disconnected(&self) -> Vec<PeerId> {
        self.disconnected.lock().clone()
    }
}

impl Transport for MemoryTransport {
    fn accept(&self, addr: SocketAddr) -> Result<PeerId, TransportError> {
        let mut peers = self.peers.lock();
        if let Some((id, _)) = peers.iter().find(|(_, known)| **known == addr) {
            return Ok(*id);
        }
        if self.capacity.lock().is_some_and(|capacity| peers.len() >= capacity) {
            return Err(TransportError::ServerFull);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).max(1);
        peers.insert(id, addr);
        Ok(id)
    }

    fn reject(&self, addr: SocketAddr) {
        self.rejected.lock().push(addr);
    }

    fn send(
        &self,
        peer: PeerId,
        payload: &[u8],
        channel: u8,
        delivery: DeliveryMethod,
    ) -> Result<(), TransportError> {
        if payload.is_empty() {
            return Err(TransportError::EmptyPayload);
        }
        if !self.peers.lock().contains_key(&peer) {
            return Err(TransportError::UnknownPeer(peer));
        }
        self.sent.lock().push(SentMessage {
            peer,
            channel,
            delivery,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn queue_depth(&self, peer: PeerId, channel: u8, delivery: DeliveryMethod) -> usize {
        self.depths
            .lock()
            .get(&(peer, channel, delivery))
            .copied()
            .unwrap_or(0)
    }

    fn disconnect(&self, peer: PeerId) {
        if self.peers.lock().remove(&peer).is_some() {
            self.disconnected.lock().push(peer);
        }
    }

    fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peers.lock().get(&peer).copied()
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        self.peers.lock().contains_key(&peer)
    }
}
