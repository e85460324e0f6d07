//! Transport-level connection table for the UDP transport
//!
//! This module tracks every open UDP connection, including:
//! - Peer id assignment and address lookup
//! - Per-connection reliability state (sequencing, acks, reordering)
//! - Outbound queue accounting used for backpressure
//! - Liveness tracking and timeout detection
//!
//! Identity and authentication are not handled here; a connection in this
//! table may still be waiting on its challenge.

use crate::transport::PeerId;
use log::info;
use shared::reliability::{ReceiveChannels, SendChannels, StreamKey};
use shared::DeliveryMethod;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One open connection and its reliability state
///
/// Each connection maintains:
/// - Addressing (peer id, remote address, which local socket it arrived on)
/// - Outbound sequencing and unacknowledged reliable frames
/// - Inbound ordering and duplicate removal
/// - Frames handed to the writer task but not yet on the wire
#[derive(Debug)]
pub struct Connection {
    /// Peer id assigned by the transport
    pub id: PeerId,
    /// Remote address for outbound frames
    pub addr: SocketAddr,
    /// Index of the local socket this connection talks through
    pub socket: usize,
    /// Last time any frame arrived from this peer
    pub last_seen: Instant,
    /// Last time we sent a heartbeat
    pub last_heartbeat: Instant,
    pub send: SendChannels,
    pub receive: ReceiveChannels,
    queued: HashMap<StreamKey, usize>,
}

impl Connection {
    /// Creates a connection that counts as freshly active
    pub fn new(id: PeerId, addr: SocketAddr, socket: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            socket,
            last_seen: now,
            last_heartbeat: now,
            send: SendChannels::new(),
            receive: ReceiveChannels::new(),
            queued: HashMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Checks if the peer has been silent longer than `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    /// Counts a frame handed to the writer task
    pub fn enqueue(&mut self, channel: u8, delivery: DeliveryMethod) {
        *self.queued.entry((channel, delivery)).or_insert(0) += 1;
    }

    /// Counts a frame the writer task has put on the wire
    pub fn dequeue(&mut self, channel: u8, delivery: DeliveryMethod) {
        if let Some(count) = self.queued.get_mut(&(channel, delivery)) {
            *count = count.saturating_sub(1);
        }
    }

    /// Queued frames plus reliable frames still waiting for an ack
    pub fn queue_depth(&self, channel: u8, delivery: DeliveryMethod) -> usize {
        let queued = self.queued.get(&(channel, delivery)).copied().unwrap_or(0);
        queued + self.send.pending_count(channel, delivery)
    }
}

/// Manages all open connections
///
/// The ClientManager enforces the connection limit and keeps an address
/// index so inbound datagrams can be matched to their connection without a
/// scan.
pub struct ClientManager {
    /// Open connections indexed by peer id
    clients: HashMap<PeerId, Connection>,
    /// Reverse index from remote address to peer id
    by_addr: HashMap<SocketAddr, PeerId>,
    /// Next peer id to hand out
    next_client_id: PeerId,
    /// Maximum number of concurrent connections allowed
    max_clients: usize,
}

impl ClientManager {
    /// Creates an empty table with the given connection limit
    ///
    /// Peer ids start from 1 and are never reused within a process.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            by_addr: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Opens a connection for `addr`
    ///
    /// Returns the existing peer id when the address is already connected,
    /// and None when the table is full.
    pub fn add_client(&mut self, addr: SocketAddr, socket: usize) -> Option<PeerId> {
        if let Some(existing) = self.by_addr.get(&addr) {
            return Some(*existing);
        }
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id = self.next_client_id.wrapping_add(1).max(1);

        info!("Peer {} connected from {}", client_id, addr);
        self.clients
            .insert(client_id, Connection::new(client_id, addr, socket));
        self.by_addr.insert(addr, client_id);

        Some(client_id)
    }

    /// Removes a connection, returning it if it was open
    pub fn remove_client(&mut self, client_id: PeerId) -> Option<Connection> {
        let connection = self.clients.remove(&client_id)?;
        self.by_addr.remove(&connection.addr);
        info!("Peer {} disconnected", client_id);
        Some(connection)
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.by_addr.get(&addr).copied()
    }

    pub fn get(&self, client_id: PeerId) -> Option<&Connection> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: PeerId) -> Option<&mut Connection> {
        self.clients.get_mut(&client_id)
    }

    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.clients.values_mut()
    }

    /// Removes connections that have been silent longer than `timeout`
    ///
    /// Returns the removed peer ids so the caller can raise disconnect
    /// events for them.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<PeerId> {
        let timed_out: Vec<PeerId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            self.remove_client(*client_id);
        }

        timed_out
    }

    /// Returns the number of open connections
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no connections are open
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
