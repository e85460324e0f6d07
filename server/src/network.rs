//! UDP transport: sockets, framing, reliability and connection health

use crate::buffer::{BufferPool, PacketReader};
use crate::client_manager::{ClientManager, Connection};
use crate::config::Configuration;
use crate::error::TransportError;
use crate::transport::{PeerId, Transport, TransportEvent};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use shared::frame::split_payload;
use shared::reliability::ReceiveChannels;
use shared::{DeliveryMethod, Frame, MAX_FRAGMENT_PAYLOAD, MAX_MESSAGE_SIZE};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;

const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(50);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const RECEIVE_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub max_connections: usize,
    pub peer_timeout: Duration,
    pub resend_interval: Duration,
    pub max_resends: u32,
}

impl TransportSettings {
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            max_connections: config.max_connections,
            peer_timeout: config.peer_timeout(),
            resend_interval: config.resend_interval(),
            max_resends: config.max_resends,
        }
    }
}

/// A datagram waiting for the writer task
#[derive(Debug)]
struct Outbound {
    socket: usize,
    addr: SocketAddr,
    datagram: Vec<u8>,
    /// Set for first transmissions so the writer can settle queue accounting.
    stream: Option<(PeerId, u8, DeliveryMethod)>,
}

/// UDP implementation of [`Transport`]
///
/// Owns one socket per bind address. Spawns a receiver task per socket, a
/// single writer task, and a maintenance task that resends unacknowledged
/// reliable frames, sends heartbeats and drops silent peers.
pub struct UdpTransport {
    sockets: Vec<Arc<UdpSocket>>,
    clients: Arc<Mutex<ClientManager>>,
    /// Socket index each not-yet-accepted connect request arrived on
    pending_connects: Mutex<HashMap<SocketAddr, usize>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
    settings: TransportSettings,
}

impl UdpTransport {
    pub async fn bind(
        addrs: &[SocketAddr],
        settings: TransportSettings,
        pool: BufferPool,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        if addrs.is_empty() {
            return Err(TransportError::NoSocket);
        }

        let mut sockets = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let socket = UdpSocket::bind(addr).await?;
            info!("Listening on {}", socket.local_addr()?);
            sockets.push(Arc::new(socket));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(UdpTransport {
            sockets,
            clients: Arc::new(Mutex::new(ClientManager::new(settings.max_connections))),
            pending_connects: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            events: events_tx,
            settings,
        });

        for index in 0..transport.sockets.len() {
            tokio::spawn(Arc::clone(&transport).receive_loop(index, pool.clone()));
        }
        tokio::spawn(Self::write_loop(
            transport.sockets.clone(),
            Arc::clone(&transport.clients),
            outbound_rx,
        ));
        tokio::spawn(Arc::clone(&transport).maintenance_loop());

        Ok((transport, events_rx))
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .iter()
            .filter_map(|socket| socket.local_addr().ok())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Continuously reads datagrams from one socket
    async fn receive_loop(self: Arc<Self>, index: usize, pool: BufferPool) {
        let socket = Arc::clone(&self.sockets[index]);
        let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, addr)) => match Frame::decode(&buffer[..len]) {
                    Ok(frame) => {
                        if !self.handle_frame(index, addr, frame, &pool) {
                            debug!("Event receiver dropped, stopping socket {}", index);
                            break;
                        }
                    }
                    Err(_) => warn!("Failed to decode frame from {}", addr),
                },
                Err(e) => {
                    error!("Error receiving datagram: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    /// Returns false once the server loop has gone away.
    fn handle_frame(
        &self,
        socket: usize,
        addr: SocketAddr,
        frame: Frame,
        pool: &BufferPool,
    ) -> bool {
        let ack = frame.ack();
        match frame {
            Frame::Connect { payload } => {
                self.pending_connects.lock().insert(addr, socket);
                self.emit(TransportEvent::ConnectRequest { addr, payload })
            }

            Frame::Data {
                channel,
                delivery,
                sequence,
                payload,
            } => self.receive_data(addr, ack, channel, delivery, pool, |receive| {
                receive.receive(channel, delivery, sequence, payload)
            }),

            Frame::Fragment {
                channel,
                sequence,
                more,
                payload,
            } => self.receive_data(
                addr,
                ack,
                channel,
                DeliveryMethod::ReliableOrdered,
                pool,
                |receive| receive.receive_fragment(channel, sequence, more, payload),
            ),

            Frame::Ack {
                channel,
                delivery,
                sequence,
            } => {
                let mut clients = self.clients.lock();
                if let Some(connection) = Self::connection_for(&mut clients, addr) {
                    connection.touch();
                    connection.send.ack(channel, delivery, sequence);
                }
                true
            }

            Frame::Heartbeat => {
                let mut clients = self.clients.lock();
                if let Some(connection) = Self::connection_for(&mut clients, addr) {
                    connection.touch();
                }
                true
            }

            Frame::Disconnect => {
                let removed = {
                    let mut clients = self.clients.lock();
                    clients
                        .find_client_by_addr(addr)
                        .and_then(|peer| clients.remove_client(peer))
                };
                match removed {
                    Some(connection) => self.emit(TransportEvent::Disconnected {
                        peer: connection.id,
                    }),
                    None => true,
                }
            }

            Frame::Accepted { .. } | Frame::Rejected => {
                warn!("Ignoring server-only frame from {}", addr);
                true
            }
        }
    }

    /// Acks a data frame if needed, runs it through the connection's receive
    /// streams and emits whatever became deliverable.
    fn receive_data(
        &self,
        addr: SocketAddr,
        ack: Option<Frame>,
        channel: u8,
        delivery: DeliveryMethod,
        pool: &BufferPool,
        feed: impl FnOnce(&mut ReceiveChannels) -> Vec<Vec<u8>>,
    ) -> bool {
        let (peer, ready) = {
            let mut clients = self.clients.lock();
            let Some(connection) = Self::connection_for(&mut clients, addr) else {
                debug!("Data from unknown address {}", addr);
                return true;
            };
            connection.touch();
            if let Some(ack) = ack {
                if let Err(e) = self.send_frame(connection.socket, connection.addr, &ack) {
                    error!("Failed to queue ack for {}: {}", addr, e);
                }
            }
            let ready: Vec<PacketReader> = feed(&mut connection.receive)
                .iter()
                .map(|bytes| PacketReader::new(pool.copy_from(bytes)))
                .collect();
            (connection.id, ready)
        };

        ready.into_iter().all(|reader| {
            self.emit(TransportEvent::Received {
                peer,
                channel,
                delivery,
                reader,
            })
        })
    }

    fn connection_for(clients: &mut ClientManager, addr: SocketAddr) -> Option<&mut Connection> {
        let peer = clients.find_client_by_addr(addr)?;
        clients.get_mut(peer)
    }

    fn emit(&self, event: TransportEvent) -> bool {
        if let Err(e) = self.events.send(event) {
            error!("Failed to send transport event to server loop: {}", e);
            return false;
        }
        true
    }

    fn send_frame(
        &self,
        socket: usize,
        addr: SocketAddr,
        frame: &Frame,
    ) -> Result<(), TransportError> {
        let datagram = frame.encode()?;
        self.outbound
            .send(Outbound {
                socket,
                addr,
                datagram,
                stream: None,
            })
            .map_err(|_| TransportError::Closed)
    }

    /// Drains the outbound queue onto the sockets
    async fn write_loop(
        sockets: Vec<Arc<UdpSocket>>,
        clients: Arc<Mutex<ClientManager>>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        while let Some(message) = outbound.recv().await {
            let Some(socket) = sockets.get(message.socket) else {
                error!("No socket {} for datagram to {}", message.socket, message.addr);
                continue;
            };
            if let Err(e) = socket.send_to(&message.datagram, message.addr).await {
                error!("Failed to send datagram to {}: {}", message.addr, e);
            }
            if let Some((peer, channel, delivery)) = message.stream {
                if let Some(connection) = clients.lock().get_mut(peer) {
                    connection.dequeue(channel, delivery);
                }
            }
        }
    }

    /// Resends, heartbeats and timeouts
    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = interval(MAINTENANCE_INTERVAL);

        loop {
            ticker.tick().await;
            let now = Instant::now();

            let mut frames = Vec::new();
            let mut dropped = Vec::new();
            {
                let mut clients = self.clients.lock();
                let mut exhausted = Vec::new();

                for connection in clients.connections_mut() {
                    let sweep = connection.send.due_for_resend(
                        now,
                        self.settings.resend_interval,
                        self.settings.max_resends,
                    );
                    if sweep.exhausted {
                        exhausted.push(connection.id);
                        continue;
                    }
                    for datagram in sweep.datagrams {
                        frames.push(Outbound {
                            socket: connection.socket,
                            addr: connection.addr,
                            datagram,
                            stream: None,
                        });
                    }
                    if now.duration_since(connection.last_heartbeat) >= HEARTBEAT_INTERVAL {
                        connection.last_heartbeat = now;
                        if let Ok(datagram) = Frame::Heartbeat.encode() {
                            frames.push(Outbound {
                                socket: connection.socket,
                                addr: connection.addr,
                                datagram,
                                stream: None,
                            });
                        }
                    }
                }

                for peer in exhausted {
                    if let Some(connection) = clients.remove_client(peer) {
                        warn!("Peer {} stopped acknowledging reliable frames", peer);
                        if let Ok(datagram) = Frame::Disconnect.encode() {
                            frames.push(Outbound {
                                socket: connection.socket,
                                addr: connection.addr,
                                datagram,
                                stream: None,
                            });
                        }
                        dropped.push(peer);
                    }
                }

                for peer in clients.check_timeouts(self.settings.peer_timeout) {
                    info!("Peer {} timed out", peer);
                    dropped.push(peer);
                }
            }

            for frame in frames {
                if self.outbound.send(frame).is_err() {
                    return;
                }
            }
            for peer in dropped {
                if !self.emit(TransportEvent::Disconnected { peer }) {
                    return;
                }
            }
        }
    }
}

impl Transport for UdpTransport {
    fn accept(&self, addr: SocketAddr) -> Result<PeerId, TransportError> {
        let arrived_on = self.pending_connects.lock().remove(&addr).unwrap_or(0);
        let (peer, socket) = {
            let mut clients = self.clients.lock();
            let peer = clients
                .add_client(addr, arrived_on)
                .ok_or(TransportError::ServerFull)?;
            let socket = clients.get(peer).map(|c| c.socket).unwrap_or(arrived_on);
            (peer, socket)
        };
        self.send_frame(socket, addr, &Frame::Accepted { peer_id: peer })?;
        Ok(peer)
    }

    fn reject(&self, addr: SocketAddr) {
        let socket = self.pending_connects.lock().remove(&addr).unwrap_or(0);
        if let Err(e) = self.send_frame(socket, addr, &Frame::Rejected) {
            error!("Failed to reject {}: {}", addr, e);
        }
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

        let fragmented = payload.len() > MAX_FRAGMENT_PAYLOAD;
        if fragmented
            && (delivery != DeliveryMethod::ReliableOrdered || payload.len() > MAX_MESSAGE_SIZE)
        {
            return Err(TransportError::Oversized(payload.len()));
        }

        let outbound = {
            let mut clients = self.clients.lock();
            let connection = clients
                .get_mut(peer)
                .ok_or(TransportError::UnknownPeer(peer))?;

            let frames: Vec<(u32, Frame)> = if fragmented {
                split_payload(payload)
                    .into_iter()
                    .map(|(piece, more)| {
                        let sequence = connection.send.next_sequence(channel, delivery);
                        let frame = Frame::Fragment {
                            channel,
                            sequence,
                            more,
                            payload: piece.to_vec(),
                        };
                        (sequence, frame)
                    })
                    .collect()
            } else {
                let sequence = connection.send.next_sequence(channel, delivery);
                let frame = Frame::Data {
                    channel,
                    delivery,
                    sequence,
                    payload: payload.to_vec(),
                };
                vec![(sequence, frame)]
            };

            let now = Instant::now();
            let mut outbound = Vec::with_capacity(frames.len());
            for (sequence, frame) in frames {
                let datagram = frame.encode()?;
                connection
                    .send
                    .track(channel, delivery, sequence, datagram.clone(), now);
                connection.enqueue(channel, delivery);
                outbound.push(Outbound {
                    socket: connection.socket,
                    addr: connection.addr,
                    datagram,
                    stream: Some((peer, channel, delivery)),
                });
            }
            outbound
        };

        for message in outbound {
            self.outbound.send(message).map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    fn queue_depth(&self, peer: PeerId, channel: u8, delivery: DeliveryMethod) -> usize {
        self.clients
            .lock()
            .get(peer)
            .map(|connection| connection.queue_depth(channel, delivery))
            .unwrap_or(0)
    }

    fn disconnect(&self, peer: PeerId) {
        let removed = self.clients.lock().remove_client(peer);
        if let Some(connection) = removed {
            let farewell = self.send_frame(connection.socket, connection.addr, &Frame::Disconnect);
            if let Err(e) = farewell {
                error!("Failed to notify peer {} of disconnect: {}", peer, e);
            }
        }
    }

    fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.clients.lock().get(peer).map(|connection| connection.addr)
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        self.clients.lock().get(peer).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::MAX_PACKET_SIZE;
    use tokio::time::timeout;

    fn settings() -> TransportSettings {
        TransportSettings {
            max_connections: 4,
            peer_timeout: Duration::from_secs(5),
            resend_interval: Duration::from_millis(100),
            max_resends: 10,
        }
    }

    async fn bind() -> (Arc<UdpTransport>, mpsc::UnboundedReceiver<TransportEvent>, SocketAddr) {
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (transport, events) = UdpTransport::bind(&[local], settings(), BufferPool::new())
            .await
            .unwrap();
        let addr = transport.local_addrs()[0];
        (transport, events, addr)
    }

    async fn recv_frame(socket: &UdpSocket) -> Frame {
        let mut buf = [0u8; 2048];
        loop {
            let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
                .await
                .expect("timed out waiting for frame")
                .unwrap();
            let frame = Frame::decode(&buf[..len]).unwrap();
            if frame != Frame::Heartbeat {
                return frame;
            }
        }
    }

    async fn connect(
        socket: &UdpSocket,
        server: SocketAddr,
        transport: &UdpTransport,
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> PeerId {
        let connect = Frame::Connect { payload: vec![1, 2, 3] };
        socket.send_to(&connect.encode().unwrap(), server).await.unwrap();

        let addr = match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
            Some(TransportEvent::ConnectRequest { addr, payload }) => {
                assert_eq!(payload, vec![1, 2, 3]);
                addr
            }
            other => panic!("unexpected event {:?}", other),
        };
        let peer = transport.accept(addr).unwrap();
        assert_eq!(recv_frame(socket).await, Frame::Accepted { peer_id: peer });
        peer
    }

    #[tokio::test]
    async fn test_connect_and_receive_reliable_data() {
        let (transport, mut events, server) = bind().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = connect(&client, server, &transport, &mut events).await;

        let data = Frame::Data {
            channel: 8,
            delivery: DeliveryMethod::ReliableOrdered,
            sequence: 0,
            payload: vec![42],
        };
        client.send_to(&data.encode().unwrap(), server).await.unwrap();

        assert_eq!(
            recv_frame(&client).await,
            Frame::Ack {
                channel: 8,
                delivery: DeliveryMethod::ReliableOrdered,
                sequence: 0
            }
        );
        match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
            Some(TransportEvent::Received {
                peer: from,
                channel,
                reader,
                ..
            }) => {
                assert_eq!(from, peer);
                assert_eq!(channel, 8);
                assert_eq!(reader.remaining(), &[42]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reliable_send_counts_until_acked() {
        let (transport, mut events, server) = bind().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = connect(&client, server, &transport, &mut events).await;

        transport
            .send(peer, &[7, 7], 10, DeliveryMethod::ReliableOrdered)
            .unwrap();
        let frame = recv_frame(&client).await;
        let Frame::Data { sequence, .. } = frame else {
            panic!("expected data frame, got {:?}", frame);
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.queue_depth(peer, 10, DeliveryMethod::ReliableOrdered), 1);

        let ack = Frame::Ack {
            channel: 10,
            delivery: DeliveryMethod::ReliableOrdered,
            sequence,
        };
        client.send_to(&ack.encode().unwrap(), server).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.queue_depth(peer, 10, DeliveryMethod::ReliableOrdered), 0);
    }

    #[tokio::test]
    async fn test_empty_and_oversized_sends_are_refused() {
        let (transport, mut events, server) = bind().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = connect(&client, server, &transport, &mut events).await;

        assert!(matches!(
            transport.send(peer, &[], 2, DeliveryMethod::Sequenced),
            Err(TransportError::EmptyPayload)
        ));
        let large = vec![0u8; MAX_PACKET_SIZE];
        assert!(matches!(
            transport.send(peer, &large, 2, DeliveryMethod::Sequenced),
            Err(TransportError::Oversized(_))
        ));
        assert!(matches!(
            transport.send(peer, &large, 10, DeliveryMethod::ReliableUnordered),
            Err(TransportError::Oversized(_))
        ));
        let huge = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            transport.send(peer, &huge, 7, DeliveryMethod::ReliableOrdered),
            Err(TransportError::Oversized(_))
        ));
    }

    #[tokio::test]
    async fn test_large_reliable_message_is_fragmented() {
        let (transport, mut events, server) = bind().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = connect(&client, server, &transport, &mut events).await;

        let payload: Vec<u8> = (0..MAX_FRAGMENT_PAYLOAD * 3 + 1).map(|i| i as u8).collect();
        transport
            .send(peer, &payload, 7, DeliveryMethod::ReliableOrdered)
            .unwrap();

        let mut receive = ReceiveChannels::new();
        let mut delivered = Vec::new();
        let mut pieces = 0;
        while delivered.is_empty() {
            let frame = recv_frame(&client).await;
            let Frame::Fragment {
                channel,
                sequence,
                more,
                payload,
            } = frame
            else {
                panic!("expected a fragment, got {:?}", frame);
            };
            assert_eq!(channel, 7);
            pieces += 1;
            delivered = receive.receive_fragment(channel, sequence, more, payload);
        }

        assert_eq!(pieces, 4);
        assert_eq!(delivered, vec![payload]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.queue_depth(peer, 7, DeliveryMethod::ReliableOrdered), 4);
    }

    #[tokio::test]
    async fn test_inbound_fragments_are_acked_and_reassembled() {
        let (transport, mut events, server) = bind().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = connect(&client, server, &transport, &mut events).await;

        let payload = vec![5u8; MAX_FRAGMENT_PAYLOAD + 20];
        for (sequence, (piece, more)) in split_payload(&payload).into_iter().enumerate() {
            let fragment = Frame::Fragment {
                channel: 23,
                sequence: sequence as u32,
                more,
                payload: piece.to_vec(),
            };
            client.send_to(&fragment.encode().unwrap(), server).await.unwrap();
            assert_eq!(
                recv_frame(&client).await,
                Frame::Ack {
                    channel: 23,
                    delivery: DeliveryMethod::ReliableOrdered,
                    sequence: sequence as u32,
                }
            );
        }

        match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
            Some(TransportEvent::Received {
                peer: from,
                channel,
                delivery,
                reader,
            }) => {
                assert_eq!(from, peer);
                assert_eq!(channel, 23);
                assert_eq!(delivery, DeliveryMethod::ReliableOrdered);
                assert_eq!(reader.remaining(), payload.as_slice());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_disconnect_raises_event() {
        let (transport, mut events, server) = bind().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = connect(&client, server, &transport, &mut events).await;

        client
            .send_to(&Frame::Disconnect.encode().unwrap(), server)
            .await
            .unwrap();
        match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
            Some(TransportEvent::Disconnected { peer: gone }) => assert_eq!(gone, peer),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!transport.is_connected(peer));
    }

    #[tokio::test]
    async fn test_reject_sends_rejected_frame() {
        let (transport, mut events, server) = bind().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let connect = Frame::Connect { payload: vec![] };
        client.send_to(&connect.encode().unwrap(), server).await.unwrap();
        let Some(TransportEvent::ConnectRequest { addr, .. }) =
            timeout(Duration::from_secs(2), events.recv()).await.unwrap()
        else {
            panic!("expected connect request");
        };

        transport.reject(addr);
        assert_eq!(recv_frame(&client).await, Frame::Rejected);
        assert_eq!(transport.connection_count(), 0);
    }
}
