use bincode::serialize;
use ed25519_dalek::{Signer, SigningKey};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::did::encode_pubkey_as_did;
use shared::frame::split_payload;
use shared::messages::{
    self, AuthIdentityMessage, AuthPayload, ConnectionRequest, PlayerId, ReadyMessage,
};
use shared::reliability::{ReceiveChannels, SendChannels};
use shared::{
    Channel, DeliveryMethod, Frame, MAX_FRAGMENT_PAYLOAD, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const RESEND_INTERVAL: Duration = Duration::from_millis(200);
const MAX_RESENDS: u32 = 25;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("server did not complete the handshake in time")]
    Timeout,
    #[error("server refused the connection")]
    Rejected,
    #[error("server closed the connection")]
    Disconnected,
    #[error("server stopped acknowledging reliable messages")]
    Unresponsive,
    #[error("refusing to send an empty payload")]
    EmptyPayload,
    #[error("payload of {0} bytes is too large for its delivery method")]
    Oversized(usize),
}

/// How the client proves its identity.
pub enum Credentials {
    Password { identity: String, password: String },
    /// Signs the server's challenge; the identity is the key's `did:key`.
    Did(SigningKey),
}

impl Credentials {
    pub fn identity(&self) -> String {
        match self {
            Credentials::Password { identity, .. } => identity.clone(),
            Credentials::Did(key) => encode_pubkey_as_did(&key.verifying_key().to_bytes()),
        }
    }

    fn auth_payload(&self) -> AuthPayload {
        match self {
            Credentials::Password { password, .. } => AuthPayload::Password(password.clone()),
            Credentials::Did(_) => AuthPayload::Did,
        }
    }
}

/// A message delivered by the server, with fall-channel tunnelling removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub channel: u8,
    pub delivery: DeliveryMethod,
    pub payload: Vec<u8>,
}

impl Incoming {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, bincode::Error> {
        messages::decode(&self.payload)
    }
}

/// UDP connection to a relay server
pub struct RelayClient {
    socket: UdpSocket,
    server: SocketAddr,
    player_id: PlayerId,
    accepted: bool,
    send: SendChannels,
    receive: ReceiveChannels,
    inbox: VecDeque<Incoming>,
    last_heartbeat: Instant,
}

impl RelayClient {
    /// Connects and authenticates. Messages that arrive during the handshake
    /// stay queued for [`RelayClient::recv`].
    pub async fn connect(
        server: SocketAddr,
        credentials: Credentials,
        ready: ReadyMessage,
    ) -> Result<Self, ClientError> {
        let local: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;

        let identity = credentials.identity();
        let request = ConnectionRequest {
            protocol_version: PROTOCOL_VERSION,
            identity: identity.clone(),
            auth: credentials.auth_payload(),
            ready,
        };
        let connect = Frame::Connect {
            payload: serialize(&request)?,
        }
        .encode()?;

        let mut client = RelayClient {
            socket,
            server,
            player_id: 0,
            accepted: false,
            send: SendChannels::new(),
            receive: ReceiveChannels::new(),
            inbox: VecDeque::new(),
            last_heartbeat: Instant::now(),
        };

        info!("Connecting to {} as {}", server, identity);
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut last_connect: Option<Instant> = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout);
            }
            let retry_due = last_connect
                .map_or(true, |sent| now.duration_since(sent) >= CONNECT_RETRY_INTERVAL);
            if !client.accepted && retry_due {
                client.socket.send(&connect).await?;
                last_connect = Some(now);
            }

            match client.pump(POLL_INTERVAL).await {
                Ok(()) => {}
                Err(ClientError::Disconnected) => return Err(ClientError::Rejected),
                Err(e) => return Err(e),
            }

            if let Some(index) = client
                .inbox
                .iter()
                .position(|message| message.channel == Channel::AuthIdentity.id())
            {
                let Some(message) = client.inbox.remove(index) else {
                    continue;
                };
                match message.decode::<AuthIdentityMessage>()? {
                    AuthIdentityMessage::Challenge { nonce } => {
                        let Credentials::Did(key) = &credentials else {
                            warn!("Challenged while using password credentials");
                            return Err(ClientError::Rejected);
                        };
                        debug!("Answering challenge");
                        let response = AuthIdentityMessage::Response {
                            signature: key.sign(&nonce).to_bytes().to_vec(),
                            key_fragment: String::new(),
                        };
                        client
                            .send_message(
                                Channel::AuthIdentity,
                                DeliveryMethod::ReliableOrdered,
                                &response,
                            )
                            .await?;
                    }
                    AuthIdentityMessage::Accepted { player_id } => {
                        info!("Joined as player {}", player_id);
                        client.player_id = player_id;
                        return Ok(client);
                    }
                    AuthIdentityMessage::Response { .. } => {
                        debug!("Ignoring stray auth response");
                    }
                }
            }
        }
    }

    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Sends raw bytes. Unreliable sends are tunnelled through the fall
    /// channel.
    pub async fn send(
        &mut self,
        channel: Channel,
        delivery: DeliveryMethod,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        if payload.is_empty() {
            return Err(ClientError::EmptyPayload);
        }

        let tunnel = delivery == DeliveryMethod::Unreliable && channel != Channel::Fall;
        let (wire_channel, bytes) = if tunnel {
            let mut tunneled = Vec::with_capacity(payload.len() + 1);
            tunneled.push(channel.id());
            tunneled.extend_from_slice(payload);
            (Channel::Fall.id(), tunneled)
        } else {
            (channel.id(), payload.to_vec())
        };

        if bytes.len() <= MAX_FRAGMENT_PAYLOAD {
            let sequence = self.send.next_sequence(wire_channel, delivery);
            let frame = Frame::Data {
                channel: wire_channel,
                delivery,
                sequence,
                payload: bytes,
            };
            return self.transmit(wire_channel, delivery, sequence, &frame).await;
        }
        if delivery != DeliveryMethod::ReliableOrdered || bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ClientError::Oversized(bytes.len()));
        }

        for (piece, more) in split_payload(&bytes) {
            let sequence = self.send.next_sequence(wire_channel, delivery);
            let frame = Frame::Fragment {
                channel: wire_channel,
                sequence,
                more,
                payload: piece.to_vec(),
            };
            self.transmit(wire_channel, delivery, sequence, &frame).await?;
        }
        Ok(())
    }

    async fn transmit(
        &mut self,
        channel: u8,
        delivery: DeliveryMethod,
        sequence: u32,
        frame: &Frame,
    ) -> Result<(), ClientError> {
        let datagram = frame.encode()?;
        self.socket.send(&datagram).await?;
        self.send.track(channel, delivery, sequence, datagram, Instant::now());
        Ok(())
    }

    pub async fn send_message<T: Serialize>(
        &mut self,
        channel: Channel,
        delivery: DeliveryMethod,
        message: &T,
    ) -> Result<(), ClientError> {
        let payload = serialize(message)?;
        self.send(channel, delivery, &payload).await
    }

    /// Next delivered message, or `None` if nothing arrives within `wait`.
    pub async fn recv(&mut self, wait: Duration) -> Result<Option<Incoming>, ClientError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.pump(deadline - now).await?;
        }
    }

    /// Waits for a message on `channel`, discarding anything else.
    pub async fn wait_for<T: DeserializeOwned>(
        &mut self,
        channel: Channel,
        wait: Duration,
    ) -> Result<Option<T>, ClientError> {
        let deadline = Instant::now() + wait;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            match self.recv(deadline - now).await? {
                Some(message) if message.channel == channel.id() => {
                    return Ok(Some(message.decode()?));
                }
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    pub async fn disconnect(self) -> Result<(), ClientError> {
        self.socket.send(&Frame::Disconnect.encode()?).await?;
        info!("Disconnected from {}", self.server);
        Ok(())
    }

    /// Reads at most one datagram, then resends and heartbeats as due.
    async fn pump(&mut self, wait: Duration) -> Result<(), ClientError> {
        let mut buffer = [0u8; 2048];
        match timeout(wait.min(POLL_INTERVAL), self.socket.recv(&mut buffer)).await {
            Ok(Ok(len)) => match Frame::decode(&buffer[..len]) {
                Ok(frame) => self.handle_frame(frame).await?,
                Err(e) => debug!("Undecodable datagram from server: {}", e),
            },
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {}
        }
        self.maintain().await
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), ClientError> {
        if let Some(ack) = frame.ack() {
            self.socket.send(&ack.encode()?).await?;
        }
        match frame {
            Frame::Accepted { peer_id } => {
                self.accepted = true;
                self.player_id = peer_id;
            }
            Frame::Rejected | Frame::Disconnect => return Err(ClientError::Disconnected),
            Frame::Data {
                channel,
                delivery,
                sequence,
                payload,
            } => {
                for bytes in self.receive.receive(channel, delivery, sequence, payload) {
                    self.deliver(channel, delivery, bytes);
                }
            }
            Frame::Fragment {
                channel,
                sequence,
                more,
                payload,
            } => {
                let delivery = DeliveryMethod::ReliableOrdered;
                for bytes in self.receive.receive_fragment(channel, sequence, more, payload) {
                    self.deliver(channel, delivery, bytes);
                }
            }
            Frame::Ack {
                channel,
                delivery,
                sequence,
            } => {
                self.send.ack(channel, delivery, sequence);
            }
            Frame::Heartbeat | Frame::Connect { .. } => {}
        }
        Ok(())
    }

    fn deliver(&mut self, channel: u8, delivery: DeliveryMethod, mut payload: Vec<u8>) {
        let channel = if channel == Channel::Fall.id() {
            if payload.is_empty() {
                debug!("Empty fall-channel message");
                return;
            }
            payload.remove(0)
        } else {
            channel
        };
        self.inbox.push_back(Incoming {
            channel,
            delivery,
            payload,
        });
    }

    async fn maintain(&mut self) -> Result<(), ClientError> {
        let now = Instant::now();
        let sweep = self.send.due_for_resend(now, RESEND_INTERVAL, MAX_RESENDS);
        if sweep.exhausted {
            return Err(ClientError::Unresponsive);
        }
        for datagram in sweep.datagrams {
            self.socket.send(&datagram).await?;
        }

        if self.accepted && now.duration_since(self.last_heartbeat) >= HEARTBEAT_INTERVAL {
            self.socket.send(&Frame::Heartbeat.encode()?).await?;
            self.last_heartbeat = now;
        }
        Ok(())
    }
}
