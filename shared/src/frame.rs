//! Datagram framing shared by the server transport and the client.

use crate::channel::DeliveryMethod;
use crate::MAX_FRAGMENT_PAYLOAD;
use serde::{Deserialize, Serialize};

/// One UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Opens a connection. `payload` is an encoded `ConnectionRequest`.
    Connect { payload: Vec<u8> },
    /// Transport-level accept; authentication may still be pending.
    Accepted { peer_id: u32 },
    /// Connection refused. Carries no reason.
    Rejected,
    Data {
        channel: u8,
        delivery: DeliveryMethod,
        sequence: u32,
        payload: Vec<u8>,
    },
    /// One piece of a reliable-ordered message too large for a single
    /// datagram. Pieces take consecutive sequences on the channel's
    /// reliable-ordered stream; the last one has `more` unset.
    Fragment {
        channel: u8,
        sequence: u32,
        more: bool,
        payload: Vec<u8>,
    },
    Ack {
        channel: u8,
        delivery: DeliveryMethod,
        sequence: u32,
    },
    Heartbeat,
    Disconnect,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Reliable data frames must be acknowledged by the receiver.
    pub fn needs_ack(&self) -> bool {
        match self {
            Frame::Data { delivery, .. } => delivery.is_reliable(),
            Frame::Fragment { .. } => true,
            _ => false,
        }
    }

    /// The ack a receiver sends back for this frame, if it needs one.
    pub fn ack(&self) -> Option<Frame> {
        if !self.needs_ack() {
            return None;
        }
        match self {
            Frame::Data {
                channel,
                delivery,
                sequence,
                ..
            } => Some(Frame::Ack {
                channel: *channel,
                delivery: *delivery,
                sequence: *sequence,
            }),
            Frame::Fragment {
                channel, sequence, ..
            } => Some(Frame::Ack {
                channel: *channel,
                delivery: DeliveryMethod::ReliableOrdered,
                sequence: *sequence,
            }),
            _ => None,
        }
    }
}

/// Splits a payload into fragment-sized pieces, each paired with its `more`
/// flag.
pub fn split_payload(payload: &[u8]) -> Vec<(&[u8], bool)> {
    let count = payload.len().div_ceil(MAX_FRAGMENT_PAYLOAD);
    payload
        .chunks(MAX_FRAGMENT_PAYLOAD)
        .enumerate()
        .map(|(index, piece)| (piece, index + 1 < count))
        .collect()
}
