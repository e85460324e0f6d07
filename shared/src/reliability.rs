//! Per-channel reliability state for one end of a connection.
//!
//! Sequences are tracked per `(channel, delivery method)` stream, so a stalled
//! reliable stream never holds back a sequenced one on the same channel.

use crate::channel::DeliveryMethod;
use crate::MAX_MESSAGE_SIZE;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

/// Out-of-order frames held per reliable-ordered stream before new ones are dropped.
pub const MAX_REORDER_BUFFER: usize = 1024;

/// Sequences remembered per reliable-unordered stream for duplicate removal.
const DEDUPE_WINDOW: usize = 1024;

pub type StreamKey = (u8, DeliveryMethod);

/// Wrapping comparison: true when `s1` is newer than `s2`.
#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone)]
struct Unacked {
    datagram: Vec<u8>,
    last_sent: Instant,
    attempts: u32,
}

/// Result of a resend sweep.
#[derive(Debug, Default)]
pub struct ResendSweep {
    pub datagrams: Vec<Vec<u8>>,
    /// A frame ran out of attempts; the connection should be dropped.
    pub exhausted: bool,
}

/// Outbound sequencing and acknowledgement tracking.
#[derive(Debug, Default)]
pub struct SendChannels {
    next: HashMap<StreamKey, u32>,
    unacked: HashMap<StreamKey, HashMap<u32, Unacked>>,
}

impl SendChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_sequence(&mut self, channel: u8, delivery: DeliveryMethod) -> u32 {
        let counter = self.next.entry((channel, delivery)).or_insert(0);
        let sequence = *counter;
        *counter = counter.wrapping_add(1);
        sequence
    }

    /// Keeps a reliable datagram until it is acknowledged.
    pub fn track(
        &mut self,
        channel: u8,
        delivery: DeliveryMethod,
        sequence: u32,
        datagram: Vec<u8>,
        now: Instant,
    ) {
        if !delivery.is_reliable() {
            return;
        }
        self.unacked.entry((channel, delivery)).or_default().insert(
            sequence,
            Unacked {
                datagram,
                last_sent: now,
                attempts: 1,
            },
        );
    }

    /// Returns true if the sequence was outstanding.
    pub fn ack(&mut self, channel: u8, delivery: DeliveryMethod, sequence: u32) -> bool {
        self.unacked
            .get_mut(&(channel, delivery))
            .map(|stream| stream.remove(&sequence).is_some())
            .unwrap_or(false)
    }

    pub fn due_for_resend(
        &mut self,
        now: Instant,
        interval: Duration,
        max_attempts: u32,
    ) -> ResendSweep {
        let mut sweep = ResendSweep::default();
        for stream in self.unacked.values_mut() {
            for pending in stream.values_mut() {
                if now.duration_since(pending.last_sent) < interval {
                    continue;
                }
                if pending.attempts >= max_attempts {
                    sweep.exhausted = true;
                    continue;
                }
                pending.attempts += 1;
                pending.last_sent = now;
                sweep.datagrams.push(pending.datagram.clone());
            }
        }
        sweep
    }

    pub fn pending_count(&self, channel: u8, delivery: DeliveryMethod) -> usize {
        self.unacked
            .get(&(channel, delivery))
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.unacked.values().map(HashMap::len).sum()
    }
}

/// A reliable-ordered frame waiting for its turn. `more` is set on every
/// fragment but the last of a message.
#[derive(Debug)]
struct Piece {
    payload: Vec<u8>,
    more: bool,
}

#[derive(Debug, Default)]
struct OrderedStream {
    expected: u32,
    held: HashMap<u32, Piece>,
    partial: Vec<u8>,
    /// The message being reassembled grew past [`MAX_MESSAGE_SIZE`]; its
    /// remaining pieces are discarded.
    oversized: bool,
}

impl OrderedStream {
    fn receive(&mut self, sequence: u32, piece: Piece) -> Vec<Vec<u8>> {
        if sequence == self.expected {
            let mut ready = Vec::new();
            self.advance(piece, &mut ready);
            while let Some(next) = self.held.remove(&self.expected) {
                self.advance(next, &mut ready);
            }
            ready
        } else {
            if sequence_greater_than(sequence, self.expected)
                && self.held.len() < MAX_REORDER_BUFFER
            {
                self.held.entry(sequence).or_insert(piece);
            }
            Vec::new()
        }
    }

    fn advance(&mut self, piece: Piece, ready: &mut Vec<Vec<u8>>) {
        self.expected = self.expected.wrapping_add(1);

        if !piece.more && self.partial.is_empty() && !self.oversized {
            ready.push(piece.payload);
            return;
        }
        if !self.oversized {
            if self.partial.len() + piece.payload.len() > MAX_MESSAGE_SIZE {
                self.oversized = true;
                self.partial = Vec::new();
            } else {
                self.partial.extend_from_slice(&piece.payload);
            }
        }
        if !piece.more {
            if !self.oversized {
                ready.push(std::mem::take(&mut self.partial));
            }
            self.oversized = false;
        }
    }
}

#[derive(Debug, Default)]
struct UnorderedStream {
    seen: HashSet<u32>,
    order: VecDeque<u32>,
}

/// Inbound ordering, duplicate removal and staleness filtering.
#[derive(Debug, Default)]
pub struct ReceiveChannels {
    ordered: HashMap<u8, OrderedStream>,
    unordered: HashMap<u8, UnorderedStream>,
    sequenced: HashMap<u8, u32>,
}

impl ReceiveChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one data frame in and returns the payloads now deliverable, in
    /// delivery order.
    pub fn receive(
        &mut self,
        channel: u8,
        delivery: DeliveryMethod,
        sequence: u32,
        payload: Vec<u8>,
    ) -> Vec<Vec<u8>> {
        match delivery {
            DeliveryMethod::ReliableOrdered => {
                self.receive_fragment(channel, sequence, false, payload)
            }
            DeliveryMethod::ReliableUnordered => {
                let stream = self.unordered.entry(channel).or_default();
                if !stream.seen.insert(sequence) {
                    return Vec::new();
                }
                stream.order.push_back(sequence);
                if stream.order.len() > DEDUPE_WINDOW {
                    if let Some(oldest) = stream.order.pop_front() {
                        stream.seen.remove(&oldest);
                    }
                }
                vec![payload]
            }
            DeliveryMethod::Sequenced => match self.sequenced.get(&channel) {
                Some(last) if !sequence_greater_than(sequence, *last) => Vec::new(),
                _ => {
                    self.sequenced.insert(channel, sequence);
                    vec![payload]
                }
            },
            DeliveryMethod::Unreliable => vec![payload],
        }
    }

    /// Feeds one piece of a fragmented reliable-ordered message in. Returns
    /// every message the stream can now deliver, reassembled.
    pub fn receive_fragment(
        &mut self,
        channel: u8,
        sequence: u32,
        more: bool,
        payload: Vec<u8>,
    ) -> Vec<Vec<u8>> {
        self.ordered
            .entry(channel)
            .or_default()
            .receive(sequence, Piece { payload, more })
    }
}
