//! Outbound side of the relay: validated sends, fan-out with lossy
//! backpressure, and per-sender movement throttling.

use crate::config::ReductionConfig;
use crate::error::TransportError;
use crate::stats::Statistics;
use crate::transport::{PeerId, Transport};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, trace};
use serde::Serialize;
use shared::{Channel, DeliveryMethod};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Refuses payloads that must never reach the transport.
pub fn check_validated(payload: &[u8]) -> Result<(), TransportError> {
    if payload.is_empty() {
        return Err(TransportError::EmptyPayload);
    }
    Ok(())
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Lossy sends dropped because the target's queue was full.
    pub skipped: usize,
    pub failed: usize,
}

pub struct RelayEngine {
    transport: Arc<dyn Transport>,
    stats: Arc<Statistics>,
    max_queue_depth: usize,
}

impl RelayEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        stats: Arc<Statistics>,
        max_queue_depth: usize,
    ) -> Self {
        Self {
            transport,
            stats,
            max_queue_depth,
        }
    }

    pub fn send_to(
        &self,
        peer: PeerId,
        channel: Channel,
        delivery: DeliveryMethod,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        check_validated(payload)?;
        self.write(peer, channel, delivery, payload)
    }

    pub fn send_message<T: Serialize>(
        &self,
        peer: PeerId,
        channel: Channel,
        delivery: DeliveryMethod,
        message: &T,
    ) -> Result<(), TransportError> {
        let payload = bincode::serialize(message)?;
        self.send_to(peer, channel, delivery, &payload)
    }

    /// Sends `payload` to every target except `sender`.
    ///
    /// Sequenced and unreliable sends to a target whose queue for the stream
    /// already holds `max_queue_depth` frames are skipped; newer state will
    /// follow. Reliable sends are never skipped.
    pub fn broadcast_to_clients(
        &self,
        channel: Channel,
        sender: Option<PeerId>,
        targets: &[PeerId],
        delivery: DeliveryMethod,
        payload: &[u8],
    ) -> Result<BroadcastReport, TransportError> {
        check_validated(payload)?;

        let (wire_channel, wire_delivery) = wire_stream(channel, delivery);
        let mut report = BroadcastReport::default();
        for &target in targets {
            if Some(target) == sender {
                continue;
            }
            if delivery.is_lossy() {
                let depth = self.transport.queue_depth(target, wire_channel, wire_delivery);
                if depth >= self.max_queue_depth {
                    trace!(
                        "Skipping {} to peer {}: queue depth {} at limit",
                        channel,
                        target,
                        depth
                    );
                    report.skipped += 1;
                    continue;
                }
            }

            match self.write(target, channel, delivery, payload) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!("Broadcast of {} to peer {} failed: {}", channel, target, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    pub fn broadcast_message<T: Serialize>(
        &self,
        channel: Channel,
        sender: Option<PeerId>,
        targets: &[PeerId],
        delivery: DeliveryMethod,
        message: &T,
    ) -> Result<BroadcastReport, TransportError> {
        let payload = bincode::serialize(message)?;
        self.broadcast_to_clients(channel, sender, targets, delivery, &payload)
    }

    /// Unreliable traffic travels on the fall channel behind a one-byte
    /// redirect to its real channel.
    fn write(
        &self,
        peer: PeerId,
        channel: Channel,
        delivery: DeliveryMethod,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if delivery == DeliveryMethod::Unreliable && channel != Channel::Fall {
            let mut tunneled = Vec::with_capacity(payload.len() + 1);
            tunneled.push(channel.id());
            tunneled.extend_from_slice(payload);
            self.transport
                .send(peer, &tunneled, Channel::Fall.id(), DeliveryMethod::Unreliable)?;
        } else {
            self.transport.send(peer, payload, channel.id(), delivery)?;
        }
        self.stats.record_outbound(channel.id(), payload.len());
        Ok(())
    }
}

fn wire_stream(channel: Channel, delivery: DeliveryMethod) -> (u8, DeliveryMethod) {
    if delivery == DeliveryMethod::Unreliable {
        (Channel::Fall.id(), DeliveryMethod::Unreliable)
    } else {
        (channel.id(), delivery)
    }
}

/// Drops movement updates from a sender that arrive faster than
/// `min_interval`.
#[derive(Debug)]
pub struct ReductionSystem {
    enabled: bool,
    min_interval: Duration,
    last_forwarded: DashMap<PeerId, Instant>,
}

impl ReductionSystem {
    pub fn from_config(config: &ReductionConfig) -> Self {
        Self {
            enabled: config.enabled,
            min_interval: Duration::from_millis(config.min_interval_ms),
            last_forwarded: DashMap::new(),
        }
    }

    pub fn should_forward(&self, peer: PeerId) -> bool {
        if !self.enabled {
            return true;
        }
        let now = Instant::now();
        match self.last_forwarded.entry(peer) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) < self.min_interval {
                    return false;
                }
                last.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    pub fn remove_player(&self, peer: PeerId) {
        self.last_forwarded.remove(&peer);
    }
}
