//! Per-channel traffic counters.

use log::info;
use shared::messages::{ChannelCounter, StatisticsSnapshot};
use shared::MAX_CHANNELS;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
struct Counter {
    bytes: AtomicU64,
    messages: AtomicU64,
}

impl Counter {
    fn record(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    fn load(&self, channel: u8) -> ChannelCounter {
        ChannelCounter {
            channel,
            bytes: self.bytes.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
        }
    }
}

/// Counts are only taken while enabled; they are approximate under
/// concurrent updates.
#[derive(Debug)]
pub struct Statistics {
    enabled: AtomicBool,
    inbound: Vec<Counter>,
    outbound: Vec<Counter>,
}

impl Statistics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            inbound: (0..MAX_CHANNELS).map(|_| Counter::default()).collect(),
            outbound: (0..MAX_CHANNELS).map(|_| Counter::default()).collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::Relaxed) != enabled {
            info!("Statistics {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn record_inbound(&self, channel: u8, bytes: usize) {
        if self.is_enabled() {
            if let Some(counter) = self.inbound.get(channel as usize) {
                counter.record(bytes);
            }
        }
    }

    pub fn record_outbound(&self, channel: u8, bytes: usize) {
        if self.is_enabled() {
            if let Some(counter) = self.outbound.get(channel as usize) {
                counter.record(bytes);
            }
        }
    }

    /// Counters for every channel that has seen traffic.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            enabled: self.is_enabled(),
            inbound: collect(&self.inbound),
            outbound: collect(&self.outbound),
        }
    }
}

fn collect(counters: &[Counter]) -> Vec<ChannelCounter> {
    counters
        .iter()
        .enumerate()
        .map(|(channel, counter)| counter.load(channel as u8))
        .filter(|counter| counter.messages > 0)
        .collect()
}
