use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::sim::SimRandom;
use crate::types::{Identity, MessageKind};

/// Drops messages of the given kinds from the given senders.
///
/// Empty `senders` or `kinds` match everything.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageFilter {
    pub senders: BTreeSet<Identity>,
    pub kinds: BTreeSet<MessageKind>,
    pub probability: f64,
}

impl MessageFilter {
    fn matches(&self, from: &Identity, kind: MessageKind) -> bool {
        (self.senders.is_empty() || self.senders.contains(from))
            && (self.kinds.is_empty() || self.kinds.contains(&kind))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub sent: u64,
    pub dropped: u64,
}

/// Delivery delays and message loss for a simulated pool.
#[derive(Clone, Debug)]
pub struct SimNetwork {
    min_latency: u64,
    max_latency: u64,
    filters: Vec<MessageFilter>,
    stats: NetworkStats,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl SimNetwork {
    pub fn new(min_latency: u64, max_latency: u64) -> Self {
        Self {
            min_latency,
            max_latency: max_latency.max(min_latency),
            filters: Vec::new(),
            stats: NetworkStats::default(),
        }
    }

    pub fn set_latency(&mut self, min_latency: u64, max_latency: u64) {
        self.min_latency = min_latency;
        self.max_latency = max_latency.max(min_latency);
    }

    pub fn add_filter(&mut self, filter: MessageFilter) {
        self.filters.push(filter);
    }

    /// Always drops `kinds` sent by `senders`.
    pub fn drop_messages(
        &mut self,
        senders: impl IntoIterator<Item = Identity>,
        kinds: impl IntoIterator<Item = MessageKind>,
    ) {
        self.add_filter(MessageFilter {
            senders: senders.into_iter().collect(),
            kinds: kinds.into_iter().collect(),
            probability: 1.0,
        });
    }

    pub fn reset_filters(&mut self) {
        self.filters.clear();
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    /// Returns the delivery delay, or `None` if the message is lost.
    pub fn route(&mut self, from: &Identity, kind: MessageKind, random: &mut SimRandom) -> Option<u64> {
        self.stats.sent += 1;
        for filter in &self.filters {
            if filter.matches(from, kind) && random.chance(filter.probability) {
                self.stats.dropped += 1;
                return None;
            }
        }
        Some(random.integer(self.min_latency, self.max_latency))
    }
}
