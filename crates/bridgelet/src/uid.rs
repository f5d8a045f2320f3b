//! Namespaced monotonic identifiers.
//!
//! Each namespace counts independently from 1. Values are never reused, even
//! after the entity that held them is gone.

use dashmap::DashMap;

pub const BRIDGE_NAMESPACE: &str = "bridge";
pub const CHANNEL_NAMESPACE: &str = "channel";

/// Process-wide counter shared by `Arc` between the listener and its sessions.
#[derive(Debug, Default)]
pub struct UidAllocator {
    counters: DashMap<String, u64>,
}

impl UidAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, namespace: &str) -> u64 {
        // Fast path avoids allocating the key once the namespace exists.
        if let Some(mut counter) = self.counters.get_mut(namespace) {
            *counter += 1;
            return *counter;
        }
        let mut counter = self.counters.entry(namespace.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn next_bridge(&self) -> BridgeId {
        BridgeId(self.next(BRIDGE_NAMESPACE))
    }

    pub fn next_channel(&self) -> ChannelId {
        ChannelId(self.next(CHANNEL_NAMESPACE))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BridgeId(u64);

impl BridgeId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BridgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
