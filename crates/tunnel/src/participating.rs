//! Tunnels we relay for other routers.

use std::collections::HashMap;

use garliccraft_core::{now_ms, Hash, TunnelId};

use crate::tunnel::TUNNEL_LIFETIME_MS;

/// What role this router plays in someone else's tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitRole {
    /// Middle hop: transform and pass along.
    Participant,
    /// First hop of an inbound tunnel: wrap TunnelGateway payloads into
    /// frames.
    InboundGateway,
    /// Last hop of an outbound tunnel: parse frames and dispatch fragments.
    OutboundEndpoint,
}

/// One entry in the transit table.
#[derive(Clone)]
pub struct ParticipatingTunnel {
    pub recv_tunnel_id: TunnelId,
    pub next_hop: Hash,
    pub next_tunnel_id: TunnelId,
    pub layer_key: [u8; 32],
    pub iv_key: [u8; 32],
    pub role: TransitRole,
    pub expires_at: u64,
    pub bytes_relayed: u64,
}

/// Transit tunnels keyed by the id we receive on. No renewal: entries die
/// ten minutes after acceptance.
pub struct ParticipatingTable {
    entries: HashMap<TunnelId, ParticipatingTunnel>,
    max_entries: usize,
}

impl ParticipatingTable {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a new build should be refused for capacity.
    pub fn at_capacity(&self) -> bool {
        self.entries.len() >= self.max_entries
    }

    pub fn insert(
        &mut self,
        recv_tunnel_id: TunnelId,
        next_hop: Hash,
        next_tunnel_id: TunnelId,
        layer_key: [u8; 32],
        iv_key: [u8; 32],
        role: TransitRole,
    ) -> bool {
        if self.at_capacity() || self.entries.contains_key(&recv_tunnel_id) {
            return false;
        }
        self.entries.insert(
            recv_tunnel_id,
            ParticipatingTunnel {
                recv_tunnel_id,
                next_hop,
                next_tunnel_id,
                layer_key,
                iv_key,
                role,
                expires_at: now_ms() + TUNNEL_LIFETIME_MS,
                bytes_relayed: 0,
            },
        );
        true
    }

    pub fn get(&self, tunnel_id: &TunnelId) -> Option<&ParticipatingTunnel> {
        self.entries.get(tunnel_id)
    }

    pub fn record_relayed(&mut self, tunnel_id: &TunnelId, bytes: u64) {
        if let Some(entry) = self.entries.get_mut(tunnel_id) {
            entry.bytes_relayed += bytes;
        }
    }

    /// Drop expired entries; returns how many were evicted.
    pub fn expire(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }
}
