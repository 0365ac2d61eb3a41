//! Tunnel pools: the per-destination set of live tunnels.

use std::collections::HashMap;

use tokio::sync::mpsc;

use garliccraft_core::{now_ms, Hash, TunnelId};

use crate::tunnel::{Tunnel, TunnelState};

pub type PoolId = u32;

/// Notifications a pool owner reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// The inbound set changed; the owner's LeaseSet must be republished.
    InboundChanged,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub inbound_count: usize,
    pub outbound_count: usize,
    pub length: usize,
    /// Restrict hop selection to these peers when set.
    pub explicit_peers: Option<Vec<Hash>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            inbound_count: 5,
            outbound_count: 5,
            length: 3,
            explicit_peers: None,
        }
    }
}

/// A pool owns its tunnels outright; registry maps only index into it.
pub struct TunnelPool {
    pub id: PoolId,
    pub config: PoolConfig,
    tunnels: HashMap<TunnelId, Tunnel>,
    pub events: mpsc::Sender<PoolEvent>,
}

impl TunnelPool {
    pub fn new(id: PoolId, config: PoolConfig, events: mpsc::Sender<PoolEvent>) -> Self {
        Self {
            id,
            config,
            tunnels: HashMap::new(),
            events,
        }
    }

    pub fn insert(&mut self, tunnel: Tunnel) {
        self.tunnels.insert(tunnel.id, tunnel);
    }

    pub fn get(&self, id: &TunnelId) -> Option<&Tunnel> {
        self.tunnels.get(id)
    }

    pub fn get_mut(&mut self, id: &TunnelId) -> Option<&mut Tunnel> {
        self.tunnels.get_mut(id)
    }

    pub fn remove(&mut self, id: &TunnelId) -> Option<Tunnel> {
        self.tunnels.remove(id)
    }

    pub fn tunnels(&self) -> impl Iterator<Item = &Tunnel> {
        self.tunnels.values()
    }

    /// Established, non-expired tunnels of one direction.
    pub fn established(&self, inbound: bool, now: u64) -> impl Iterator<Item = &Tunnel> {
        self.tunnels
            .values()
            .filter(move |t| t.is_inbound == inbound && t.is_established(now))
    }

    /// Healthy tunnels that are not about to expire; the count the
    /// housekeeping compares against the target.
    pub fn healthy_count(&self, inbound: bool, now: u64) -> usize {
        self.established(inbound, now)
            .filter(|t| !t.is_expiring(now))
            .count()
    }

    /// Builds currently in flight for one direction.
    pub fn pending_count(&self, inbound: bool) -> usize {
        self.tunnels
            .values()
            .filter(|t| t.is_inbound == inbound && t.state == TunnelState::PendingBuild)
            .count()
    }

    /// Least-recently-used established outbound tunnel.
    pub fn select_outbound(&mut self, now: u64) -> Option<&mut Tunnel> {
        self.tunnels
            .values_mut()
            .filter(|t| !t.is_inbound && t.is_established(now))
            .min_by_key(|t| t.last_used)
            .map(|t| {
                t.last_used = now_ms();
                t
            })
    }

    /// (gateway, tunnel id, expiry) triples for the owner's LeaseSet.
    pub fn leases(&self, now: u64) -> Vec<(Hash, TunnelId, u64)> {
        self.established(true, now)
            .map(|t| {
                let (gateway, gateway_id) = t.gateway();
                (
                    gateway,
                    gateway_id,
                    t.created_at + crate::tunnel::TUNNEL_LIFETIME_MS,
                )
            })
            .collect()
    }

    /// Drop dead tunnels; true when the inbound set changed.
    pub fn sweep(&mut self, now: u64) -> bool {
        let mut inbound_changed = false;
        self.tunnels.retain(|_, tunnel| {
            tunnel.tick_state(now);
            let keep = !matches!(tunnel.state, TunnelState::Expired | TunnelState::Failed);
            if !keep && tunnel.is_inbound {
                inbound_changed = true;
            }
            keep
        });
        inbound_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelHop;

    fn make_tunnel(id: TunnelId, inbound: bool, state: TunnelState) -> Tunnel {
        let hops = vec![TunnelHop::generate(Hash::digest(&id.to_be_bytes()))];
        let mut tunnel = Tunnel::new(hops, inbound, id);
        tunnel.state = state;
        tunnel
    }

    fn make_pool() -> TunnelPool {
        let (tx, _rx) = mpsc::channel(8);
        TunnelPool::new(1, PoolConfig::default(), tx)
    }

    #[test]
    fn test_healthy_count_ignores_pending_and_expiring() {
        let mut pool = make_pool();
        pool.insert(make_tunnel(1, true, TunnelState::Established));
        pool.insert(make_tunnel(2, true, TunnelState::PendingBuild));
        pool.insert(make_tunnel(3, false, TunnelState::Established));

        let now = now_ms();
        assert_eq!(pool.healthy_count(true, now), 1);
        assert_eq!(pool.healthy_count(false, now), 1);
        assert_eq!(pool.pending_count(true), 1);
    }

    #[test]
    fn test_lru_outbound_selection() {
        let mut pool = make_pool();
        let mut a = make_tunnel(1, false, TunnelState::Established);
        a.last_used = 100;
        let mut b = make_tunnel(2, false, TunnelState::Established);
        b.last_used = 50;
        pool.insert(a);
        pool.insert(b);

        let now = now_ms();
        // least-recently-used first, and selection refreshes last_used
        assert_eq!(pool.select_outbound(now).unwrap().id, 2);
        assert_eq!(pool.select_outbound(now).unwrap().id, 1);
    }

    #[test]
    fn test_sweep_reports_inbound_change() {
        let mut pool = make_pool();
        let mut dead = make_tunnel(1, true, TunnelState::Established);
        dead.created_at = 0; // long expired
        pool.insert(dead);
        pool.insert(make_tunnel(2, false, TunnelState::Established));

        assert!(pool.sweep(now_ms()));
        assert_eq!(pool.tunnels().count(), 1);
        assert!(!pool.sweep(now_ms()));
    }

    #[test]
    fn test_leases_only_from_established_inbound() {
        let mut pool = make_pool();
        pool.insert(make_tunnel(1, true, TunnelState::Established));
        pool.insert(make_tunnel(2, true, TunnelState::PendingBuild));
        pool.insert(make_tunnel(3, false, TunnelState::Established));
        assert_eq!(pool.leases(now_ms()).len(), 1);
    }
}
