//! Tunnel records: the hops we chose and the lifecycle of the built tunnel.

use garliccraft_core::{now_ms, Hash, TunnelId};
use garliccraft_crypto::{rand_bytes, rand_u32_nonzero, tunnel_decrypt, TUNNEL_DATA_SIZE};

/// A tunnel lives ten minutes from creation.
pub const TUNNEL_LIFETIME_MS: u64 = 10 * 60 * 1000;

/// Replacement builds start this long before expiry.
pub const TUNNEL_EXPIRING_THRESHOLD_MS: u64 = 60 * 1000;

/// One hop's key material, generated by the tunnel creator.
#[derive(Clone)]
pub struct TunnelHop {
    pub ident: Hash,
    pub layer_key: [u8; 32],
    pub iv_key: [u8; 32],
    pub reply_key: [u8; 32],
    pub reply_iv: [u8; 16],
    /// Tunnel id this hop receives on.
    pub recv_tunnel_id: TunnelId,
    /// Tunnel id this hop forwards to.
    pub next_tunnel_id: TunnelId,
}

impl TunnelHop {
    pub fn generate(ident: Hash) -> Self {
        let mut layer_key = [0u8; 32];
        let mut iv_key = [0u8; 32];
        let mut reply_key = [0u8; 32];
        let mut reply_iv = [0u8; 16];
        rand_bytes(&mut layer_key);
        rand_bytes(&mut iv_key);
        rand_bytes(&mut reply_key);
        rand_bytes(&mut reply_iv);
        Self {
            ident,
            layer_key,
            iv_key,
            reply_key,
            reply_iv,
            recv_tunnel_id: rand_u32_nonzero(),
            next_tunnel_id: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    PendingBuild,
    Established,
    Expiring,
    Failed,
    Expired,
}

/// A tunnel we built. Outbound: we are the gateway and the last hop
/// delivers per-fragment. Inbound: the first hop is the advertised gateway
/// and the frames come home to us.
pub struct Tunnel {
    /// For inbound tunnels, the id we receive frames on; for outbound, the
    /// first hop's receive id.
    pub id: TunnelId,
    pub hops: Vec<TunnelHop>,
    pub is_inbound: bool,
    pub state: TunnelState,
    pub created_at: u64,
    pub last_used: u64,
}

impl Tunnel {
    pub fn new(hops: Vec<TunnelHop>, is_inbound: bool, id: TunnelId) -> Self {
        Self {
            id,
            hops,
            is_inbound,
            state: TunnelState::PendingBuild,
            created_at: now_ms(),
            last_used: now_ms(),
        }
    }

    /// The (gateway hash, gateway tunnel id) peers use to reach an inbound
    /// tunnel; what goes into a Lease.
    pub fn gateway(&self) -> (Hash, TunnelId) {
        debug_assert!(self.is_inbound);
        let first = &self.hops[0];
        (first.ident, first.recv_tunnel_id)
    }

    /// First hop of an outbound tunnel: where we send TunnelData.
    pub fn first_hop(&self) -> (Hash, TunnelId) {
        let first = &self.hops[0];
        (first.ident, first.recv_tunnel_id)
    }

    pub fn is_established(&self, now: u64) -> bool {
        self.state == TunnelState::Established && !self.is_expired(now)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.created_at + TUNNEL_LIFETIME_MS
    }

    pub fn is_expiring(&self, now: u64) -> bool {
        now + TUNNEL_EXPIRING_THRESHOLD_MS >= self.created_at + TUNNEL_LIFETIME_MS
    }

    /// Refresh lifecycle state against the clock.
    pub fn tick_state(&mut self, now: u64) {
        if self.state == TunnelState::Established || self.state == TunnelState::Expiring {
            if self.is_expired(now) {
                self.state = TunnelState::Expired;
            } else if self.is_expiring(now) {
                self.state = TunnelState::Expiring;
            }
        }
    }

    /// Remove (outbound: pre-apply) every hop's layer from a frame.
    ///
    /// Outbound gateways run this before sending so each hop's encryption
    /// cancels one layer; inbound endpoints run it on arrival to peel what
    /// the hops added.
    pub fn apply_layers(&self, frame: &mut [u8; TUNNEL_DATA_SIZE]) {
        for hop in self.hops.iter().rev() {
            tunnel_decrypt(frame, &hop.layer_key, &hop.iv_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garliccraft_crypto::tunnel_encrypt;

    fn make_tunnel(n: usize, inbound: bool) -> Tunnel {
        let hops = (0..n)
            .map(|i| TunnelHop::generate(Hash::digest(&[i as u8])))
            .collect();
        let mut tunnel = Tunnel::new(hops, inbound, 42);
        tunnel.state = TunnelState::Established;
        tunnel
    }

    #[test]
    fn test_layers_cancel_hop_encryption() {
        let tunnel = make_tunnel(3, false);
        let mut frame = [0u8; TUNNEL_DATA_SIZE];
        garliccraft_crypto::rand_bytes(&mut frame);
        let plaintext = frame;

        // gateway pre-applies, then each hop encrypts in path order
        tunnel.apply_layers(&mut frame);
        for hop in &tunnel.hops {
            tunnel_encrypt(&mut frame, &hop.layer_key, &hop.iv_key);
        }
        assert_eq!(frame[..], plaintext[..]);
    }

    #[test]
    fn test_inbound_peeling() {
        let tunnel = make_tunnel(2, true);
        let mut frame = [0u8; TUNNEL_DATA_SIZE];
        garliccraft_crypto::rand_bytes(&mut frame);
        let plaintext = frame;

        // hops encrypt toward us in path order; we peel on arrival
        for hop in &tunnel.hops {
            tunnel_encrypt(&mut frame, &hop.layer_key, &hop.iv_key);
        }
        tunnel.apply_layers(&mut frame);
        assert_eq!(frame[..], plaintext[..]);
    }

    #[test]
    fn test_lifecycle_states() {
        let mut tunnel = make_tunnel(1, false);
        let now = tunnel.created_at;
        assert!(tunnel.is_established(now));
        assert!(!tunnel.is_expiring(now));

        tunnel.tick_state(now + TUNNEL_LIFETIME_MS - 30_000);
        assert_eq!(tunnel.state, TunnelState::Expiring);
        assert!(tunnel.is_established(now + TUNNEL_LIFETIME_MS - 30_000));

        tunnel.tick_state(now + TUNNEL_LIFETIME_MS + 1);
        assert_eq!(tunnel.state, TunnelState::Expired);
    }
}
