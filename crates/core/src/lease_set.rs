//! LeaseSet: a destination's current inbound-tunnel advertisement.

use crate::identity::{Destination, PrivateKeys, RouterIdentity};
use crate::{now_ms, CoreError, Hash, Result, TunnelId};

/// Leases per set, bounded by the wire format.
pub const MAX_LEASES: usize = 16;

/// All leases expire within this horizon of publication.
pub const MAX_LEASE_LIFETIME_MS: u64 = 10 * 60 * 1000;

const ENC_KEY_SIZE: usize = 256;
const UNUSED_SIGNING_KEY_SIZE: usize = 256;
const LEASE_SIZE: usize = 32 + 4 + 8;

/// One inbound tunnel advertisement: reach the destination by sending a
/// TunnelGateway message for `tunnel_id` to `tunnel_gateway`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub tunnel_gateway: Hash,
    pub tunnel_id: TunnelId,
    pub end_date: u64,
}

impl Lease {
    pub fn is_expired(&self, now: u64) -> bool {
        self.end_date <= now
    }
}

/// A destination's signed set of leases plus its encryption key.
#[derive(Debug, Clone)]
pub struct LeaseSet {
    destination: Destination,
    encryption_key: [u8; ENC_KEY_SIZE],
    leases: Vec<Lease>,
    signature: Vec<u8>,
}

impl LeaseSet {
    pub fn new(
        destination: Destination,
        encryption_key: [u8; ENC_KEY_SIZE],
        leases: Vec<Lease>,
    ) -> Result<Self> {
        if leases.is_empty() || leases.len() > MAX_LEASES {
            return Err(CoreError::Malformed("lease count out of range"));
        }
        Ok(Self {
            destination,
            encryption_key,
            leases,
            signature: Vec::new(),
        })
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn hash(&self) -> Hash {
        self.destination.hash()
    }

    pub fn encryption_key(&self) -> &[u8; ENC_KEY_SIZE] {
        &self.encryption_key
    }

    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    pub fn non_expired_leases(&self, now: u64) -> impl Iterator<Item = &Lease> {
        self.leases.iter().filter(move |l| !l.is_expired(now))
    }

    /// A set with no live leases cannot route anything and must be purged.
    pub fn is_unusable(&self, now: u64) -> bool {
        self.leases.iter().all(|l| l.is_expired(now))
    }

    /// Latest expiration across leases; the set's own lifetime.
    pub fn expires_at(&self) -> u64 {
        self.leases.iter().map(|l| l.end_date).max().unwrap_or(0)
    }

    fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.destination.to_bytes());
        out.extend_from_slice(&self.encryption_key);
        out.extend_from_slice(&[0u8; UNUSED_SIGNING_KEY_SIZE]);
        out.push(self.leases.len() as u8);
        for lease in &self.leases {
            out.extend_from_slice(lease.tunnel_gateway.as_bytes());
            out.extend_from_slice(&lease.tunnel_id.to_be_bytes());
            out.extend_from_slice(&lease.end_date.to_be_bytes());
        }
        out
    }

    pub fn sign(&mut self, keys: &PrivateKeys) -> Result<()> {
        if keys.hash() != self.hash() {
            return Err(CoreError::AuthFailed("signing with foreign keys"));
        }
        self.signature = keys.sign(&self.signable_bytes());
        Ok(())
    }

    /// Verify the destination's signature and the lease-lifetime invariant.
    pub fn verify(&self) -> Result<()> {
        self.destination
            .verify(&self.signable_bytes(), &self.signature)?;
        let horizon = now_ms() + MAX_LEASE_LIFETIME_MS;
        if self.leases.iter().any(|l| l.end_date > horizon) {
            return Err(CoreError::Malformed("lease beyond lifetime horizon"));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.signable_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let (destination, mut offset) = RouterIdentity::from_bytes(buf)?;
        if buf.len() < offset + ENC_KEY_SIZE + UNUSED_SIGNING_KEY_SIZE + 1 {
            return Err(CoreError::Malformed("lease set truncated"));
        }
        let mut encryption_key = [0u8; ENC_KEY_SIZE];
        encryption_key.copy_from_slice(&buf[offset..offset + ENC_KEY_SIZE]);
        offset += ENC_KEY_SIZE + UNUSED_SIGNING_KEY_SIZE;

        let num_leases = buf[offset] as usize;
        offset += 1;
        if num_leases == 0 || num_leases > MAX_LEASES {
            return Err(CoreError::Malformed("lease count out of range"));
        }
        if buf.len() < offset + num_leases * LEASE_SIZE {
            return Err(CoreError::Malformed("lease set truncated"));
        }
        let mut leases = Vec::with_capacity(num_leases);
        for _ in 0..num_leases {
            let gateway = Hash::from_slice(&buf[offset..offset + 32]).expect("fixed slice");
            let tunnel_id =
                u32::from_be_bytes(buf[offset + 32..offset + 36].try_into().expect("fixed"));
            let end_date =
                u64::from_be_bytes(buf[offset + 36..offset + 44].try_into().expect("fixed"));
            leases.push(Lease {
                tunnel_gateway: gateway,
                tunnel_id,
                end_date,
            });
            offset += LEASE_SIZE;
        }

        let sig_len = destination.signing_key().sig_type().sig_len();
        if buf.len() < offset + sig_len {
            return Err(CoreError::Malformed("lease set signature truncated"));
        }
        let signature = buf[offset..offset + sig_len].to_vec();

        Ok(Self {
            destination,
            encryption_key,
            leases,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garliccraft_crypto::SigType;

    fn make_lease_set(end_offset_ms: i64) -> (PrivateKeys, LeaseSet) {
        let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
        let end_date = (now_ms() as i64 + end_offset_ms) as u64;
        let mut ls = LeaseSet::new(
            keys.identity().clone(),
            *keys.identity().public_key(),
            vec![
                Lease {
                    tunnel_gateway: Hash::digest(b"gw1"),
                    tunnel_id: 111,
                    end_date,
                },
                Lease {
                    tunnel_gateway: Hash::digest(b"gw2"),
                    tunnel_id: 222,
                    end_date,
                },
            ],
        )
        .unwrap();
        ls.sign(&keys).unwrap();
        (keys, ls)
    }

    #[test]
    fn test_roundtrip_and_verify() {
        let (_, ls) = make_lease_set(5 * 60 * 1000);
        let decoded = LeaseSet::from_bytes(&ls.to_bytes()).unwrap();
        assert!(decoded.verify().is_ok());
        assert_eq!(decoded.hash(), ls.hash());
        assert_eq!(decoded.leases(), ls.leases());
    }

    #[test]
    fn test_expired_set_is_unusable() {
        let (_, ls) = make_lease_set(-1000);
        assert!(ls.is_unusable(now_ms()));
        assert_eq!(ls.non_expired_leases(now_ms()).count(), 0);
    }

    #[test]
    fn test_live_set_is_usable() {
        let (_, ls) = make_lease_set(60_000);
        assert!(!ls.is_unusable(now_ms()));
        assert_eq!(ls.non_expired_leases(now_ms()).count(), 2);
    }

    #[test]
    fn test_far_future_lease_rejected() {
        let (_, ls) = make_lease_set(20 * 60 * 1000);
        assert!(ls.verify().is_err());
    }

    #[test]
    fn test_zero_leases_rejected() {
        let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
        assert!(LeaseSet::new(
            keys.identity().clone(),
            *keys.identity().public_key(),
            vec![]
        )
        .is_err());
    }

    #[test]
    fn test_tampered_lease_fails_verify() {
        let (_, ls) = make_lease_set(60_000);
        let mut bytes = ls.to_bytes();
        let lease_region = bytes.len() - 50;
        bytes[lease_region] ^= 0x01;
        if let Ok(decoded) = LeaseSet::from_bytes(&bytes) {
            assert!(decoded.verify().is_err());
        }
    }
}
