//! Diffie-Hellman over the 2048-bit MODP group, plus the transport
//! session-key derivation rules and the precomputing keypair supplier.

use std::sync::Mutex;

use num_bigint_dig::BigUint;

use crate::elgamal::{encode_padded, group_g, group_p};
use crate::{CryptoError, Result};

/// Byte length of DH public values and shared secrets.
pub const DH_KEY_SIZE: usize = 256;

/// Keypairs kept warm by the supplier to hide modexp latency from handshakes.
pub const DH_PRECOMPUTED_KEYPAIRS: usize = 5;

/// A Diffie-Hellman keypair over the shared 2048-bit group.
#[derive(Clone)]
pub struct DhKeypair {
    pub priv_key: [u8; DH_KEY_SIZE],
    pub pub_key: [u8; DH_KEY_SIZE],
}

impl DhKeypair {
    pub fn generate() -> Self {
        let mut priv_key = [0u8; DH_KEY_SIZE];
        crate::rand_bytes(&mut priv_key);
        let x = BigUint::from_bytes_be(&priv_key);
        let y = group_g().modpow(&x, &group_p());
        let mut pub_key = [0u8; DH_KEY_SIZE];
        pub_key.copy_from_slice(&encode_padded(&y, DH_KEY_SIZE));
        Self { priv_key, pub_key }
    }

    /// Compute the 256-byte shared secret with a peer's public value.
    pub fn agree(&self, peer_pub: &[u8; DH_KEY_SIZE]) -> [u8; DH_KEY_SIZE] {
        let x = BigUint::from_bytes_be(&self.priv_key);
        let y = BigUint::from_bytes_be(peer_pub);
        let s = y.modpow(&x, &group_p());
        let mut shared = [0u8; DH_KEY_SIZE];
        shared.copy_from_slice(&encode_padded(&s, DH_KEY_SIZE));
        shared
    }
}

/// Derive the NTCP session key from a DH shared secret.
///
/// If the high bit of the first byte is set, the key is a zero byte followed
/// by the first 31 secret bytes (the secret is a positive bignum and would
/// otherwise re-encode with a sign byte). Otherwise leading zero bytes are
/// skipped and the first 32 remaining bytes are taken.
pub fn derive_ntcp_session_key(shared: &[u8; DH_KEY_SIZE]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    if shared[0] & 0x80 != 0 {
        key[1..].copy_from_slice(&shared[..31]);
        return Ok(key);
    }
    let offset = shared
        .iter()
        .position(|&b| b != 0)
        .ok_or(CryptoError::WeakSharedSecret)?;
    if offset + 32 > DH_KEY_SIZE {
        return Err(CryptoError::WeakSharedSecret);
    }
    key.copy_from_slice(&shared[offset..offset + 32]);
    Ok(key)
}

/// Derive the SSU (session key, MAC key) pair from a DH shared secret.
///
/// Same leading-byte rules as NTCP; the MAC key is the 32 bytes that follow
/// the session-key material.
pub fn derive_ssu_keys(shared: &[u8; DH_KEY_SIZE]) -> Result<([u8; 32], [u8; 32])> {
    let mut session_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    if shared[0] & 0x80 != 0 {
        session_key[1..].copy_from_slice(&shared[..31]);
        mac_key.copy_from_slice(&shared[31..63]);
        return Ok((session_key, mac_key));
    }
    let offset = shared
        .iter()
        .position(|&b| b != 0)
        .ok_or(CryptoError::WeakSharedSecret)?;
    if offset + 64 > DH_KEY_SIZE {
        return Err(CryptoError::WeakSharedSecret);
    }
    session_key.copy_from_slice(&shared[offset..offset + 32]);
    mac_key.copy_from_slice(&shared[offset + 32..offset + 64]);
    Ok((session_key, mac_key))
}

/// Bounded pool of precomputed DH keypairs.
///
/// A background tokio task refills the pool whenever a handshake drains it,
/// so session establishment never waits on a 2048-bit modexp.
pub struct DhKeypairSupplier {
    pool: Mutex<Vec<DhKeypair>>,
    refill: tokio::sync::Notify,
}

impl DhKeypairSupplier {
    pub fn new() -> std::sync::Arc<Self> {
        let supplier = std::sync::Arc::new(Self {
            pool: Mutex::new(Vec::with_capacity(DH_PRECOMPUTED_KEYPAIRS)),
            refill: tokio::sync::Notify::new(),
        });
        let worker = supplier.clone();
        tokio::spawn(async move {
            loop {
                let needed = {
                    let pool = worker.pool.lock().expect("dh pool lock");
                    DH_PRECOMPUTED_KEYPAIRS.saturating_sub(pool.len())
                };
                if needed == 0 {
                    worker.refill.notified().await;
                    continue;
                }
                // modexp is CPU-bound; keep it off the I/O executor threads
                let fresh = tokio::task::spawn_blocking(DhKeypair::generate).await;
                if let Ok(keypair) = fresh {
                    worker.pool.lock().expect("dh pool lock").push(keypair);
                } else {
                    break;
                }
            }
        });
        supplier
    }

    /// Take a precomputed keypair, or generate inline when the pool is dry.
    pub fn acquire(&self) -> DhKeypair {
        let taken = self.pool.lock().expect("dh pool lock").pop();
        self.refill.notify_one();
        taken.unwrap_or_else(DhKeypair::generate)
    }

    /// Hand an unused keypair back (failed handshake).
    pub fn give_back(&self, keypair: DhKeypair) {
        let mut pool = self.pool.lock().expect("dh pool lock");
        if pool.len() < DH_PRECOMPUTED_KEYPAIRS {
            pool.push(keypair);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_agreement() {
        let alice = DhKeypair::generate();
        let bob = DhKeypair::generate();

        let s1 = alice.agree(&bob.pub_key);
        let s2 = bob.agree(&alice.pub_key);
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_ntcp_key_high_bit() {
        let mut shared = [0xAAu8; DH_KEY_SIZE];
        shared[0] = 0x81;
        let key = derive_ntcp_session_key(&shared).unwrap();
        assert_eq!(key[0], 0);
        assert_eq!(key[1], 0x81);
        assert_eq!(&key[2..], &shared[1..31]);
    }

    #[test]
    fn test_ntcp_key_plain() {
        let mut shared = [0u8; DH_KEY_SIZE];
        for (i, b) in shared.iter_mut().enumerate() {
            *b = (i % 127 + 1) as u8;
        }
        let key = derive_ntcp_session_key(&shared).unwrap();
        assert_eq!(&key[..], &shared[..32]);
    }

    #[test]
    fn test_ntcp_key_skips_leading_zeros() {
        let mut shared = [0x33u8; DH_KEY_SIZE];
        shared[0] = 0;
        shared[1] = 0;
        shared[2] = 0x12;
        let key = derive_ntcp_session_key(&shared).unwrap();
        assert_eq!(key[0], 0x12);
    }

    #[test]
    fn test_ssu_keys_follow_session_key() {
        let mut shared = [0u8; DH_KEY_SIZE];
        for (i, b) in shared.iter_mut().enumerate() {
            *b = (i % 100 + 1) as u8;
        }
        let (session, mac) = derive_ssu_keys(&shared).unwrap();
        assert_eq!(&session[..], &shared[..32]);
        assert_eq!(&mac[..], &shared[32..64]);
    }

    #[test]
    fn test_all_zero_secret_rejected() {
        let shared = [0u8; DH_KEY_SIZE];
        assert!(matches!(
            derive_ntcp_session_key(&shared),
            Err(CryptoError::WeakSharedSecret)
        ));
    }
}
