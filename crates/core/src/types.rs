//! Primitive datatypes shared across the router.

use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::GeneralPurpose;
use base64::engine::GeneralPurposeConfig;
use base64::{alphabet::Alphabet, Engine};
use sha2::{Digest, Sha256};

/// The I2P base64 alphabet: standard with `+` → `-` and `/` → `~`, so hashes
/// are filesystem-safe.
const I2P_B64_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~";

fn i2p_b64() -> &'static GeneralPurpose {
    static ENGINE: OnceLock<GeneralPurpose> = OnceLock::new();
    ENGINE.get_or_init(|| {
        let alphabet = Alphabet::new(I2P_B64_ALPHABET).expect("valid alphabet");
        GeneralPurpose::new(&alphabet, GeneralPurposeConfig::new())
    })
}

pub fn i2p_base64_encode(data: &[u8]) -> String {
    i2p_b64().encode(data)
}

pub fn i2p_base64_decode(s: &str) -> Option<Vec<u8>> {
    i2p_b64().decode(s).ok()
}

/// The SHA-256 hash of some data: ident hash, tunnel-key index, session-tag
/// key, and (after XOR) Kademlia routing distance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_bytes(buf: &[u8; 32]) -> Self {
        Hash(*buf)
    }

    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        buf.try_into().ok().map(Hash)
    }

    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// XOR distance to `other`, comparable lexicographically.
    pub fn xor_distance(&self, other: &Hash) -> [u8; 32] {
        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        i2p_base64_encode(&self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // abbreviated ident, enough to correlate log lines
        write!(f, "{}", &self.to_base64()[..8])
    }
}

/// Identifier unique to each router in a tunnel. Zero is reserved.
pub type TunnelId = u32;

/// A 32-byte one-time identifier that replaces ElGamal for subsequent garlic
/// messages within a session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionTag(pub [u8; 32]);

impl SessionTag {
    pub fn random() -> Self {
        let mut buf = [0u8; 32];
        garliccraft_crypto::rand_bytes(&mut buf);
        SessionTag(buf)
    }

    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        buf.try_into().ok().map(SessionTag)
    }
}

impl fmt::Debug for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionTag({})", &i2p_base64_encode(&self.0)[..8])
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_matches_sha256() {
        let h = Hash::digest(b"abc");
        assert_eq!(
            hex::encode(h.0),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_xor_distance_symmetric() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), [0u8; 32]);
    }

    #[test]
    fn test_i2p_base64_alphabet() {
        // 0xFF bytes produce the substituted characters
        let encoded = i2p_base64_encode(&[0xFF, 0xFF, 0xFF]);
        assert_eq!(encoded, "~~~~");
        assert_eq!(i2p_base64_decode("~~~~").unwrap(), vec![0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_base64_roundtrip() {
        let h = Hash::digest(b"roundtrip");
        let s = h.to_base64();
        assert_eq!(i2p_base64_decode(&s).unwrap(), h.0.to_vec());
    }

    #[test]
    fn test_session_tag_random_unique() {
        assert_ne!(SessionTag::random().0, SessionTag::random().0);
    }
}
