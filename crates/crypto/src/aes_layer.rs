//! AES-256 layer cryptography
//!
//! ECB single-block operations, CBC mode with explicit IV, and the tunnel
//! double-IV transform: the 16-byte IV at the head of every 1024-byte tunnel
//! frame is ECB-encrypted once to become the CBC IV for the remaining 1008
//! bytes, then ECB-encrypted a second time before transmission so that no
//! two hops see the same IV bytes.

use aes::cipher::{
    generic_array::GenericArray, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut,
    KeyInit, KeyIvInit,
};
use aes::Aes256;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Size of the encrypted portion of a tunnel message (IV + data).
pub const TUNNEL_DATA_SIZE: usize = 1024;

/// AES-256-ECB encrypt a single 16-byte block in place.
pub fn ecb_encrypt_block(key: &[u8; 32], block: &mut [u8; 16]) {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

/// AES-256-ECB decrypt a single 16-byte block in place.
pub fn ecb_decrypt_block(key: &[u8; 32], block: &mut [u8; 16]) {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    cipher.decrypt_block(GenericArray::from_mut_slice(block));
}

/// AES-256-CBC encrypt `data` in place. `data.len()` must be a multiple of 16.
pub fn cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) {
    debug_assert_eq!(data.len() % 16, 0);
    let mut enc = Aes256CbcEnc::new(key.into(), iv.into());
    for block in data.chunks_exact_mut(16) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// AES-256-CBC decrypt `data` in place. `data.len()` must be a multiple of 16.
pub fn cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) {
    debug_assert_eq!(data.len() % 16, 0);
    let mut dec = Aes256CbcDec::new(key.into(), iv.into());
    for block in data.chunks_exact_mut(16) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// Stateful CBC encryptor whose chaining state survives across calls.
///
/// NTCP frames one session-long CBC stream: the last ciphertext block of a
/// frame is the IV of the next. Garlic AES blocks reuse the same shape with
/// a per-message IV.
pub struct CbcEncryptor {
    inner: Aes256CbcEnc,
}

impl CbcEncryptor {
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self {
            inner: Aes256CbcEnc::new(key.into(), iv.into()),
        }
    }

    /// Encrypt in place; `data.len()` must be a multiple of 16.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % 16, 0);
        for block in data.chunks_exact_mut(16) {
            self.inner.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

/// Stateful CBC decryptor, the receive side of [`CbcEncryptor`].
pub struct CbcDecryptor {
    inner: Aes256CbcDec,
}

impl CbcDecryptor {
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self {
            inner: Aes256CbcDec::new(key.into(), iv.into()),
        }
    }

    /// Decrypt in place; `data.len()` must be a multiple of 16.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % 16, 0);
        for block in data.chunks_exact_mut(16) {
            self.inner.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

/// Apply one hop's layer encryption to a 1024-byte tunnel frame.
///
/// Double-IV: the frame IV is ECB-encrypted under `iv_key` to form the CBC
/// IV, the 1008 data bytes are CBC-encrypted under `layer_key`, and the CBC
/// IV is ECB-encrypted again to become the outgoing frame IV.
pub fn tunnel_encrypt(frame: &mut [u8; TUNNEL_DATA_SIZE], layer_key: &[u8; 32], iv_key: &[u8; 32]) {
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&frame[..16]);
    ecb_encrypt_block(iv_key, &mut iv);
    cbc_encrypt(layer_key, &iv, &mut frame[16..]);
    ecb_encrypt_block(iv_key, &mut iv);
    frame[..16].copy_from_slice(&iv);
}

/// Remove one hop's layer encryption from a 1024-byte tunnel frame.
pub fn tunnel_decrypt(frame: &mut [u8; TUNNEL_DATA_SIZE], layer_key: &[u8; 32], iv_key: &[u8; 32]) {
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&frame[..16]);
    ecb_decrypt_block(iv_key, &mut iv);
    cbc_decrypt(layer_key, &iv, &mut frame[16..]);
    ecb_decrypt_block(iv_key, &mut iv);
    frame[..16].copy_from_slice(&iv);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rand_bytes;

    #[test]
    fn test_ecb_roundtrip() {
        let key = [7u8; 32];
        let orig = *b"sixteen byte blk";
        let mut block = orig;
        ecb_encrypt_block(&key, &mut block);
        assert_ne!(block, orig);
        ecb_decrypt_block(&key, &mut block);
        assert_eq!(block, orig);
    }

    #[test]
    fn test_cbc_roundtrip() {
        let key = [1u8; 32];
        let iv = [2u8; 16];
        let mut data = vec![0u8; 64];
        rand_bytes(&mut data);
        let orig = data.clone();

        cbc_encrypt(&key, &iv, &mut data);
        assert_ne!(data, orig);
        cbc_decrypt(&key, &iv, &mut data);
        assert_eq!(data, orig);
    }

    #[test]
    fn test_stateful_cbc_matches_one_shot() {
        let key = [9u8; 32];
        let iv = [3u8; 16];
        let mut data = vec![5u8; 96];
        let mut chunked = data.clone();

        cbc_encrypt(&key, &iv, &mut data);

        let mut enc = CbcEncryptor::new(&key, &iv);
        enc.encrypt(&mut chunked[..32]);
        enc.encrypt(&mut chunked[32..]);
        assert_eq!(chunked, data);
    }

    #[test]
    fn test_tunnel_layer_roundtrip() {
        let mut layer_key = [0u8; 32];
        let mut iv_key = [0u8; 32];
        rand_bytes(&mut layer_key);
        rand_bytes(&mut iv_key);

        let mut frame = [0u8; TUNNEL_DATA_SIZE];
        rand_bytes(&mut frame);
        let orig = frame;

        tunnel_encrypt(&mut frame, &layer_key, &iv_key);
        assert_ne!(frame[..16], orig[..16], "IV must be transformed");
        tunnel_decrypt(&mut frame, &layer_key, &iv_key);
        assert_eq!(frame[..], orig[..]);
    }

    #[test]
    fn test_tunnel_encrypt_changes_every_block() {
        let layer_key = [11u8; 32];
        let iv_key = [13u8; 32];

        let mut frame = [0u8; TUNNEL_DATA_SIZE];
        rand_bytes(&mut frame);
        let orig = frame;

        tunnel_encrypt(&mut frame, &layer_key, &iv_key);
        for (i, (a, b)) in frame.chunks(16).zip(orig.chunks(16)).enumerate() {
            assert_ne!(a, b, "block {i} unchanged after layer encryption");
        }
    }
}
