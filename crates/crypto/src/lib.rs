//! GarlicCraft Cryptography
//!
//! Cryptographic primitives for the router core: AES-256 layer crypto with
//! the double-IV tunnel transform, 2048-bit ElGamal and Diffie-Hellman over
//! the same group, the signature family used by router and destination
//! identities, and the SSU message MAC.

mod aes_layer;
mod dh;
mod elgamal;
mod hmac;
mod rand_util;
mod sign;

pub use aes_layer::{
    cbc_decrypt, cbc_encrypt, ecb_decrypt_block, ecb_encrypt_block, tunnel_decrypt,
    tunnel_encrypt, CbcDecryptor, CbcEncryptor, TUNNEL_DATA_SIZE,
};
pub use dh::{
    derive_ntcp_session_key, derive_ssu_keys, DhKeypair, DhKeypairSupplier, DH_KEY_SIZE,
    DH_PRECOMPUTED_KEYPAIRS,
};
pub use elgamal::{
    elgamal_decrypt, elgamal_encrypt, generate_elgamal_keypair, ELGAMAL_CIPHERTEXT_PADDED_SIZE,
    ELGAMAL_CIPHERTEXT_SIZE, ELGAMAL_PLAINTEXT_SIZE,
};
pub use hmac::hmac_md5_i2p;
pub use rand_util::{rand_bytes, rand_in_range, rand_u32_nonzero};
pub use sign::{SigType, SigningKeypair, SigningPrivateKey, SigningPublicKey};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("ElGamal plaintext hash check failed")]
    DecryptCheckFailed,

    #[error("Invalid key material: {0}")]
    InvalidKey(&'static str),

    #[error("Unsupported signature type {0}")]
    UnsupportedSigType(u16),

    #[error("Invalid input length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Diffie-Hellman shared secret unusable")]
    WeakSharedSecret,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// SHA-256 convenience digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
