//! 2048-bit ElGamal over the mod-p group shared with Diffie-Hellman.
//!
//! Plaintexts are wrapped in a 255-byte group element `{0xFF || SHA256(m) || m}`
//! so the receiver can detect a failed decryption before interpreting the
//! payload. Ciphertexts are either 512 bytes (`a || b`) or 514 bytes with a
//! zero byte before each half.

use num_bigint_dig::{BigUint, RandBigInt};
use num_traits::One;
use rand::rngs::OsRng;

use crate::{sha256, CryptoError, Result};

/// Maximum plaintext carried by one ElGamal block.
pub const ELGAMAL_PLAINTEXT_SIZE: usize = 222;
/// Ciphertext size without zero padding.
pub const ELGAMAL_CIPHERTEXT_SIZE: usize = 512;
/// Ciphertext size with the leading zero-pad bytes.
pub const ELGAMAL_CIPHERTEXT_PADDED_SIZE: usize = 514;

/// The 2048-bit MODP group prime (RFC 3526 group 14), shared by ElGamal and
/// the transport Diffie-Hellman exchanges.
pub(crate) const ELGAMAL_P_HEX: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

pub(crate) fn group_p() -> BigUint {
    BigUint::parse_bytes(ELGAMAL_P_HEX.as_bytes(), 16).expect("valid prime literal")
}

pub(crate) fn group_g() -> BigUint {
    BigUint::from(2u32)
}

/// Left-pad a big-endian integer encoding to exactly `len` bytes.
pub(crate) fn encode_padded(n: &BigUint, len: usize) -> Vec<u8> {
    let bytes = n.to_bytes_be();
    debug_assert!(bytes.len() <= len);
    let mut out = vec![0u8; len];
    out[len - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Generate an ElGamal keypair: 256-byte private exponent, 256-byte public
/// value `g^x mod p`.
pub fn generate_elgamal_keypair() -> ([u8; 256], [u8; 256]) {
    let mut priv_key = [0u8; 256];
    crate::rand_bytes(&mut priv_key);
    let x = BigUint::from_bytes_be(&priv_key);
    let y = group_g().modpow(&x, &group_p());
    let mut pub_key = [0u8; 256];
    pub_key.copy_from_slice(&encode_padded(&y, 256));
    (priv_key, pub_key)
}

/// ElGamal-encrypt up to 222 bytes to `pub_key`.
///
/// The plaintext is zero-extended to 222 bytes; callers that need opaque
/// padding (the garlic ElGamal block) randomize their own tail first.
pub fn elgamal_encrypt(pub_key: &[u8; 256], data: &[u8], zero_padding: bool) -> Result<Vec<u8>> {
    if data.len() > ELGAMAL_PLAINTEXT_SIZE {
        return Err(CryptoError::InvalidLength {
            expected: ELGAMAL_PLAINTEXT_SIZE,
            actual: data.len(),
        });
    }
    let p = group_p();
    let y = BigUint::from_bytes_be(pub_key);
    let k = OsRng.gen_biguint_range(&BigUint::one(), &(&p - BigUint::one()));
    let a = group_g().modpow(&k, &p);
    let b1 = y.modpow(&k, &p);

    // 255-byte group element: 0xFF || SHA256(body) || body
    let mut m = [0u8; 255];
    m[0] = 0xFF;
    m[33..33 + data.len()].copy_from_slice(data);
    let digest = sha256(&m[33..255]);
    m[1..33].copy_from_slice(&digest);

    let b = (&b1 * BigUint::from_bytes_be(&m)) % &p;

    let mut out = vec![
        0u8;
        if zero_padding {
            ELGAMAL_CIPHERTEXT_PADDED_SIZE
        } else {
            ELGAMAL_CIPHERTEXT_SIZE
        }
    ];
    if zero_padding {
        out[1..257].copy_from_slice(&encode_padded(&a, 256));
        out[258..514].copy_from_slice(&encode_padded(&b, 256));
    } else {
        out[..256].copy_from_slice(&encode_padded(&a, 256));
        out[256..].copy_from_slice(&encode_padded(&b, 256));
    }
    Ok(out)
}

/// ElGamal-decrypt a ciphertext produced by [`elgamal_encrypt`].
///
/// Fails with `DecryptCheckFailed` when the embedded SHA-256 over the body
/// does not match, which is how a wrong private key or corrupted ciphertext
/// surfaces.
pub fn elgamal_decrypt(
    priv_key: &[u8; 256],
    encrypted: &[u8],
    zero_padding: bool,
) -> Result<[u8; ELGAMAL_PLAINTEXT_SIZE]> {
    let expected = if zero_padding {
        ELGAMAL_CIPHERTEXT_PADDED_SIZE
    } else {
        ELGAMAL_CIPHERTEXT_SIZE
    };
    if encrypted.len() < expected {
        return Err(CryptoError::InvalidLength {
            expected,
            actual: encrypted.len(),
        });
    }
    let (a_bytes, b_bytes) = if zero_padding {
        (&encrypted[1..257], &encrypted[258..514])
    } else {
        (&encrypted[..256], &encrypted[256..512])
    };
    let p = group_p();
    let x = BigUint::from_bytes_be(priv_key);
    let a = BigUint::from_bytes_be(a_bytes);
    let b = BigUint::from_bytes_be(b_bytes);

    // m = b * a^(p-1-x) mod p
    let exp = &p - BigUint::one() - (x % (&p - BigUint::one()));
    let m = (b * a.modpow(&exp, &p)) % &p;
    let m = encode_padded(&m, 255);

    if sha256(&m[33..255]) != m[1..33] {
        return Err(CryptoError::DecryptCheckFailed);
    }
    let mut out = [0u8; ELGAMAL_PLAINTEXT_SIZE];
    out.copy_from_slice(&m[33..255]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_unpadded() {
        let (priv_key, pub_key) = generate_elgamal_keypair();
        let mut data = [0u8; ELGAMAL_PLAINTEXT_SIZE];
        crate::rand_bytes(&mut data);

        let enc = elgamal_encrypt(&pub_key, &data, false).unwrap();
        assert_eq!(enc.len(), ELGAMAL_CIPHERTEXT_SIZE);
        let dec = elgamal_decrypt(&priv_key, &enc, false).unwrap();
        assert_eq!(dec, data);
    }

    #[test]
    fn test_roundtrip_zero_padded() {
        let (priv_key, pub_key) = generate_elgamal_keypair();
        let mut data = [0u8; ELGAMAL_PLAINTEXT_SIZE];
        crate::rand_bytes(&mut data);

        let enc = elgamal_encrypt(&pub_key, &data, true).unwrap();
        assert_eq!(enc.len(), ELGAMAL_CIPHERTEXT_PADDED_SIZE);
        assert_eq!(enc[0], 0);
        assert_eq!(enc[257], 0);
        let dec = elgamal_decrypt(&priv_key, &enc, true).unwrap();
        assert_eq!(dec, data);
    }

    #[test]
    fn test_short_plaintext_zero_extended() {
        let (priv_key, pub_key) = generate_elgamal_keypair();
        let enc = elgamal_encrypt(&pub_key, b"hello", false).unwrap();
        let dec = elgamal_decrypt(&priv_key, &enc, false).unwrap();
        assert_eq!(&dec[..5], b"hello");
        assert!(dec[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_wrong_key_fails_check() {
        let (_, pub_key) = generate_elgamal_keypair();
        let (other_priv, _) = generate_elgamal_keypair();

        let enc = elgamal_encrypt(&pub_key, b"secret", false).unwrap();
        let result = elgamal_decrypt(&other_priv, &enc, false);
        assert!(matches!(result, Err(CryptoError::DecryptCheckFailed)));
    }

    #[test]
    fn test_corrupted_ciphertext_fails_check() {
        let (priv_key, pub_key) = generate_elgamal_keypair();
        let mut enc = elgamal_encrypt(&pub_key, b"secret", false).unwrap();
        enc[300] ^= 0x01;
        let result = elgamal_decrypt(&priv_key, &enc, false);
        assert!(matches!(result, Err(CryptoError::DecryptCheckFailed)));
    }

    #[test]
    fn test_oversized_plaintext_rejected() {
        let (_, pub_key) = generate_elgamal_keypair();
        let data = [0u8; ELGAMAL_PLAINTEXT_SIZE + 1];
        assert!(elgamal_encrypt(&pub_key, &data, false).is_err());
    }
}
