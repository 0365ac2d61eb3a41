//! Identity signatures.
//!
//! One tagged key family covers every signature type a router or destination
//! certificate can carry, with uniform `sign`/`verify` dispatch. DSA-SHA1 is
//! the legacy default identity type; EdDSA-25519 is the preferred modern one.

use num_bigint_dig::{BigUint, RandBigInt};
use num_traits::Zero;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::elliptic_curve::generic_array::GenericArray;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use sha1::{Digest, Sha1};

use crate::elgamal::encode_padded;
use crate::{CryptoError, Result};

// I2P 1024-bit DSA group
const DSA_P_HEX: &str = "\
9C05B2AA960D9B97B8931963C9CC9E8C3026E9B8ED92FAD0A69CC886D5BF8015\
FCADAE31A0AD18FAB3F01B00A358DE237655C4964AFAA2B337E96AD316B9FB1C\
C564B5AEC5B69A9FF6C3E4548707FEF8503D91DD8602E867E6D35D2235C1869C\
E2479C3B9D5401DE04E0727FB33D6511285D4CF29538D9E3B6051F5B22CC1C93";
const DSA_Q_HEX: &str = "A5DFC28FEF4CA1E286744CD8EED9D29D684046B7";
const DSA_G_HEX: &str = "\
0C1F4D27D40093B429E962D7223824E0BBC47E7C832A39236FC683AF84889581\
075FF9082ED32353D4374D7301CDA1D23C431F4698599DDA02451824FF369752\
593647CC3DDC197DE985E43D136CDCFC6BD5409CD2F450821142A5E6F8EB1C3A\
B5D0484B8129FCF17BCE4F7F33321C3CB3DBB14A905E7B2B3E93BE4708CBCC82";

fn dsa_p() -> BigUint {
    BigUint::parse_bytes(DSA_P_HEX.as_bytes(), 16).expect("valid prime literal")
}
fn dsa_q() -> BigUint {
    BigUint::parse_bytes(DSA_Q_HEX.as_bytes(), 16).expect("valid prime literal")
}
fn dsa_g() -> BigUint {
    BigUint::parse_bytes(DSA_G_HEX.as_bytes(), 16).expect("valid generator literal")
}

/// Signature type codes as carried in key certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SigType {
    DsaSha1 = 0,
    EcdsaSha256P256 = 1,
    EcdsaSha384P384 = 2,
    EcdsaSha512P521 = 3,
    RsaSha2562048 = 4,
    RsaSha3843072 = 5,
    RsaSha5124096 = 6,
    Ed25519 = 7,
}

impl SigType {
    pub fn from_code(code: u16) -> Result<Self> {
        match code {
            0 => Ok(SigType::DsaSha1),
            1 => Ok(SigType::EcdsaSha256P256),
            2 => Ok(SigType::EcdsaSha384P384),
            3 => Ok(SigType::EcdsaSha512P521),
            4 => Ok(SigType::RsaSha2562048),
            5 => Ok(SigType::RsaSha3843072),
            6 => Ok(SigType::RsaSha5124096),
            7 => Ok(SigType::Ed25519),
            other => Err(CryptoError::UnsupportedSigType(other)),
        }
    }

    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn pubkey_len(&self) -> usize {
        match self {
            SigType::DsaSha1 => 128,
            SigType::EcdsaSha256P256 => 64,
            SigType::EcdsaSha384P384 => 96,
            SigType::EcdsaSha512P521 => 132,
            SigType::RsaSha2562048 => 256,
            SigType::RsaSha3843072 => 384,
            SigType::RsaSha5124096 => 512,
            SigType::Ed25519 => 32,
        }
    }

    pub fn privkey_len(&self) -> usize {
        match self {
            SigType::DsaSha1 => 20,
            SigType::EcdsaSha256P256 => 32,
            SigType::EcdsaSha384P384 => 48,
            SigType::EcdsaSha512P521 => 66,
            SigType::RsaSha2562048 => 512,
            SigType::RsaSha3843072 => 768,
            SigType::RsaSha5124096 => 1024,
            SigType::Ed25519 => 32,
        }
    }

    pub fn sig_len(&self) -> usize {
        match self {
            SigType::DsaSha1 => 40,
            SigType::EcdsaSha256P256 => 64,
            SigType::EcdsaSha384P384 => 96,
            SigType::EcdsaSha512P521 => 132,
            SigType::RsaSha2562048 => 256,
            SigType::RsaSha3843072 => 384,
            SigType::RsaSha5124096 => 512,
            SigType::Ed25519 => 64,
        }
    }

    /// Types this router can actually sign and verify with.
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            SigType::DsaSha1
                | SigType::EcdsaSha256P256
                | SigType::EcdsaSha384P384
                | SigType::Ed25519
        )
    }
}

/// A verifying key, tagged by signature type.
#[derive(Clone)]
pub enum SigningPublicKey {
    Dsa(Box<BigUint>),
    EcdsaP256(p256::ecdsa::VerifyingKey),
    EcdsaP384(p384::ecdsa::VerifyingKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl std::fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningPublicKey({:?})", self.sig_type())
    }
}

impl SigningPublicKey {
    pub fn from_bytes(sig_type: SigType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != sig_type.pubkey_len() {
            return Err(CryptoError::InvalidLength {
                expected: sig_type.pubkey_len(),
                actual: bytes.len(),
            });
        }
        match sig_type {
            SigType::DsaSha1 => Ok(SigningPublicKey::Dsa(Box::new(BigUint::from_bytes_be(
                bytes,
            )))),
            SigType::EcdsaSha256P256 => {
                let point = p256::EncodedPoint::from_untagged_bytes(GenericArray::from_slice(bytes));
                let key = p256::ecdsa::VerifyingKey::from_encoded_point(&point)
                    .map_err(|_| CryptoError::InvalidKey("P-256 point"))?;
                Ok(SigningPublicKey::EcdsaP256(key))
            }
            SigType::EcdsaSha384P384 => {
                let point = p384::EncodedPoint::from_untagged_bytes(GenericArray::from_slice(bytes));
                let key = p384::ecdsa::VerifyingKey::from_encoded_point(&point)
                    .map_err(|_| CryptoError::InvalidKey("P-384 point"))?;
                Ok(SigningPublicKey::EcdsaP384(key))
            }
            SigType::Ed25519 => {
                let key = ed25519_dalek::VerifyingKey::from_bytes(
                    bytes.try_into().expect("length checked above"),
                )
                .map_err(|_| CryptoError::InvalidKey("Ed25519 point"))?;
                Ok(SigningPublicKey::Ed25519(key))
            }
            other => Err(CryptoError::UnsupportedSigType(other.code())),
        }
    }

    pub fn sig_type(&self) -> SigType {
        match self {
            SigningPublicKey::Dsa(_) => SigType::DsaSha1,
            SigningPublicKey::EcdsaP256(_) => SigType::EcdsaSha256P256,
            SigningPublicKey::EcdsaP384(_) => SigType::EcdsaSha384P384,
            SigningPublicKey::Ed25519(_) => SigType::Ed25519,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SigningPublicKey::Dsa(y) => encode_padded(y, 128),
            SigningPublicKey::EcdsaP256(key) => {
                let point = key.to_encoded_point(false);
                // untagged x || y
                point.as_bytes()[1..].to_vec()
            }
            SigningPublicKey::EcdsaP384(key) => {
                let point = key.to_encoded_point(false);
                point.as_bytes()[1..].to_vec()
            }
            SigningPublicKey::Ed25519(key) => key.to_bytes().to_vec(),
        }
    }

    /// Verify `sig` over `data`; `SignatureInvalid` on any mismatch.
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> Result<()> {
        if sig.len() != self.sig_type().sig_len() {
            return Err(CryptoError::SignatureInvalid);
        }
        match self {
            SigningPublicKey::Dsa(y) => dsa_verify(y, data, sig),
            SigningPublicKey::EcdsaP256(key) => {
                let sig = p256::ecdsa::Signature::from_slice(sig)
                    .map_err(|_| CryptoError::SignatureInvalid)?;
                key.verify(data, &sig)
                    .map_err(|_| CryptoError::SignatureInvalid)
            }
            SigningPublicKey::EcdsaP384(key) => {
                let sig = p384::ecdsa::Signature::from_slice(sig)
                    .map_err(|_| CryptoError::SignatureInvalid)?;
                key.verify(data, &sig)
                    .map_err(|_| CryptoError::SignatureInvalid)
            }
            SigningPublicKey::Ed25519(key) => {
                let sig = ed25519_dalek::Signature::from_slice(sig)
                    .map_err(|_| CryptoError::SignatureInvalid)?;
                key.verify(data, &sig)
                    .map_err(|_| CryptoError::SignatureInvalid)
            }
        }
    }
}

/// A signing key, tagged by signature type.
#[derive(Clone)]
pub enum SigningPrivateKey {
    Dsa(Box<BigUint>),
    EcdsaP256(p256::ecdsa::SigningKey),
    EcdsaP384(p384::ecdsa::SigningKey),
    Ed25519(ed25519_dalek::SigningKey),
}

impl SigningPrivateKey {
    pub fn generate(sig_type: SigType) -> Result<Self> {
        match sig_type {
            SigType::DsaSha1 => {
                let x = OsRng.gen_biguint_range(&BigUint::from(1u32), &dsa_q());
                Ok(SigningPrivateKey::Dsa(Box::new(x)))
            }
            SigType::EcdsaSha256P256 => Ok(SigningPrivateKey::EcdsaP256(
                p256::ecdsa::SigningKey::random(&mut OsRng),
            )),
            SigType::EcdsaSha384P384 => Ok(SigningPrivateKey::EcdsaP384(
                p384::ecdsa::SigningKey::random(&mut OsRng),
            )),
            SigType::Ed25519 => Ok(SigningPrivateKey::Ed25519(
                ed25519_dalek::SigningKey::generate(&mut OsRng),
            )),
            other => Err(CryptoError::UnsupportedSigType(other.code())),
        }
    }

    pub fn from_bytes(sig_type: SigType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != sig_type.privkey_len() {
            return Err(CryptoError::InvalidLength {
                expected: sig_type.privkey_len(),
                actual: bytes.len(),
            });
        }
        match sig_type {
            SigType::DsaSha1 => Ok(SigningPrivateKey::Dsa(Box::new(BigUint::from_bytes_be(
                bytes,
            )))),
            SigType::EcdsaSha256P256 => {
                let key = p256::ecdsa::SigningKey::from_slice(bytes)
                    .map_err(|_| CryptoError::InvalidKey("P-256 scalar"))?;
                Ok(SigningPrivateKey::EcdsaP256(key))
            }
            SigType::EcdsaSha384P384 => {
                let key = p384::ecdsa::SigningKey::from_slice(bytes)
                    .map_err(|_| CryptoError::InvalidKey("P-384 scalar"))?;
                Ok(SigningPrivateKey::EcdsaP384(key))
            }
            SigType::Ed25519 => Ok(SigningPrivateKey::Ed25519(
                ed25519_dalek::SigningKey::from_bytes(
                    bytes.try_into().expect("length checked above"),
                ),
            )),
            other => Err(CryptoError::UnsupportedSigType(other.code())),
        }
    }

    pub fn sig_type(&self) -> SigType {
        match self {
            SigningPrivateKey::Dsa(_) => SigType::DsaSha1,
            SigningPrivateKey::EcdsaP256(_) => SigType::EcdsaSha256P256,
            SigningPrivateKey::EcdsaP384(_) => SigType::EcdsaSha384P384,
            SigningPrivateKey::Ed25519(_) => SigType::Ed25519,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SigningPrivateKey::Dsa(x) => encode_padded(x, 20),
            SigningPrivateKey::EcdsaP256(key) => key.to_bytes().to_vec(),
            SigningPrivateKey::EcdsaP384(key) => key.to_bytes().to_vec(),
            SigningPrivateKey::Ed25519(key) => key.to_bytes().to_vec(),
        }
    }

    pub fn public_key(&self) -> SigningPublicKey {
        match self {
            SigningPrivateKey::Dsa(x) => {
                SigningPublicKey::Dsa(Box::new(dsa_g().modpow(x, &dsa_p())))
            }
            SigningPrivateKey::EcdsaP256(key) => SigningPublicKey::EcdsaP256(*key.verifying_key()),
            SigningPrivateKey::EcdsaP384(key) => SigningPublicKey::EcdsaP384(*key.verifying_key()),
            SigningPrivateKey::Ed25519(key) => SigningPublicKey::Ed25519(key.verifying_key()),
        }
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        match self {
            SigningPrivateKey::Dsa(x) => dsa_sign(x, data),
            SigningPrivateKey::EcdsaP256(key) => {
                let sig: p256::ecdsa::Signature = key.sign(data);
                sig.to_bytes().to_vec()
            }
            SigningPrivateKey::EcdsaP384(key) => {
                let sig: p384::ecdsa::Signature = key.sign(data);
                sig.to_bytes().to_vec()
            }
            SigningPrivateKey::Ed25519(key) => key.sign(data).to_bytes().to_vec(),
        }
    }
}

/// Convenience pair, generated together.
#[derive(Clone)]
pub struct SigningKeypair {
    pub private: SigningPrivateKey,
    pub public: SigningPublicKey,
}

impl SigningKeypair {
    pub fn generate(sig_type: SigType) -> Result<Self> {
        let private = SigningPrivateKey::generate(sig_type)?;
        let public = private.public_key();
        Ok(Self { private, public })
    }
}

fn sha1_as_biguint(data: &[u8]) -> BigUint {
    let mut hasher = Sha1::new();
    hasher.update(data);
    BigUint::from_bytes_be(&hasher.finalize())
}

fn dsa_sign(x: &BigUint, data: &[u8]) -> Vec<u8> {
    let (p, q, g) = (dsa_p(), dsa_q(), dsa_g());
    let h = sha1_as_biguint(data) % &q;
    loop {
        let k = OsRng.gen_biguint_range(&BigUint::from(1u32), &q);
        let r = g.modpow(&k, &p) % &q;
        if r.is_zero() {
            continue;
        }
        // k^-1 = k^(q-2) mod q, q prime
        let k_inv = k.modpow(&(&q - BigUint::from(2u32)), &q);
        let s = (&k_inv * (&h + x * &r)) % &q;
        if s.is_zero() {
            continue;
        }
        let mut sig = Vec::with_capacity(40);
        sig.extend_from_slice(&encode_padded(&r, 20));
        sig.extend_from_slice(&encode_padded(&s, 20));
        return sig;
    }
}

fn dsa_verify(y: &BigUint, data: &[u8], sig: &[u8]) -> Result<()> {
    let (p, q, g) = (dsa_p(), dsa_q(), dsa_g());
    let r = BigUint::from_bytes_be(&sig[..20]);
    let s = BigUint::from_bytes_be(&sig[20..40]);
    if r.is_zero() || s.is_zero() || r >= q || s >= q {
        return Err(CryptoError::SignatureInvalid);
    }
    let h = sha1_as_biguint(data) % &q;
    let w = s.modpow(&(&q - BigUint::from(2u32)), &q);
    let u1 = (&h * &w) % &q;
    let u2 = (&r * &w) % &q;
    let v = ((g.modpow(&u1, &p) * y.modpow(&u2, &p)) % &p) % &q;
    if v == r {
        Ok(())
    } else {
        Err(CryptoError::SignatureInvalid)
    }
}
