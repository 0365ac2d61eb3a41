//! Router and destination identities.
//!
//! The wire layout keeps 384 bytes of key material ahead of the certificate:
//! a 256-byte ElGamal public key, then a 128-byte signing-key field holding
//! the signing public key right-justified with padding before it. Key types
//! other than the legacy DSA default are named by a key certificate.

use garliccraft_crypto::{
    elgamal_decrypt, generate_elgamal_keypair, SigType, SigningPrivateKey, SigningPublicKey,
    ELGAMAL_PLAINTEXT_SIZE,
};

use crate::{CoreError, Hash, Result};

const ENC_KEY_SIZE: usize = 256;
const SIGNING_FIELD_SIZE: usize = 128;

const CERT_TYPE_NULL: u8 = 0;
const CERT_TYPE_KEY: u8 = 5;
const ENC_TYPE_ELGAMAL: u16 = 0;

/// Identity certificate. Only the null and key variants occur in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Certificate {
    Null,
    Key { sig_type: SigType },
}

impl Certificate {
    pub fn encoded_len(&self) -> usize {
        match self {
            Certificate::Null => 3,
            Certificate::Key { .. } => 7,
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Certificate::Null => {
                out.push(CERT_TYPE_NULL);
                out.extend_from_slice(&0u16.to_be_bytes());
            }
            Certificate::Key { sig_type } => {
                out.push(CERT_TYPE_KEY);
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&sig_type.code().to_be_bytes());
                out.extend_from_slice(&ENC_TYPE_ELGAMAL.to_be_bytes());
            }
        }
    }

    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 3 {
            return Err(CoreError::Malformed("certificate truncated"));
        }
        let cert_type = buf[0];
        let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if buf.len() < 3 + len {
            return Err(CoreError::Malformed("certificate payload truncated"));
        }
        match cert_type {
            CERT_TYPE_NULL => {
                if len != 0 {
                    return Err(CoreError::Malformed("null certificate with payload"));
                }
                Ok((Certificate::Null, 3))
            }
            CERT_TYPE_KEY => {
                if len < 4 {
                    return Err(CoreError::Malformed("key certificate too short"));
                }
                let code = u16::from_be_bytes([buf[3], buf[4]]);
                let sig_type = SigType::from_code(code)
                    .map_err(|_| CoreError::Malformed("signature-type unsupported"))?;
                if !sig_type.is_supported() {
                    return Err(CoreError::Malformed("signature-type unsupported"));
                }
                Ok((Certificate::Key { sig_type }, 3 + len))
            }
            _ => Err(CoreError::Malformed("unknown certificate type")),
        }
    }
}

/// A router's (or destination's) public identity: ElGamal encryption key,
/// signing key, certificate. Its SHA-256 is the stable network name.
#[derive(Clone)]
pub struct RouterIdentity {
    public_key: [u8; ENC_KEY_SIZE],
    signing_key: SigningPublicKey,
    padding: Vec<u8>,
    hash: Hash,
}

/// Application endpoints share the identity layout.
pub type Destination = RouterIdentity;

impl RouterIdentity {
    /// Build an identity with zeroed signing-field padding. Padding is part
    /// of the hashed identity bytes, and the keys file does not carry it, so
    /// local identities keep it deterministic to survive reloads.
    pub fn new(public_key: [u8; ENC_KEY_SIZE], signing_key: SigningPublicKey) -> Self {
        let pad_len = SIGNING_FIELD_SIZE.saturating_sub(signing_key.sig_type().pubkey_len());
        Self::with_padding(public_key, signing_key, vec![0u8; pad_len])
    }

    fn with_padding(
        public_key: [u8; ENC_KEY_SIZE],
        signing_key: SigningPublicKey,
        padding: Vec<u8>,
    ) -> Self {
        let mut ident = Self {
            public_key,
            signing_key,
            padding,
            hash: Hash::ZERO,
        };
        ident.hash = Hash::digest(&ident.to_bytes());
        ident
    }

    pub fn public_key(&self) -> &[u8; ENC_KEY_SIZE] {
        &self.public_key
    }

    pub fn signing_key(&self) -> &SigningPublicKey {
        &self.signing_key
    }

    pub fn certificate(&self) -> Certificate {
        match self.signing_key.sig_type() {
            SigType::DsaSha1 => Certificate::Null,
            sig_type => Certificate::Key { sig_type },
        }
    }

    /// The router's stable name: SHA-256 over the encoded identity.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn encoded_len(&self) -> usize {
        ENC_KEY_SIZE + SIGNING_FIELD_SIZE + self.certificate().encoded_len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.padding);
        out.extend_from_slice(&self.signing_key.to_bytes());
        self.certificate().write_to(&mut out);
        out
    }

    /// Parse an identity prefix of `buf`, returning it and the bytes consumed.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < ENC_KEY_SIZE + SIGNING_FIELD_SIZE + 3 {
            return Err(CoreError::Malformed("identity truncated"));
        }
        let mut public_key = [0u8; ENC_KEY_SIZE];
        public_key.copy_from_slice(&buf[..ENC_KEY_SIZE]);
        let signing_field = &buf[ENC_KEY_SIZE..ENC_KEY_SIZE + SIGNING_FIELD_SIZE];
        let (cert, cert_len) = Certificate::parse(&buf[ENC_KEY_SIZE + SIGNING_FIELD_SIZE..])?;

        let sig_type = match cert {
            Certificate::Null => SigType::DsaSha1,
            Certificate::Key { sig_type } => sig_type,
        };
        let key_len = sig_type.pubkey_len();
        if key_len > SIGNING_FIELD_SIZE {
            return Err(CoreError::Malformed("signature-type unsupported"));
        }
        let pad_len = SIGNING_FIELD_SIZE - key_len;
        let signing_key = SigningPublicKey::from_bytes(sig_type, &signing_field[pad_len..])
            .map_err(|_| CoreError::Malformed("bad signing key"))?;

        let ident = Self::with_padding(public_key, signing_key, signing_field[..pad_len].to_vec());
        Ok((ident, ENC_KEY_SIZE + SIGNING_FIELD_SIZE + cert_len))
    }

    /// Verify `sig` over `data` with this identity's signing key.
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> Result<()> {
        self.signing_key
            .verify(data, sig)
            .map_err(|_| CoreError::AuthFailed("signature mismatch"))
    }
}

impl std::fmt::Debug for RouterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouterIdentity({:?})", self.hash)
    }
}

impl PartialEq for RouterIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}
impl Eq for RouterIdentity {}

/// A full local identity: the public half plus both private keys.
#[derive(Clone)]
pub struct PrivateKeys {
    identity: RouterIdentity,
    signing_key: SigningPrivateKey,
    encryption_key: [u8; ENC_KEY_SIZE],
}

impl PrivateKeys {
    pub fn generate(sig_type: SigType) -> Result<Self> {
        let (enc_priv, enc_pub) = generate_elgamal_keypair();
        let signing_key = SigningPrivateKey::generate(sig_type)?;
        let identity = RouterIdentity::new(enc_pub, signing_key.public_key());
        Ok(Self {
            identity,
            signing_key,
            encryption_key: enc_priv,
        })
    }

    pub fn identity(&self) -> &RouterIdentity {
        &self.identity
    }

    pub fn hash(&self) -> Hash {
        self.identity.hash()
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data)
    }

    pub fn signing_key(&self) -> &SigningPrivateKey {
        &self.signing_key
    }

    pub fn encryption_key(&self) -> &[u8; ENC_KEY_SIZE] {
        &self.encryption_key
    }

    /// ElGamal-decrypt a block addressed to this identity.
    pub fn decrypt(&self, data: &[u8], zero_padding: bool) -> Result<[u8; ELGAMAL_PLAINTEXT_SIZE]> {
        elgamal_decrypt(&self.encryption_key, data, zero_padding)
            .map_err(|_| CoreError::DecryptCheckFailed)
    }

    /// Encode as the `router.keys` file:
    /// privateSigningKey || privateEncryptionKey || publicSigningKey ||
    /// publicEncryptionKey || certificate.
    pub fn to_keys_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.signing_key.to_bytes());
        out.extend_from_slice(&self.encryption_key);
        out.extend_from_slice(&self.identity.signing_key.to_bytes());
        out.extend_from_slice(&self.identity.public_key);
        self.identity.certificate().write_to(&mut out);
        out
    }

    /// Decode a `router.keys` file.
    ///
    /// The certificate sits at the tail; its two fixed encodings (3-byte
    /// null, 7-byte key) disambiguate the key lengths ahead of it.
    pub fn from_keys_bytes(buf: &[u8]) -> Result<Self> {
        let sig_type = Self::peek_tail_sig_type(buf)?;
        let spriv_len = sig_type.privkey_len();
        let spub_len = sig_type.pubkey_len();
        let expected = spriv_len + ENC_KEY_SIZE + spub_len + ENC_KEY_SIZE
            + match sig_type {
                SigType::DsaSha1 => 3,
                _ => 7,
            };
        if buf.len() != expected {
            return Err(CoreError::Malformed("keys file length mismatch"));
        }

        let mut offset = 0;
        let signing_key = SigningPrivateKey::from_bytes(sig_type, &buf[..spriv_len])
            .map_err(|_| CoreError::Malformed("bad private signing key"))?;
        offset += spriv_len;

        let mut encryption_key = [0u8; ENC_KEY_SIZE];
        encryption_key.copy_from_slice(&buf[offset..offset + ENC_KEY_SIZE]);
        offset += ENC_KEY_SIZE;

        let signing_pub = SigningPublicKey::from_bytes(sig_type, &buf[offset..offset + spub_len])
            .map_err(|_| CoreError::Malformed("bad public signing key"))?;
        offset += spub_len;

        let mut public_key = [0u8; ENC_KEY_SIZE];
        public_key.copy_from_slice(&buf[offset..offset + ENC_KEY_SIZE]);

        let identity = RouterIdentity::new(public_key, signing_pub);
        Ok(Self {
            identity,
            signing_key,
            encryption_key,
        })
    }

    fn peek_tail_sig_type(buf: &[u8]) -> Result<SigType> {
        if buf.len() >= 7 && buf[buf.len() - 7] == CERT_TYPE_KEY {
            let code = u16::from_be_bytes([buf[buf.len() - 4], buf[buf.len() - 3]]);
            let sig_type = SigType::from_code(code)
                .map_err(|_| CoreError::Malformed("signature-type unsupported"))?;
            if !sig_type.is_supported() {
                return Err(CoreError::Malformed("signature-type unsupported"));
            }
            return Ok(sig_type);
        }
        if buf.len() >= 3 && buf[buf.len() - 3] == CERT_TYPE_NULL {
            return Ok(SigType::DsaSha1);
        }
        Err(CoreError::Malformed("keys file certificate unrecognized"))
    }
}

impl std::fmt::Debug for PrivateKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKeys({:?})", self.identity.hash)
    }
}
