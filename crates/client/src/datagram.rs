//! Signed datagrams: fire-and-forget messages between destinations.

use garliccraft_core::{CoreError, PrivateKeys, Result, RouterIdentity};

/// A received datagram, already verified.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: garliccraft_core::Hash,
    pub from_port: u16,
    pub to_port: u16,
    pub payload: Vec<u8>,
}

/// `identity || sig(payload) || payload`, signed by the sender's destination.
pub fn build_signed_datagram(keys: &PrivateKeys, payload: &[u8]) -> Vec<u8> {
    let ident = keys.identity().to_bytes();
    let sig = keys.sign(payload);
    let mut out = Vec::with_capacity(ident.len() + sig.len() + payload.len());
    out.extend_from_slice(&ident);
    out.extend_from_slice(&sig);
    out.extend_from_slice(payload);
    out
}

/// Verify and open a signed datagram; forged signatures drop it.
pub fn open_signed_datagram(buf: &[u8]) -> Result<(RouterIdentity, Vec<u8>)> {
    let (identity, consumed) = RouterIdentity::from_bytes(buf)?;
    let sig_len = identity.signing_key().sig_type().sig_len();
    if buf.len() < consumed + sig_len {
        return Err(CoreError::Malformed("datagram truncated"));
    }
    let sig = &buf[consumed..consumed + sig_len];
    let payload = &buf[consumed + sig_len..];
    identity.verify(payload, sig)?;
    Ok((identity, payload.to_vec()))
}
