//! Cloves: the addressed units inside a garlic message.

use bytes::Bytes;

use garliccraft_core::i2np::I2npMessage;
use garliccraft_core::{now_ms, CoreError, Hash, Result, TunnelId};
use garliccraft_crypto::rand_u32_nonzero;

/// Cloves unclaimed after this horizon are dropped.
pub const CLOVE_LIFETIME_MS: u64 = 8_000;

const DELIVERY_SHIFT: u8 = 5;

/// Where a clove's wrapped message goes after unwrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GarlicDelivery {
    /// Process at the unwrapping destination.
    Local,
    /// Hand to another local destination.
    Destination(Hash),
    /// Forward to a router.
    Router(Hash),
    /// Inject into a tunnel at `gateway`.
    Tunnel(Hash, TunnelId),
}

/// One clove: delivery instructions, a wrapped I2NP message, id, expiration.
#[derive(Debug, Clone)]
pub struct Clove {
    pub delivery: GarlicDelivery,
    pub message: I2npMessage,
    pub clove_id: u32,
    pub expiration: u64,
}

impl Clove {
    pub fn new(delivery: GarlicDelivery, message: I2npMessage) -> Self {
        Self {
            delivery,
            message,
            clove_id: rand_u32_nonzero(),
            expiration: now_ms() + CLOVE_LIFETIME_MS,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration <= now
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        let (code, hash, tunnel): (u8, Option<&Hash>, Option<TunnelId>) = match &self.delivery {
            GarlicDelivery::Local => (0, None, None),
            GarlicDelivery::Destination(h) => (1, Some(h), None),
            GarlicDelivery::Router(h) => (2, Some(h), None),
            GarlicDelivery::Tunnel(h, id) => (3, Some(h), Some(*id)),
        };
        out.push(code << DELIVERY_SHIFT);
        if let Some(h) = hash {
            out.extend_from_slice(h.as_bytes());
        }
        if let Some(id) = tunnel {
            out.extend_from_slice(&id.to_be_bytes());
        }
        let encoded = self.message.encode();
        out.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
        out.extend_from_slice(&encoded);
        out.extend_from_slice(&self.clove_id.to_be_bytes());
        out.extend_from_slice(&self.expiration.to_be_bytes());
        // null certificate
        out.extend_from_slice(&[0u8; 3]);
    }

    /// Parse one clove; `Ok(None)` when the wrapped message has already
    /// expired (the clove is skipped, the rest of the bundle survives).
    pub fn parse(buf: &[u8], offset: &mut usize) -> Result<Option<Self>> {
        let flag = *buf
            .get(*offset)
            .ok_or(CoreError::Malformed("clove truncated"))?;
        *offset += 1;
        let delivery = match (flag >> DELIVERY_SHIFT) & 0x03 {
            0 => GarlicDelivery::Local,
            1 => GarlicDelivery::Destination(read_hash(buf, offset)?),
            2 => GarlicDelivery::Router(read_hash(buf, offset)?),
            _ => {
                let hash = read_hash(buf, offset)?;
                let tunnel = read_u32(buf, offset)?;
                GarlicDelivery::Tunnel(hash, tunnel)
            }
        };
        let len = read_u16(buf, offset)? as usize;
        if buf.len() < *offset + len {
            return Err(CoreError::Malformed("clove message truncated"));
        }
        let msg_bytes = &buf[*offset..*offset + len];
        *offset += len;
        let clove_id = read_u32(buf, offset)?;
        let expiration = read_u64(buf, offset)?;
        if buf.len() < *offset + 3 {
            return Err(CoreError::Malformed("clove certificate truncated"));
        }
        *offset += 3;
        match I2npMessage::decode(msg_bytes) {
            Ok(message) => Ok(Some(Self {
                delivery,
                message,
                clove_id,
                expiration,
            })),
            Err(CoreError::Expired) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// The clove region of an AES block: count then cloves.
pub fn write_cloves(cloves: &[Clove]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(cloves.len() as u8);
    for clove in cloves {
        clove.write_to(&mut out);
    }
    out
}

pub fn parse_cloves(buf: &[u8]) -> Result<Vec<Clove>> {
    let mut offset = 0;
    let count = *buf
        .get(offset)
        .ok_or(CoreError::Malformed("clove count truncated"))? as usize;
    offset += 1;
    let mut cloves = Vec::with_capacity(count);
    for _ in 0..count {
        if let Some(clove) = Clove::parse(buf, &mut offset)? {
            cloves.push(clove);
        }
    }
    Ok(cloves)
}

fn read_u16(buf: &[u8], offset: &mut usize) -> Result<u16> {
    if buf.len() < *offset + 2 {
        return Err(CoreError::Malformed("clove truncated"));
    }
    let v = u16::from_be_bytes(buf[*offset..*offset + 2].try_into().expect("fixed"));
    *offset += 2;
    Ok(v)
}

fn read_u32(buf: &[u8], offset: &mut usize) -> Result<u32> {
    if buf.len() < *offset + 4 {
        return Err(CoreError::Malformed("clove truncated"));
    }
    let v = u32::from_be_bytes(buf[*offset..*offset + 4].try_into().expect("fixed"));
    *offset += 4;
    Ok(v)
}

fn read_u64(buf: &[u8], offset: &mut usize) -> Result<u64> {
    if buf.len() < *offset + 8 {
        return Err(CoreError::Malformed("clove truncated"));
    }
    let v = u64::from_be_bytes(buf[*offset..*offset + 8].try_into().expect("fixed"));
    *offset += 8;
    Ok(v)
}

fn read_hash(buf: &[u8], offset: &mut usize) -> Result<Hash> {
    if buf.len() < *offset + 32 {
        return Err(CoreError::Malformed("clove truncated"));
    }
    let h = Hash::from_slice(&buf[*offset..*offset + 32]).expect("fixed slice");
    *offset += 32;
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use garliccraft_core::i2np::MessageType;

    fn make_message() -> I2npMessage {
        I2npMessage::new(MessageType::Data, Bytes::from_static(b"inner payload"))
    }

    #[test]
    fn test_clove_roundtrip_all_deliveries() {
        for delivery in [
            GarlicDelivery::Local,
            GarlicDelivery::Destination(Hash::digest(b"dest")),
            GarlicDelivery::Router(Hash::digest(b"router")),
            GarlicDelivery::Tunnel(Hash::digest(b"gw"), 42),
        ] {
            let clove = Clove::new(delivery, make_message());
            let mut buf = Vec::new();
            clove.write_to(&mut buf);

            let mut offset = 0;
            let parsed = Clove::parse(&buf, &mut offset).unwrap().unwrap();
            assert_eq!(offset, buf.len());
            assert_eq!(parsed.delivery, delivery);
            assert_eq!(parsed.clove_id, clove.clove_id);
            assert_eq!(parsed.message.payload, clove.message.payload);
        }
    }

    #[test]
    fn test_multiple_cloves() {
        let cloves = vec![
            Clove::new(GarlicDelivery::Local, make_message()),
            Clove::new(GarlicDelivery::Tunnel(Hash::digest(b"gw"), 7), make_message()),
        ];
        let encoded = write_cloves(&cloves);
        let parsed = parse_cloves(&encoded).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].delivery, cloves[1].delivery);
    }

    #[test]
    fn test_truncated_clove_rejected() {
        let clove = Clove::new(GarlicDelivery::Local, make_message());
        let mut buf = Vec::new();
        clove.write_to(&mut buf);
        let mut offset = 0;
        assert!(Clove::parse(&buf[..buf.len() - 5], &mut offset).is_err());
    }

    #[test]
    fn test_expiry() {
        let mut clove = Clove::new(GarlicDelivery::Local, make_message());
        assert!(!clove.is_expired(now_ms()));
        clove.expiration = now_ms() - 1;
        assert!(clove.is_expired(now_ms()));
    }

    #[test]
    fn test_expired_inner_message_skipped_not_fatal() {
        let mut stale = make_message();
        stale.expiration = now_ms() - 1;
        let cloves = vec![
            Clove::new(GarlicDelivery::Local, stale),
            Clove::new(GarlicDelivery::Local, make_message()),
        ];
        let encoded = write_cloves(&cloves);
        let parsed = parse_cloves(&encoded).unwrap();
        assert_eq!(parsed.len(), 1);
    }
}
