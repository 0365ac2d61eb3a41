//! I2NP, the router-to-router typed message layer.
//!
//! Every message is `type u8 || msgID u32be || expiration u64be (ms) ||
//! size u16be || chks u8 || payload`, where `chks` is the first byte of the
//! payload's SHA-256. Messages are immutable once built and shared by
//! reference between subsystems.

use std::sync::Arc;

use bytes::Bytes;

use crate::{now_ms, CoreError, Hash, Result, TunnelId};

pub const I2NP_HEADER_SIZE: usize = 16;

/// Messages not delivered within this horizon are dropped as expired.
pub const I2NP_MESSAGE_EXPIRATION_MS: u64 = 8_000;

/// Encrypted portion of a tunnel data message.
pub const TUNNEL_DATA_SIZE: usize = 1024;

/// One ElGamal-encrypted build record with its 16-byte address prefix.
pub const TUNNEL_BUILD_RECORD_SIZE: usize = 528;

/// A build message always carries 8 records, real or filler.
pub const NUM_BUILD_RECORDS: usize = 8;

/// Wire-side cap on excluded peers in a lookup; larger counts are malformed.
pub const MAX_LOOKUP_EXCLUDED: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    DatabaseStore = 1,
    DatabaseLookup = 2,
    DatabaseSearchReply = 3,
    DeliveryStatus = 10,
    Garlic = 11,
    TunnelData = 18,
    TunnelGateway = 19,
    Data = 20,
    TunnelBuild = 21,
    TunnelBuildReply = 22,
}

impl MessageType {
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(MessageType::DatabaseStore),
            2 => Ok(MessageType::DatabaseLookup),
            3 => Ok(MessageType::DatabaseSearchReply),
            10 => Ok(MessageType::DeliveryStatus),
            11 => Ok(MessageType::Garlic),
            18 => Ok(MessageType::TunnelData),
            19 => Ok(MessageType::TunnelGateway),
            20 => Ok(MessageType::Data),
            21 => Ok(MessageType::TunnelBuild),
            22 => Ok(MessageType::TunnelBuildReply),
            _ => Err(CoreError::Malformed("unknown i2np message type")),
        }
    }
}

/// An in-flight I2NP message. Shared by `Arc`; dropped by the last reader.
#[derive(Debug, Clone)]
pub struct I2npMessage {
    pub msg_type: MessageType,
    pub msg_id: u32,
    pub expiration: u64,
    pub payload: Bytes,
}

pub type I2npMessageRef = Arc<I2npMessage>;

impl I2npMessage {
    pub fn new(msg_type: MessageType, payload: Bytes) -> Self {
        Self {
            msg_type,
            msg_id: garliccraft_crypto::rand_u32_nonzero(),
            expiration: now_ms() + I2NP_MESSAGE_EXPIRATION_MS,
            payload,
        }
    }

    pub fn with_id(msg_type: MessageType, msg_id: u32, payload: Bytes) -> Self {
        Self {
            msg_type,
            msg_id,
            expiration: now_ms() + I2NP_MESSAGE_EXPIRATION_MS,
            payload,
        }
    }

    pub fn shared(self) -> I2npMessageRef {
        Arc::new(self)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration <= now
    }

    pub fn encoded_len(&self) -> usize {
        I2NP_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.msg_type as u8);
        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.push(Hash::digest(&self.payload).0[0]);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode and validate one message; `Expired` and checksum failures are
    /// surfaced so the caller can drop and count them.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < I2NP_HEADER_SIZE {
            return Err(CoreError::Malformed("i2np header truncated"));
        }
        let msg_type = MessageType::from_code(buf[0])?;
        let msg_id = u32::from_be_bytes(buf[1..5].try_into().expect("fixed"));
        let expiration = u64::from_be_bytes(buf[5..13].try_into().expect("fixed"));
        let size = u16::from_be_bytes(buf[13..15].try_into().expect("fixed")) as usize;
        let checksum = buf[15];
        if buf.len() < I2NP_HEADER_SIZE + size {
            return Err(CoreError::Malformed("i2np payload truncated"));
        }
        let payload = Bytes::copy_from_slice(&buf[I2NP_HEADER_SIZE..I2NP_HEADER_SIZE + size]);
        if Hash::digest(&payload).0[0] != checksum {
            return Err(CoreError::AuthFailed("i2np checksum mismatch"));
        }
        if expiration <= now_ms() {
            return Err(CoreError::Expired);
        }
        Ok(Self {
            msg_type,
            msg_id,
            expiration,
            payload,
        })
    }
}

/// DatabaseStore payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseStore {
    pub key: Hash,
    /// 0 = RouterInfo, 1 = LeaseSet.
    pub store_type: u8,
    pub reply_token: u32,
    pub reply_tunnel: TunnelId,
    pub reply_gateway: Hash,
    pub data: Bytes,
}

pub const STORE_TYPE_ROUTER_INFO: u8 = 0;
pub const STORE_TYPE_LEASE_SET: u8 = 1;

impl DatabaseStore {
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(32 + 1 + 4 + 36 + self.data.len());
        out.extend_from_slice(self.key.as_bytes());
        out.push(self.store_type);
        out.extend_from_slice(&self.reply_token.to_be_bytes());
        if self.reply_token != 0 {
            out.extend_from_slice(&self.reply_tunnel.to_be_bytes());
            out.extend_from_slice(self.reply_gateway.as_bytes());
        }
        out.extend_from_slice(&self.data);
        out.into()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 37 {
            return Err(CoreError::Malformed("database store truncated"));
        }
        let key = Hash::from_slice(&buf[..32]).expect("fixed slice");
        let store_type = buf[32];
        let reply_token = u32::from_be_bytes(buf[33..37].try_into().expect("fixed"));
        let mut offset = 37;
        let (reply_tunnel, reply_gateway) = if reply_token != 0 {
            if buf.len() < offset + 36 {
                return Err(CoreError::Malformed("database store reply truncated"));
            }
            let tunnel = u32::from_be_bytes(buf[offset..offset + 4].try_into().expect("fixed"));
            let gateway = Hash::from_slice(&buf[offset + 4..offset + 36]).expect("fixed slice");
            offset += 36;
            (tunnel, gateway)
        } else {
            (0, Hash::ZERO)
        };
        Ok(Self {
            key,
            store_type,
            reply_token,
            reply_tunnel,
            reply_gateway,
            data: Bytes::copy_from_slice(&buf[offset..]),
        })
    }
}

/// DatabaseLookup payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseLookup {
    pub key: Hash,
    pub from: Hash,
    /// Reply through this tunnel at `from` rather than directly.
    pub reply_tunnel: Option<TunnelId>,
    pub exploratory: bool,
    pub excluded: Vec<Hash>,
}

const LOOKUP_FLAG_TUNNEL: u8 = 0x01;
const LOOKUP_FLAG_EXPLORATORY: u8 = 0x04;

impl DatabaseLookup {
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(69 + 32 * self.excluded.len());
        out.extend_from_slice(self.key.as_bytes());
        out.extend_from_slice(self.from.as_bytes());
        let mut flags = 0u8;
        if self.reply_tunnel.is_some() {
            flags |= LOOKUP_FLAG_TUNNEL;
        }
        if self.exploratory {
            flags |= LOOKUP_FLAG_EXPLORATORY;
        }
        out.push(flags);
        if let Some(tunnel) = self.reply_tunnel {
            out.extend_from_slice(&tunnel.to_be_bytes());
        }
        out.extend_from_slice(&(self.excluded.len() as u16).to_be_bytes());
        for hash in &self.excluded {
            out.extend_from_slice(hash.as_bytes());
        }
        out.into()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 67 {
            return Err(CoreError::Malformed("database lookup truncated"));
        }
        let key = Hash::from_slice(&buf[..32]).expect("fixed slice");
        let from = Hash::from_slice(&buf[32..64]).expect("fixed slice");
        let flags = buf[64];
        let mut offset = 65;
        let reply_tunnel = if flags & LOOKUP_FLAG_TUNNEL != 0 {
            if buf.len() < offset + 4 {
                return Err(CoreError::Malformed("database lookup truncated"));
            }
            let tunnel = u32::from_be_bytes(buf[offset..offset + 4].try_into().expect("fixed"));
            offset += 4;
            Some(tunnel)
        } else {
            None
        };
        if buf.len() < offset + 2 {
            return Err(CoreError::Malformed("database lookup truncated"));
        }
        let count = u16::from_be_bytes(buf[offset..offset + 2].try_into().expect("fixed")) as usize;
        offset += 2;
        if count > MAX_LOOKUP_EXCLUDED {
            return Err(CoreError::Malformed("excluded peer count over cap"));
        }
        if buf.len() < offset + count * 32 {
            return Err(CoreError::Malformed("database lookup truncated"));
        }
        let mut excluded = Vec::with_capacity(count);
        for _ in 0..count {
            excluded.push(Hash::from_slice(&buf[offset..offset + 32]).expect("fixed slice"));
            offset += 32;
        }
        Ok(Self {
            key,
            from,
            reply_tunnel,
            exploratory: flags & LOOKUP_FLAG_EXPLORATORY != 0,
            excluded,
        })
    }
}

/// DatabaseSearchReply payload: peers closer to `key` than the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSearchReply {
    pub key: Hash,
    pub peers: Vec<Hash>,
    pub from: Hash,
}

impl DatabaseSearchReply {
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(65 + 32 * self.peers.len());
        out.extend_from_slice(self.key.as_bytes());
        out.push(self.peers.len() as u8);
        for peer in &self.peers {
            out.extend_from_slice(peer.as_bytes());
        }
        out.extend_from_slice(self.from.as_bytes());
        out.into()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 65 {
            return Err(CoreError::Malformed("search reply truncated"));
        }
        let key = Hash::from_slice(&buf[..32]).expect("fixed slice");
        let count = buf[32] as usize;
        if buf.len() < 33 + count * 32 + 32 {
            return Err(CoreError::Malformed("search reply truncated"));
        }
        let mut peers = Vec::with_capacity(count);
        let mut offset = 33;
        for _ in 0..count {
            peers.push(Hash::from_slice(&buf[offset..offset + 32]).expect("fixed slice"));
            offset += 32;
        }
        let from = Hash::from_slice(&buf[offset..offset + 32]).expect("fixed slice");
        Ok(Self { key, peers, from })
    }
}

/// DeliveryStatus payload: acknowledges `msg_id` at `timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStatus {
    pub msg_id: u32,
    pub timestamp: u64,
}

impl DeliveryStatus {
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(12);
        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.into()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            return Err(CoreError::Malformed("delivery status truncated"));
        }
        Ok(Self {
            msg_id: u32::from_be_bytes(buf[..4].try_into().expect("fixed")),
            timestamp: u64::from_be_bytes(buf[4..12].try_into().expect("fixed")),
        })
    }
}

/// TunnelData payload: a layer-encrypted 1024-byte frame for `tunnel_id`.
#[derive(Clone)]
pub struct TunnelData {
    pub tunnel_id: TunnelId,
    pub data: [u8; TUNNEL_DATA_SIZE],
}

impl TunnelData {
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(4 + TUNNEL_DATA_SIZE);
        out.extend_from_slice(&self.tunnel_id.to_be_bytes());
        out.extend_from_slice(&self.data);
        out.into()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != 4 + TUNNEL_DATA_SIZE {
            return Err(CoreError::Malformed("tunnel data size mismatch"));
        }
        let tunnel_id = u32::from_be_bytes(buf[..4].try_into().expect("fixed"));
        let mut data = [0u8; TUNNEL_DATA_SIZE];
        data.copy_from_slice(&buf[4..]);
        Ok(Self { tunnel_id, data })
    }
}

impl std::fmt::Debug for TunnelData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TunnelData(id={})", self.tunnel_id)
    }
}

/// TunnelGateway payload: an I2NP message to inject at an inbound gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelGateway {
    pub tunnel_id: TunnelId,
    pub data: Bytes,
}

impl TunnelGateway {
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(6 + self.data.len());
        out.extend_from_slice(&self.tunnel_id.to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
        out.into()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 6 {
            return Err(CoreError::Malformed("tunnel gateway truncated"));
        }
        let tunnel_id = u32::from_be_bytes(buf[..4].try_into().expect("fixed"));
        let len = u16::from_be_bytes(buf[4..6].try_into().expect("fixed")) as usize;
        if buf.len() < 6 + len {
            return Err(CoreError::Malformed("tunnel gateway truncated"));
        }
        Ok(Self {
            tunnel_id,
            data: Bytes::copy_from_slice(&buf[6..6 + len]),
        })
    }
}

/// TunnelBuild / TunnelBuildReply payload: exactly 8 records of 528 bytes.
#[derive(Clone)]
pub struct TunnelBuild {
    pub records: Vec<[u8; TUNNEL_BUILD_RECORD_SIZE]>,
}

impl TunnelBuild {
    pub fn encode(&self) -> Bytes {
        debug_assert_eq!(self.records.len(), NUM_BUILD_RECORDS);
        let mut out = Vec::with_capacity(1 + NUM_BUILD_RECORDS * TUNNEL_BUILD_RECORD_SIZE);
        out.push(self.records.len() as u8);
        for record in &self.records {
            out.extend_from_slice(record);
        }
        out.into()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(CoreError::Malformed("tunnel build truncated"));
        }
        let count = buf[0] as usize;
        if count != NUM_BUILD_RECORDS {
            return Err(CoreError::Malformed("tunnel build record count"));
        }
        if buf.len() < 1 + count * TUNNEL_BUILD_RECORD_SIZE {
            return Err(CoreError::Malformed("tunnel build truncated"));
        }
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let start = 1 + i * TUNNEL_BUILD_RECORD_SIZE;
            let mut record = [0u8; TUNNEL_BUILD_RECORD_SIZE];
            record.copy_from_slice(&buf[start..start + TUNNEL_BUILD_RECORD_SIZE]);
            records.push(record);
        }
        Ok(Self { records })
    }
}

impl std::fmt::Debug for TunnelBuild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TunnelBuild({} records)", self.records.len())
    }
}

/// Data payload: a length-prefixed application payload (streaming/datagram).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload(pub Bytes);

impl DataPayload {
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(4 + self.0.len());
        out.extend_from_slice(&(self.0.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.0);
        out.into()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(CoreError::Malformed("data payload truncated"));
        }
        let len = u32::from_be_bytes(buf[..4].try_into().expect("fixed")) as usize;
        if buf.len() < 4 + len {
            return Err(CoreError::Malformed("data payload truncated"));
        }
        Ok(Self(Bytes::copy_from_slice(&buf[4..4 + len])))
    }
}
