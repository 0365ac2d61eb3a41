//! The 1024-byte tunnel frame codec.
//!
//! Post-decryption cleartext: `IV[16] || chk[4] || nonzero-pad || 0x00 ||
//! fragment records`, where `chk` is the first 4 bytes of
//! `SHA256(fragments || IV)`. Fragment records carry delivery instructions
//! and split oversized I2NP messages across frames.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::digest::Digest;

use garliccraft_core::{CoreError, Hash, Result, TunnelId};
use garliccraft_crypto::{rand_bytes, rand_in_range, TUNNEL_DATA_SIZE};

/// Usable bytes after IV and checksum.
const CONTENT_SIZE: usize = TUNNEL_DATA_SIZE - 16 - 4;

/// Partially reassembled tunnel messages are dropped after this long.
const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);

const FLAG_FOLLOW_ON: u8 = 0x80;
const FLAG_FRAGMENTED: u8 = 0x08;
const DELIVERY_SHIFT: u8 = 5;

/// Where a fragment's payload should go once off the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Terminates at the processing router.
    Local,
    /// Inject into another tunnel at `gateway`.
    Tunnel(Hash, TunnelId),
    /// Forward to a router directly.
    Router(Hash),
    /// Hand to a local destination.
    Destination(Hash),
}

impl Delivery {
    fn type_code(&self) -> u8 {
        match self {
            Delivery::Local => 0,
            Delivery::Tunnel(..) => 1,
            Delivery::Router(_) => 2,
            Delivery::Destination(_) => 3,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Delivery::Local => 0,
            Delivery::Tunnel(..) => 36,
            Delivery::Router(_) | Delivery::Destination(_) => 32,
        }
    }
}

/// One parsed fragment record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// First (or only) fragment of a message.
    Initial {
        delivery: Delivery,
        /// Present when more fragments follow.
        msg_id: Option<u32>,
        payload: Vec<u8>,
    },
    FollowOn {
        msg_id: u32,
        fragment_num: u8,
        is_last: bool,
        payload: Vec<u8>,
    },
}

impl Fragment {
    fn encoded_len(&self) -> usize {
        match self {
            Fragment::Initial {
                delivery,
                msg_id,
                payload,
            } => 1 + delivery.encoded_len() + if msg_id.is_some() { 4 } else { 0 } + 2 + payload.len(),
            Fragment::FollowOn { payload, .. } => 1 + 4 + 2 + payload.len(),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Fragment::Initial {
                delivery,
                msg_id,
                payload,
            } => {
                let mut flag = delivery.type_code() << DELIVERY_SHIFT;
                if msg_id.is_some() {
                    flag |= FLAG_FRAGMENTED;
                }
                out.push(flag);
                match delivery {
                    Delivery::Local => {}
                    Delivery::Tunnel(gateway, tunnel_id) => {
                        out.extend_from_slice(&tunnel_id.to_be_bytes());
                        out.extend_from_slice(gateway.as_bytes());
                    }
                    Delivery::Router(hash) | Delivery::Destination(hash) => {
                        out.extend_from_slice(hash.as_bytes());
                    }
                }
                if let Some(id) = msg_id {
                    out.extend_from_slice(&id.to_be_bytes());
                }
                out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                out.extend_from_slice(payload);
            }
            Fragment::FollowOn {
                msg_id,
                fragment_num,
                is_last,
                payload,
            } => {
                out.push(FLAG_FOLLOW_ON | (fragment_num << 1) | u8::from(*is_last));
                out.extend_from_slice(&msg_id.to_be_bytes());
                out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                out.extend_from_slice(payload);
            }
        }
    }

    fn parse(buf: &[u8], offset: &mut usize) -> Result<Self> {
        let flag = *buf
            .get(*offset)
            .ok_or(CoreError::Malformed("fragment truncated"))?;
        *offset += 1;
        if flag & FLAG_FOLLOW_ON != 0 {
            let msg_id = read_u32(buf, offset)?;
            let len = read_u16(buf, offset)? as usize;
            let payload = read_bytes(buf, offset, len)?;
            return Ok(Fragment::FollowOn {
                msg_id,
                fragment_num: (flag & 0x7F) >> 1,
                is_last: flag & 1 != 0,
                payload,
            });
        }
        let delivery = match (flag >> DELIVERY_SHIFT) & 0x03 {
            0 => Delivery::Local,
            1 => {
                let tunnel_id = read_u32(buf, offset)?;
                let gateway = read_hash(buf, offset)?;
                Delivery::Tunnel(gateway, tunnel_id)
            }
            2 => Delivery::Router(read_hash(buf, offset)?),
            _ => Delivery::Destination(read_hash(buf, offset)?),
        };
        let msg_id = if flag & FLAG_FRAGMENTED != 0 {
            Some(read_u32(buf, offset)?)
        } else {
            None
        };
        let len = read_u16(buf, offset)? as usize;
        let payload = read_bytes(buf, offset, len)?;
        Ok(Fragment::Initial {
            delivery,
            msg_id,
            payload,
        })
    }
}

fn read_u16(buf: &[u8], offset: &mut usize) -> Result<u16> {
    if buf.len() < *offset + 2 {
        return Err(CoreError::Malformed("fragment truncated"));
    }
    let v = u16::from_be_bytes(buf[*offset..*offset + 2].try_into().expect("fixed"));
    *offset += 2;
    Ok(v)
}

fn read_u32(buf: &[u8], offset: &mut usize) -> Result<u32> {
    if buf.len() < *offset + 4 {
        return Err(CoreError::Malformed("fragment truncated"));
    }
    let v = u32::from_be_bytes(buf[*offset..*offset + 4].try_into().expect("fixed"));
    *offset += 4;
    Ok(v)
}

fn read_hash(buf: &[u8], offset: &mut usize) -> Result<Hash> {
    if buf.len() < *offset + 32 {
        return Err(CoreError::Malformed("fragment truncated"));
    }
    let h = Hash::from_slice(&buf[*offset..*offset + 32]).expect("fixed slice");
    *offset += 32;
    Ok(h)
}

fn read_bytes(buf: &[u8], offset: &mut usize, len: usize) -> Result<Vec<u8>> {
    if buf.len() < *offset + len {
        return Err(CoreError::Malformed("fragment truncated"));
    }
    let out = buf[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

/// Build the frames carrying `message` toward `delivery`, fragmenting when
/// the payload exceeds one frame.
pub fn build_frames(delivery: Delivery, msg_id: u32, message: &[u8]) -> Vec<[u8; TUNNEL_DATA_SIZE]> {
    let single_capacity = CONTENT_SIZE - 1 - (1 + delivery.encoded_len() + 2);
    if message.len() <= single_capacity {
        return vec![seal_frame(&[Fragment::Initial {
            delivery,
            msg_id: None,
            payload: message.to_vec(),
        }])];
    }
    let first_capacity = single_capacity - 4; // the fragmented form carries a msg id

    let mut frames = Vec::new();
    let mut offset = first_capacity;
    frames.push(seal_frame(&[Fragment::Initial {
        delivery,
        msg_id: Some(msg_id),
        payload: message[..offset].to_vec(),
    }]));

    let follow_capacity = CONTENT_SIZE - 1 - (1 + 4 + 2);
    let mut fragment_num = 1u8;
    while offset < message.len() {
        let end = (offset + follow_capacity).min(message.len());
        frames.push(seal_frame(&[Fragment::FollowOn {
            msg_id,
            fragment_num,
            is_last: end == message.len(),
            payload: message[offset..end].to_vec(),
        }]));
        offset = end;
        fragment_num += 1;
    }
    frames
}

/// Assemble one cleartext frame from fragment records.
pub fn seal_frame(fragments: &[Fragment]) -> [u8; TUNNEL_DATA_SIZE] {
    let mut records = Vec::with_capacity(CONTENT_SIZE);
    for fragment in fragments {
        fragment.write_to(&mut records);
    }
    debug_assert!(records.len() + 1 <= CONTENT_SIZE, "fragments overflow frame");

    let mut frame = [0u8; TUNNEL_DATA_SIZE];
    rand_bytes(&mut frame[..16]);

    let mut hasher = sha2::Sha256::new();
    hasher.update(&frame[..16]);
    hasher.update(&records);
    let digest = hasher.finalize();
    frame[16..20].copy_from_slice(&digest[..4]);

    // nonzero padding, zero marker, records
    let pad_len = CONTENT_SIZE - 1 - records.len();
    for byte in frame[20..20 + pad_len].iter_mut() {
        *byte = rand_in_range(1..=255u8);
    }
    frame[20 + pad_len] = 0x00;
    frame[21 + pad_len..].copy_from_slice(&records);
    frame
}

/// Parse a cleartext frame back into fragment records, verifying the
/// checksum that detects a tampering intermediary.
pub fn open_frame(frame: &[u8; TUNNEL_DATA_SIZE]) -> Result<Vec<Fragment>> {
    let marker = frame[20..]
        .iter()
        .position(|&b| b == 0x00)
        .ok_or(CoreError::Malformed("tunnel frame missing marker"))?;
    let records = &frame[20 + marker + 1..];

    let mut hasher = sha2::Sha256::new();
    hasher.update(&frame[..16]);
    hasher.update(records);
    let digest = hasher.finalize();
    if digest[..4] != frame[16..20] {
        return Err(CoreError::AuthFailed("tunnel frame checksum"));
    }

    let mut fragments = Vec::new();
    let mut offset = 0;
    while offset < records.len() {
        fragments.push(Fragment::parse(records, &mut offset)?);
    }
    Ok(fragments)
}

struct PartialMessage {
    delivery: Delivery,
    parts: HashMap<u8, Vec<u8>>,
    last: Option<u8>,
    created_at: Instant,
}

/// Reassembles fragmented I2NP messages carried across several frames.
pub struct FragmentReassembler {
    partial: HashMap<u32, PartialMessage>,
}

impl FragmentReassembler {
    pub fn new() -> Self {
        Self {
            partial: HashMap::new(),
        }
    }

    /// Feed one fragment. Complete messages come back as
    /// `(delivery, full payload)`.
    pub fn feed(&mut self, fragment: Fragment) -> Option<(Delivery, Vec<u8>)> {
        match fragment {
            Fragment::Initial {
                delivery,
                msg_id: None,
                payload,
            } => Some((delivery, payload)),
            Fragment::Initial {
                delivery,
                msg_id: Some(msg_id),
                payload,
            } => {
                let entry = self.partial.entry(msg_id).or_insert_with(|| PartialMessage {
                    delivery,
                    parts: HashMap::new(),
                    last: None,
                    created_at: Instant::now(),
                });
                entry.delivery = delivery;
                entry.parts.insert(0, payload);
                self.try_complete(msg_id)
            }
            Fragment::FollowOn {
                msg_id,
                fragment_num,
                is_last,
                payload,
            } => {
                let entry = self.partial.entry(msg_id).or_insert_with(|| PartialMessage {
                    delivery: Delivery::Local,
                    parts: HashMap::new(),
                    last: None,
                    created_at: Instant::now(),
                });
                if is_last {
                    entry.last = Some(fragment_num);
                }
                entry.parts.insert(fragment_num, payload);
                self.try_complete(msg_id)
            }
        }
    }

    fn try_complete(&mut self, msg_id: u32) -> Option<(Delivery, Vec<u8>)> {
        let entry = self.partial.get(&msg_id)?;
        let last = entry.last?;
        if entry.parts.len() != last as usize + 1 {
            return None;
        }
        let entry = self.partial.remove(&msg_id).expect("present");
        let mut payload = Vec::new();
        for i in 0..=last {
            payload.extend_from_slice(entry.parts.get(&i)?);
        }
        Some((entry.delivery, payload))
    }

    pub fn expire(&mut self) {
        let now = Instant::now();
        self.partial
            .retain(|_, m| now.duration_since(m.created_at) < FRAGMENT_TIMEOUT);
    }
}

impl Default for FragmentReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip_single_fragment() {
        let delivery = Delivery::Router(Hash::digest(b"next"));
        let frames = build_frames(delivery, 1, b"a small i2np message");
        assert_eq!(frames.len(), 1);

        let fragments = open_frame(&frames[0]).unwrap();
        assert_eq!(fragments.len(), 1);
        match &fragments[0] {
            Fragment::Initial {
                delivery: d,
                msg_id,
                payload,
            } => {
                assert_eq!(*d, delivery);
                assert!(msg_id.is_none());
                assert_eq!(payload, b"a small i2np message");
            }
            other => panic!("unexpected fragment {other:?}"),
        }
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let frames = build_frames(Delivery::Local, 1, b"payload");
        let mut frame = frames[0];
        frame[500] ^= 0x01;
        match open_frame(&frame) {
            Err(CoreError::AuthFailed(_)) | Err(CoreError::Malformed(_)) => {}
            other => panic!("tampering not detected: {other:?}"),
        }
    }

    #[test]
    fn test_large_message_fragments_and_reassembles() {
        let mut message = vec![0u8; 2800];
        for (i, b) in message.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let delivery = Delivery::Tunnel(Hash::digest(b"gw"), 77);
        let frames = build_frames(delivery, 99, &message);
        assert!(frames.len() > 1);

        let mut reassembler = FragmentReassembler::new();
        let mut complete = None;
        for frame in &frames {
            for fragment in open_frame(frame).unwrap() {
                if let Some(done) = reassembler.feed(fragment) {
                    complete = Some(done);
                }
            }
        }
        let (got_delivery, got_payload) = complete.expect("message should complete");
        assert_eq!(got_delivery, delivery);
        assert_eq!(got_payload, message);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let message = vec![7u8; 2500];
        let frames = build_frames(Delivery::Local, 5, &message);
        let mut fragments: Vec<Fragment> =
            frames.iter().flat_map(|f| open_frame(f).unwrap()).collect();
        fragments.reverse();

        let mut reassembler = FragmentReassembler::new();
        let mut complete = None;
        for fragment in fragments {
            if let Some(done) = reassembler.feed(fragment) {
                complete = Some(done);
            }
        }
        assert_eq!(complete.unwrap().1, message);
    }

    #[test]
    fn test_delivery_variants_roundtrip() {
        for delivery in [
            Delivery::Local,
            Delivery::Tunnel(Hash::digest(b"gw"), 3),
            Delivery::Router(Hash::digest(b"r")),
            Delivery::Destination(Hash::digest(b"d")),
        ] {
            let frames = build_frames(delivery, 1, b"x");
            let fragments = open_frame(&frames[0]).unwrap();
            match &fragments[0] {
                Fragment::Initial { delivery: d, .. } => assert_eq!(*d, delivery),
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
