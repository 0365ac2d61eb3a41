//! Streaming packet codec.
//!
//! `sendStreamID u32 || recvStreamID u32 || seqNum u32 || ackThrough u32 ||
//! nackCount u8 || nacks u32[] || resendDelay u8 || flags u16 || optionSize u16
//! || options || payload`.

use garliccraft_core::{CoreError, Hash, Result};

pub const PACKET_FLAG_SYNCHRONIZE: u16 = 0x0001;
pub const PACKET_FLAG_CLOSE: u16 = 0x0002;
pub const PACKET_FLAG_RESET: u16 = 0x0004;
pub const PACKET_FLAG_SIGNATURE_INCLUDED: u16 = 0x0008;
pub const PACKET_FLAG_SIGNATURE_REQUESTED: u16 = 0x0010;
pub const PACKET_FLAG_FROM_INCLUDED: u16 = 0x0020;
pub const PACKET_FLAG_DELAY_REQUESTED: u16 = 0x0040;
pub const PACKET_FLAG_MAX_PACKET_SIZE_INCLUDED: u16 = 0x0080;
pub const PACKET_FLAG_PROFILE_INTERACTIVE: u16 = 0x0100;
pub const PACKET_FLAG_ECHO: u16 = 0x0200;
pub const PACKET_FLAG_NO_ACK: u16 = 0x0400;

/// Payload ceiling per packet.
pub const STREAMING_MTU: usize = 1730;

/// Absolute packet ceiling.
pub const MAX_PACKET_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPacket {
    pub send_stream_id: u32,
    pub recv_stream_id: u32,
    pub seq_num: u32,
    pub ack_through: u32,
    pub nacks: Vec<u32>,
    pub resend_delay: u8,
    pub flags: u16,
    /// The sender's destination hash when FROM_INCLUDED is set.
    pub from: Option<Hash>,
    pub payload: Vec<u8>,
}

impl StreamPacket {
    pub fn is_syn(&self) -> bool {
        self.flags & PACKET_FLAG_SYNCHRONIZE != 0
    }

    pub fn is_close(&self) -> bool {
        self.flags & PACKET_FLAG_CLOSE != 0
    }

    pub fn is_reset(&self) -> bool {
        self.flags & PACKET_FLAG_RESET != 0
    }

    pub fn is_no_ack(&self) -> bool {
        self.flags & PACKET_FLAG_NO_ACK != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = self.flags;
        if self.from.is_some() {
            flags |= PACKET_FLAG_FROM_INCLUDED;
        }
        let option_size: u16 = if self.from.is_some() { 32 } else { 0 };

        let mut out = Vec::with_capacity(22 + self.nacks.len() * 4 + self.payload.len());
        out.extend_from_slice(&self.send_stream_id.to_be_bytes());
        out.extend_from_slice(&self.recv_stream_id.to_be_bytes());
        out.extend_from_slice(&self.seq_num.to_be_bytes());
        out.extend_from_slice(&self.ack_through.to_be_bytes());
        out.push(self.nacks.len() as u8);
        for nack in &self.nacks {
            out.extend_from_slice(&nack.to_be_bytes());
        }
        out.push(self.resend_delay);
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&option_size.to_be_bytes());
        if let Some(from) = &self.from {
            out.extend_from_slice(from.as_bytes());
        }
        out.extend_from_slice(&self.payload);
        debug_assert!(out.len() <= MAX_PACKET_SIZE);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() > MAX_PACKET_SIZE {
            return Err(CoreError::Malformed("stream packet oversized"));
        }
        if buf.len() < 22 {
            return Err(CoreError::Malformed("stream packet truncated"));
        }
        let send_stream_id = u32::from_be_bytes(buf[0..4].try_into().expect("fixed"));
        let recv_stream_id = u32::from_be_bytes(buf[4..8].try_into().expect("fixed"));
        let seq_num = u32::from_be_bytes(buf[8..12].try_into().expect("fixed"));
        let ack_through = u32::from_be_bytes(buf[12..16].try_into().expect("fixed"));
        let nack_count = buf[16] as usize;
        let mut offset = 17;
        if buf.len() < offset + nack_count * 4 + 5 {
            return Err(CoreError::Malformed("stream packet truncated"));
        }
        let mut nacks = Vec::with_capacity(nack_count);
        for _ in 0..nack_count {
            nacks.push(u32::from_be_bytes(
                buf[offset..offset + 4].try_into().expect("fixed"),
            ));
            offset += 4;
        }
        let resend_delay = buf[offset];
        offset += 1;
        let flags = u16::from_be_bytes(buf[offset..offset + 2].try_into().expect("fixed"));
        offset += 2;
        let option_size =
            u16::from_be_bytes(buf[offset..offset + 2].try_into().expect("fixed")) as usize;
        offset += 2;
        if buf.len() < offset + option_size {
            return Err(CoreError::Malformed("stream packet options truncated"));
        }
        let from = if flags & PACKET_FLAG_FROM_INCLUDED != 0 {
            if option_size < 32 {
                return Err(CoreError::Malformed("from option truncated"));
            }
            Some(Hash::from_slice(&buf[offset..offset + 32]).expect("fixed slice"))
        } else {
            None
        };
        offset += option_size;
        Ok(Self {
            send_stream_id,
            recv_stream_id,
            seq_num,
            ack_through,
            nacks,
            resend_delay,
            flags,
            from,
            payload: buf[offset..].to_vec(),
        })
    }
}
