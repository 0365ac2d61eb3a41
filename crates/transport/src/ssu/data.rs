//! SSU data payloads: I2NP fragmentation, reassembly, and explicit ACKs.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use garliccraft_core::{CoreError, Result};

/// Fragment payload ceiling, keeping the whole packet under the MTU with
/// header and MAC overhead.
pub const MAX_FRAGMENT_SIZE: usize = 1200;

/// Partially reassembled messages older than this are discarded.
pub const INCOMPLETE_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Unacked fragments are retransmitted at this interval.
pub const RESEND_INTERVAL: Duration = Duration::from_secs(3);

/// A message is abandoned after this many resend rounds.
pub const MAX_RESEND_ATTEMPTS: u8 = 5;

const FLAG_EXPLICIT_ACKS: u8 = 0x80;
const FLAG_ACK_BITFIELDS: u8 = 0x40;

/// A per-fragment acknowledgement: bit `n` of the bitfield covers fragment
/// `n`, seven bits per byte with the high bit as continuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckBitfield {
    pub msg_id: u32,
    pub bitfield: Vec<u8>,
}

impl AckBitfield {
    pub fn full(msg_id: u32, num_fragments: u8) -> Self {
        let mut bitfield = Vec::new();
        let mut remaining = num_fragments as usize;
        while remaining > 0 {
            let bits = remaining.min(7);
            let mut byte = 0u8;
            for i in 0..bits {
                byte |= 1 << i;
            }
            remaining -= bits;
            if remaining > 0 {
                byte |= 0x80;
            }
            bitfield.push(byte);
        }
        if bitfield.is_empty() {
            bitfield.push(0);
        }
        Self { msg_id, bitfield }
    }

    pub fn is_fragment_acked(&self, fragment: u8) -> bool {
        let byte = (fragment / 7) as usize;
        let bit = fragment % 7;
        self.bitfield
            .get(byte)
            .is_some_and(|b| b & (1 << bit) != 0)
    }
}

/// One I2NP fragment on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub msg_id: u32,
    pub num: u8,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// The decoded body of a `Data` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataBody {
    /// Whole messages fully received.
    pub explicit_acks: Vec<u32>,
    pub ack_bitfields: Vec<AckBitfield>,
    pub fragments: Vec<Fragment>,
}

impl DataBody {
    pub fn is_empty(&self) -> bool {
        self.explicit_acks.is_empty() && self.ack_bitfields.is_empty() && self.fragments.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut flags = 0u8;
        if !self.explicit_acks.is_empty() {
            flags |= FLAG_EXPLICIT_ACKS;
        }
        if !self.ack_bitfields.is_empty() {
            flags |= FLAG_ACK_BITFIELDS;
        }
        out.push(flags);
        if !self.explicit_acks.is_empty() {
            out.push(self.explicit_acks.len() as u8);
            for id in &self.explicit_acks {
                out.extend_from_slice(&id.to_be_bytes());
            }
        }
        if !self.ack_bitfields.is_empty() {
            out.push(self.ack_bitfields.len() as u8);
            for ack in &self.ack_bitfields {
                out.extend_from_slice(&ack.msg_id.to_be_bytes());
                out.extend_from_slice(&ack.bitfield);
            }
        }
        out.push(self.fragments.len() as u8);
        for frag in &self.fragments {
            out.extend_from_slice(&frag.msg_id.to_be_bytes());
            out.push((frag.num << 1) | u8::from(frag.is_last));
            out.extend_from_slice(&(frag.data.len() as u16).to_be_bytes());
            out.extend_from_slice(&frag.data);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let flags = *buf
            .get(offset)
            .ok_or(CoreError::Malformed("ssu data truncated"))?;
        offset += 1;

        let mut body = DataBody::default();
        if flags & FLAG_EXPLICIT_ACKS != 0 {
            let count = read_u8(buf, &mut offset)? as usize;
            for _ in 0..count {
                body.explicit_acks.push(read_u32(buf, &mut offset)?);
            }
        }
        if flags & FLAG_ACK_BITFIELDS != 0 {
            let count = read_u8(buf, &mut offset)? as usize;
            for _ in 0..count {
                let msg_id = read_u32(buf, &mut offset)?;
                let mut bitfield = Vec::new();
                loop {
                    let byte = read_u8(buf, &mut offset)?;
                    bitfield.push(byte);
                    if byte & 0x80 == 0 {
                        break;
                    }
                }
                body.ack_bitfields.push(AckBitfield { msg_id, bitfield });
            }
        }
        let num_fragments = read_u8(buf, &mut offset)? as usize;
        for _ in 0..num_fragments {
            let msg_id = read_u32(buf, &mut offset)?;
            let info = read_u8(buf, &mut offset)?;
            let len = read_u16(buf, &mut offset)? as usize;
            if buf.len() < offset + len {
                return Err(CoreError::Malformed("ssu fragment truncated"));
            }
            body.fragments.push(Fragment {
                msg_id,
                num: info >> 1,
                is_last: info & 1 != 0,
                data: buf[offset..offset + len].to_vec(),
            });
            offset += len;
        }
        Ok(body)
    }
}

fn read_u8(buf: &[u8], offset: &mut usize) -> Result<u8> {
    let b = *buf
        .get(*offset)
        .ok_or(CoreError::Malformed("ssu data truncated"))?;
    *offset += 1;
    Ok(b)
}

fn read_u16(buf: &[u8], offset: &mut usize) -> Result<u16> {
    if buf.len() < *offset + 2 {
        return Err(CoreError::Malformed("ssu data truncated"));
    }
    let v = u16::from_be_bytes(buf[*offset..*offset + 2].try_into().expect("fixed"));
    *offset += 2;
    Ok(v)
}

fn read_u32(buf: &[u8], offset: &mut usize) -> Result<u32> {
    if buf.len() < *offset + 4 {
        return Err(CoreError::Malformed("ssu data truncated"));
    }
    let v = u32::from_be_bytes(buf[*offset..*offset + 4].try_into().expect("fixed"));
    *offset += 4;
    Ok(v)
}

/// Split an encoded I2NP message into fragments.
pub fn fragment_message(msg_id: u32, encoded: &[u8]) -> Vec<Fragment> {
    let chunks: Vec<&[u8]> = encoded.chunks(MAX_FRAGMENT_SIZE).collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Fragment {
            msg_id,
            num: i as u8,
            is_last: i == last,
            data: chunk.to_vec(),
        })
        .collect()
}

struct IncompleteMessage {
    fragments: BTreeMap<u8, Vec<u8>>,
    last_fragment: Option<u8>,
    created_at: Instant,
}

/// Receive-side reassembly with duplicate suppression.
pub struct Reassembler {
    incomplete: HashMap<u32, IncompleteMessage>,
    completed: HashSet<u32>,
    completed_order: VecDeque<u32>,
}

const COMPLETED_MEMORY: usize = 1000;

impl Reassembler {
    pub fn new() -> Self {
        Self {
            incomplete: HashMap::new(),
            completed: HashSet::new(),
            completed_order: VecDeque::new(),
        }
    }

    /// Feed one fragment; returns the whole message when it completes.
    pub fn handle_fragment(&mut self, frag: Fragment) -> Result<Option<Vec<u8>>> {
        if self.completed.contains(&frag.msg_id) {
            return Err(CoreError::Duplicate);
        }
        let entry = self
            .incomplete
            .entry(frag.msg_id)
            .or_insert_with(|| IncompleteMessage {
                fragments: BTreeMap::new(),
                last_fragment: None,
                created_at: Instant::now(),
            });
        if frag.is_last {
            entry.last_fragment = Some(frag.num);
        }
        entry.fragments.insert(frag.num, frag.data);

        let Some(last) = entry.last_fragment else {
            return Ok(None);
        };
        if entry.fragments.len() != last as usize + 1 {
            return Ok(None);
        }
        let entry = self.incomplete.remove(&frag.msg_id).expect("present");
        let mut out = Vec::new();
        for (_, data) in entry.fragments {
            out.extend_from_slice(&data);
        }
        self.remember_completed(frag.msg_id);
        Ok(Some(out))
    }

    /// Bitfield of fragments actually seen so far for `msg_id`.
    pub fn received_bitfield(&self, msg_id: u32) -> AckBitfield {
        let mut bitfield = vec![0u8];
        if let Some(m) = self.incomplete.get(&msg_id) {
            for &num in m.fragments.keys() {
                let byte = (num / 7) as usize;
                while bitfield.len() <= byte {
                    let last = bitfield.len() - 1;
                    bitfield[last] |= 0x80;
                    bitfield.push(0);
                }
                bitfield[byte] |= 1 << (num % 7);
            }
        }
        AckBitfield { msg_id, bitfield }
    }

    /// Drop partial messages past the 30-second horizon.
    pub fn expire(&mut self) {
        let now = Instant::now();
        self.incomplete
            .retain(|_, m| now.duration_since(m.created_at) < INCOMPLETE_MESSAGE_TIMEOUT);
    }

    fn remember_completed(&mut self, msg_id: u32) {
        if self.completed.insert(msg_id) {
            self.completed_order.push_back(msg_id);
            if self.completed_order.len() > COMPLETED_MEMORY {
                if let Some(old) = self.completed_order.pop_front() {
                    self.completed.remove(&old);
                }
            }
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Send-side bookkeeping: unacked fragments and resend scheduling.
pub struct ResendQueue {
    pending: HashMap<u32, PendingMessage>,
}

struct PendingMessage {
    fragments: Vec<Fragment>,
    acked: Vec<bool>,
    last_send: Instant,
    attempts: u8,
}

impl ResendQueue {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn track(&mut self, fragments: Vec<Fragment>) {
        if let Some(first) = fragments.first() {
            let acked = vec![false; fragments.len()];
            self.pending.insert(
                first.msg_id,
                PendingMessage {
                    fragments,
                    acked,
                    last_send: Instant::now(),
                    attempts: 0,
                },
            );
        }
    }

    pub fn ack_message(&mut self, msg_id: u32) {
        self.pending.remove(&msg_id);
    }

    pub fn ack_fragments(&mut self, ack: &AckBitfield) {
        let done = if let Some(pending) = self.pending.get_mut(&ack.msg_id) {
            for (i, flag) in pending.acked.iter_mut().enumerate() {
                if ack.is_fragment_acked(i as u8) {
                    *flag = true;
                }
            }
            pending.acked.iter().all(|&a| a)
        } else {
            false
        };
        if done {
            self.pending.remove(&ack.msg_id);
        }
    }

    /// Fragments due for retransmission; messages out of attempts are
    /// dropped silently (tunnel-layer reliability is not guaranteed).
    pub fn due_for_resend(&mut self) -> Vec<Fragment> {
        let now = Instant::now();
        let mut out = Vec::new();
        self.pending.retain(|_, pending| {
            if now.duration_since(pending.last_send) < RESEND_INTERVAL {
                return true;
            }
            if pending.attempts >= MAX_RESEND_ATTEMPTS {
                return false;
            }
            pending.attempts += 1;
            pending.last_send = now;
            for (frag, acked) in pending.fragments.iter().zip(&pending.acked) {
                if !acked {
                    out.push(frag.clone());
                }
            }
            true
        });
        out
    }
}

impl Default for ResendQueue {
    fn default() -> Self {
        Self::new()
    }
}
