//! The per-stream state machine: sliding window, selective ACK, RTT/RTO
//! estimation, retransmission, and the close handshake.

use std::collections::{BTreeMap, VecDeque};

use garliccraft_core::{now_ms, Hash};

use crate::packet::{
    StreamPacket, PACKET_FLAG_CLOSE, PACKET_FLAG_RESET, PACKET_FLAG_SYNCHRONIZE, STREAMING_MTU,
};

pub const WINDOW_SIZE: usize = 6;
pub const MIN_WINDOW_SIZE: usize = 1;
pub const MAX_WINDOW_SIZE: usize = 128;
pub const INITIAL_RTT_MS: u64 = 8000;
pub const INITIAL_RTO_MS: u64 = 9000;
pub const MAX_RTO_MS: u64 = 60_000;
pub const MIN_RTO_MS: u64 = 100;
pub const ACK_SEND_TIMEOUT_MS: u64 = 200;
pub const MAX_NUM_RESEND_ATTEMPTS: u8 = 6;

/// Bytes buffered for write before the writer is pushed back.
pub const MAX_SEND_BUFFER: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    New,
    Open,
    Reset,
    Closing,
    Closed,
}

struct SentPacket {
    packet: StreamPacket,
    first_sent_at: u64,
    last_sent_at: u64,
    resent: bool,
}

/// The lock-protected core of one stream. All transitions happen here; the
/// async handle and the destination pump drive it.
pub struct StreamCore {
    /// Our id: inbound packets carry it as sendStreamID.
    pub local_id: u32,
    /// Peer's id: we put it in outbound sendStreamID. Zero until learned.
    pub remote_id: u32,
    pub remote: Hash,
    pub local: Hash,
    pub status: StreamStatus,

    send_buffer: VecDeque<u8>,
    next_seq: u32,
    sent: BTreeMap<u32, SentPacket>,
    window: usize,
    rtt_ms: f64,
    rto_ms: u64,
    resend_attempts: u8,

    recv_next: u32,
    out_of_order: BTreeMap<u32, Vec<u8>>,
    pub read_buffer: VecDeque<u8>,
    remote_close_seq: Option<u32>,

    syn_queued: bool,
    close_queued: bool,
    close_sent_seq: Option<u32>,
    pending_ack: bool,
    pending_ack_since: u64,

    /// Packets generated and awaiting the destination pump.
    pub outbound: Vec<StreamPacket>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl StreamCore {
    /// Initiating side: queues the SYN.
    pub fn new_outbound(local: Hash, remote: Hash, local_id: u32) -> Self {
        let mut core = Self::blank(local, remote, local_id);
        core.syn_queued = true;
        core
    }

    /// Accepting side, from a received SYN.
    pub fn new_inbound(local: Hash, remote: Hash, local_id: u32, remote_id: u32) -> Self {
        let mut core = Self::blank(local, remote, local_id);
        core.remote_id = remote_id;
        core.status = StreamStatus::Open;
        core
    }

    fn blank(local: Hash, remote: Hash, local_id: u32) -> Self {
        Self {
            local_id,
            remote_id: 0,
            remote,
            local,
            status: StreamStatus::New,
            send_buffer: VecDeque::new(),
            next_seq: 0,
            sent: BTreeMap::new(),
            window: WINDOW_SIZE,
            rtt_ms: INITIAL_RTT_MS as f64,
            rto_ms: INITIAL_RTO_MS,
            resend_attempts: 0,
            recv_next: 0,
            out_of_order: BTreeMap::new(),
            read_buffer: VecDeque::new(),
            remote_close_seq: None,
            syn_queued: false,
            close_queued: false,
            close_sent_seq: None,
            pending_ack: false,
            pending_ack_since: 0,
            outbound: Vec::new(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window
    }

    pub fn rto_ms(&self) -> u64 {
        self.rto_ms
    }

    pub fn is_write_open(&self) -> bool {
        matches!(self.status, StreamStatus::New | StreamStatus::Open)
    }

    /// EOF: the peer closed and every byte up to its close is consumed.
    pub fn at_eof(&self) -> bool {
        match self.remote_close_seq {
            Some(close_seq) => self.recv_next > close_seq && self.read_buffer.is_empty(),
            None => false,
        }
    }

    /// Queue application bytes; returns how many were accepted.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        if !self.is_write_open() {
            return 0;
        }
        let room = MAX_SEND_BUFFER.saturating_sub(self.send_buffer.len());
        let take = buf.len().min(room);
        self.send_buffer.extend(&buf[..take]);
        take
    }

    /// Ask for the stream to close once the buffer drains.
    pub fn close(&mut self) {
        if matches!(self.status, StreamStatus::New | StreamStatus::Open) {
            self.status = StreamStatus::Closing;
            self.close_queued = true;
        }
    }

    /// Hard reset, surfaced to the peer and to any pending read.
    pub fn reset(&mut self) {
        if self.status != StreamStatus::Reset && self.status != StreamStatus::Closed {
            self.status = StreamStatus::Reset;
            let packet = self.base_packet(0, PACKET_FLAG_RESET);
            self.outbound.push(packet);
        }
    }

    /// Process one inbound packet. Returns true when the reader should be
    /// woken.
    pub fn handle_packet(&mut self, packet: &StreamPacket) -> bool {
        let now = now_ms();
        if packet.is_reset() {
            self.status = StreamStatus::Reset;
            return true;
        }
        if self.remote_id == 0 && packet.recv_stream_id != 0 {
            self.remote_id = packet.recv_stream_id;
        }
        if self.status == StreamStatus::New {
            self.status = StreamStatus::Open;
        }

        self.process_acks(packet, now);

        let is_data = packet.is_syn() || !packet.payload.is_empty() || packet.is_close();
        let mut wake_reader = false;
        if is_data {
            if packet.is_close() {
                self.remote_close_seq = Some(packet.seq_num);
            }
            if packet.seq_num >= self.recv_next
                && !self.out_of_order.contains_key(&packet.seq_num)
            {
                self.out_of_order
                    .insert(packet.seq_num, packet.payload.clone());
            }
            // drain the contiguous prefix into the read buffer
            while let Some(payload) = self.out_of_order.remove(&self.recv_next) {
                self.bytes_received += payload.len() as u64;
                self.read_buffer.extend(payload);
                self.recv_next += 1;
                wake_reader = true;
            }
            if packet.is_syn() || packet.is_close() {
                // connection-control packets are acked without delay
                self.queue_plain_ack();
            } else if !self.pending_ack {
                self.pending_ack = true;
                self.pending_ack_since = now;
            }
        }

        // peer's close fully delivered: answer with ours and finish
        if let Some(close_seq) = self.remote_close_seq {
            if self.recv_next > close_seq {
                wake_reader = true;
                if self.close_sent_seq.is_none() {
                    self.close_queued = true;
                }
                if self.status == StreamStatus::Closing || self.status == StreamStatus::Open {
                    // our own close either already acked or about to flush
                    if self.sent.is_empty() && self.send_buffer.is_empty() && !self.close_queued {
                        self.status = StreamStatus::Closed;
                    }
                }
            }
        }
        // everything we sent (including a close) has been acked
        if self.status == StreamStatus::Closing
            && self.close_sent_seq.is_some()
            && self.sent.is_empty()
            && self.send_buffer.is_empty()
            && self.remote_close_seq.map_or(true, |s| self.recv_next > s)
        {
            self.status = StreamStatus::Closed;
        }
        wake_reader
    }

    fn process_acks(&mut self, packet: &StreamPacket, now: u64) {
        let ack_through = packet.ack_through;
        let mut acked_any = false;
        let acked: Vec<u32> = self
            .sent
            .keys()
            .filter(|&&seq| seq <= ack_through && !packet.nacks.contains(&seq))
            .copied()
            .collect();
        for seq in acked {
            if let Some(sent) = self.sent.remove(&seq) {
                acked_any = true;
                if !sent.resent {
                    let sample = (now - sent.first_sent_at) as f64;
                    self.rtt_ms = 0.875 * self.rtt_ms + 0.125 * sample;
                    self.rto_ms =
                        ((self.rtt_ms * 2.0) as u64).clamp(MIN_RTO_MS, MAX_RTO_MS);
                }
                if sent.packet.is_close() {
                    // FIN acked
                    if self.remote_close_seq.map_or(false, |s| self.recv_next > s) {
                        self.status = StreamStatus::Closed;
                    }
                }
            }
        }
        if acked_any {
            self.resend_attempts = 0;
            if self.window < MAX_WINDOW_SIZE {
                self.window += 1;
            }
        }
    }

    /// Move sendable bytes (and SYN/CLOSE) into packets, respecting the
    /// window.
    pub fn flush(&mut self) {
        let now = now_ms();
        if self.status == StreamStatus::Reset || self.status == StreamStatus::Closed {
            return;
        }
        while self.sent.len() < self.window {
            let mut flags = 0u16;
            let mut from = None;
            if self.syn_queued {
                flags |= PACKET_FLAG_SYNCHRONIZE;
                from = Some(self.local);
            }
            let chunk_len = self.send_buffer.len().min(STREAMING_MTU);
            let last_data = chunk_len == self.send_buffer.len();
            if self.close_queued && last_data {
                flags |= PACKET_FLAG_CLOSE;
            }
            if flags == 0 && chunk_len == 0 {
                break;
            }
            let payload: Vec<u8> = self.send_buffer.drain(..chunk_len).collect();
            self.bytes_sent += payload.len() as u64;
            let seq = self.next_seq;
            self.next_seq += 1;
            let mut packet = self.base_packet(seq, flags);
            packet.payload = payload;
            packet.from = from;

            if self.syn_queued {
                self.syn_queued = false;
            }
            if flags & PACKET_FLAG_CLOSE != 0 {
                self.close_queued = false;
                self.close_sent_seq = Some(seq);
            }
            self.sent.insert(
                seq,
                SentPacket {
                    packet: packet.clone(),
                    first_sent_at: now,
                    last_sent_at: now,
                    resent: false,
                },
            );
            self.outbound.push(packet);
        }
    }

    /// Timer pass: retransmission and delayed ACKs. Returns true when the
    /// stream just died (reset) and waiters must be woken.
    pub fn on_tick(&mut self, now: u64) -> bool {
        if matches!(self.status, StreamStatus::Reset | StreamStatus::Closed) {
            return false;
        }
        // retransmission
        let due: Vec<u32> = self
            .sent
            .iter()
            .filter(|(_, s)| now >= s.last_sent_at + self.rto_ms)
            .map(|(&seq, _)| seq)
            .collect();
        if !due.is_empty() {
            self.resend_attempts += 1;
            if self.resend_attempts > MAX_NUM_RESEND_ATTEMPTS {
                self.status = StreamStatus::Reset;
                let reset = self.base_packet(0, PACKET_FLAG_RESET);
                self.outbound.push(reset);
                return true;
            }
            // exponential backoff, window halves
            self.rto_ms = (self.rto_ms * 2).min(MAX_RTO_MS);
            self.window = (self.window / 2).max(MIN_WINDOW_SIZE);
            let ack_through = self.ack_through();
            let mut resends = Vec::with_capacity(due.len());
            for seq in due {
                if let Some(sent) = self.sent.get_mut(&seq) {
                    sent.last_sent_at = now;
                    sent.resent = true;
                    let mut packet = sent.packet.clone();
                    packet.ack_through = ack_through;
                    resends.push(packet);
                }
            }
            self.outbound.extend(resends);
        }
        // delayed ack
        if self.pending_ack && now >= self.pending_ack_since + ACK_SEND_TIMEOUT_MS {
            self.queue_plain_ack();
        }
        false
    }

    /// Attach ACK state to a packet leaving now, or emit a bare ACK packet.
    pub fn queue_plain_ack(&mut self) {
        self.pending_ack = false;
        let packet = self.base_packet(0, 0);
        self.outbound.push(packet);
    }

    fn ack_through(&self) -> u32 {
        self.recv_next.saturating_sub(1)
    }

    fn nacks(&self) -> Vec<u32> {
        // holes between the contiguous prefix and the highest seen seq
        let Some(&highest) = self.out_of_order.keys().next_back() else {
            return Vec::new();
        };
        (self.recv_next..highest)
            .filter(|seq| !self.out_of_order.contains_key(seq))
            .take(255)
            .collect()
    }

    fn base_packet(&mut self, seq: u32, flags: u16) -> StreamPacket {
        // every outbound packet carries the current ack state
        self.pending_ack = false;
        StreamPacket {
            send_stream_id: self.remote_id,
            recv_stream_id: self.local_id,
            seq_num: seq,
            ack_through: self.ack_through(),
            nacks: self.nacks(),
            resend_delay: 0,
            flags,
            from: None,
            payload: Vec::new(),
        }
    }
}
