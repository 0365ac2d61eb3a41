//! GarlicCraft Streaming
//!
//! Reliable in-order byte pipes over the unreliable garlic/tunnel layers:
//! connection state machine, sliding window with selective ACKs, RTO with
//! exponential backoff, and an async read/write/accept surface.

mod packet;
mod stream;

pub use packet::{
    StreamPacket, MAX_PACKET_SIZE, PACKET_FLAG_CLOSE, PACKET_FLAG_RESET,
    PACKET_FLAG_SYNCHRONIZE, STREAMING_MTU,
};
pub use stream::{
    StreamCore, StreamStatus, ACK_SEND_TIMEOUT_MS, INITIAL_RTO_MS, INITIAL_RTT_MS,
    MAX_NUM_RESEND_ATTEMPTS, MAX_WINDOW_SIZE, MIN_WINDOW_SIZE, WINDOW_SIZE,
};

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use garliccraft_core::{CoreError, Hash, Result};
use garliccraft_crypto::rand_u32_nonzero;

/// Payloads above this are gzip-compressed inside the Data message.
pub const COMPRESSION_THRESHOLD: usize = 66;

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// A streaming packet ready to leave through the garlic layer.
#[derive(Debug)]
pub struct OutboundPacket {
    pub to: Hash,
    pub payload: Vec<u8>,
}

/// Gzip-wrap a streaming packet for a Data message when it pays off.
pub fn compress_payload(data: &[u8]) -> Vec<u8> {
    if data.len() <= COMPRESSION_THRESHOLD {
        let mut out = Vec::with_capacity(data.len() + 1);
        out.push(0);
        out.extend_from_slice(data);
        return out;
    }
    let mut encoder = GzEncoder::new(Vec::from([1u8]), Compression::default());
    // the marker byte stays ahead of the gzip stream
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

pub fn decompress_payload(data: &[u8]) -> Result<Vec<u8>> {
    match data.split_first() {
        Some((0, rest)) => Ok(rest.to_vec()),
        Some((1, rest)) => {
            let mut out = Vec::new();
            GzDecoder::new(rest)
                .read_to_end(&mut out)
                .map_err(|_| CoreError::Malformed("bad gzip payload"))?;
            Ok(out)
        }
        _ => Err(CoreError::Malformed("bad payload marker")),
    }
}

struct StreamShared {
    core: Mutex<StreamCore>,
    readable: Notify,
}

/// The application's end of a stream.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<StreamShared>,
    destination: StreamingDestination,
}

impl StreamHandle {
    pub fn remote(&self) -> Hash {
        self.shared.core.lock().expect("stream lock").remote
    }

    pub fn status(&self) -> StreamStatus {
        self.shared.core.lock().expect("stream lock").status
    }

    /// Queue bytes for transmission. Fails once the stream is no longer
    /// writable.
    pub async fn write(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let accepted = {
                let mut core = self.shared.core.lock().expect("stream lock");
                match core.status {
                    StreamStatus::Reset => return Err(CoreError::ConnectionReset),
                    StreamStatus::Closing | StreamStatus::Closed => {
                        return Err(CoreError::Eof)
                    }
                    _ => {}
                }
                let n = core.write(buf);
                core.flush();
                n
            };
            self.destination.pump();
            if accepted == 0 {
                // buffer full: yield until the window drains some of it
                tokio::time::sleep(TICK_INTERVAL).await;
            }
            buf = &buf[accepted..];
        }
        Ok(())
    }

    /// Read some bytes; `Ok(0)` is EOF. Pending reads fail with
    /// `ConnectionReset` when the stream dies.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            {
                let mut core = self.shared.core.lock().expect("stream lock");
                if !core.read_buffer.is_empty() {
                    let n = buf.len().min(core.read_buffer.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = core.read_buffer.pop_front().expect("non-empty");
                    }
                    return Ok(n);
                }
                if core.at_eof() || core.status == StreamStatus::Closed {
                    return Ok(0);
                }
                if core.status == StreamStatus::Reset {
                    return Err(CoreError::ConnectionReset);
                }
            }
            self.shared.readable.notified().await;
        }
    }

    /// Close the send side; delivery of buffered data is still attempted.
    pub async fn close(&self) -> Result<()> {
        {
            let mut core = self.shared.core.lock().expect("stream lock");
            core.close();
            core.flush();
        }
        self.destination.pump();
        Ok(())
    }

    /// Abort, notifying the peer.
    pub fn reset(&self) {
        {
            let mut core = self.shared.core.lock().expect("stream lock");
            core.reset();
        }
        self.shared.readable.notify_one();
        self.destination.pump();
    }
}

struct DestinationInner {
    local: Hash,
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
    accept_tx: mpsc::Sender<StreamHandle>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<StreamHandle>>,
    outbound_tx: mpsc::Sender<OutboundPacket>,
}

/// Per-destination stream table and dispatcher.
#[derive(Clone)]
pub struct StreamingDestination {
    inner: Arc<DestinationInner>,
}

impl StreamingDestination {
    pub fn new(local: Hash) -> (Self, mpsc::Receiver<OutboundPacket>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (accept_tx, accept_rx) = mpsc::channel(64);
        (
            Self {
                inner: Arc::new(DestinationInner {
                    local,
                    streams: Mutex::new(HashMap::new()),
                    accept_tx,
                    accept_rx: tokio::sync::Mutex::new(accept_rx),
                    outbound_tx,
                }),
            },
            outbound_rx,
        )
    }

    /// Drive retransmission and delayed-ACK timers.
    pub fn start(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TICK_INTERVAL);
            loop {
                tick.tick().await;
                this.on_tick();
            }
        });
    }

    /// Open a stream to `remote`.
    pub fn connect(&self, remote: Hash) -> StreamHandle {
        let local_id = rand_u32_nonzero();
        let core = StreamCore::new_outbound(self.inner.local, remote, local_id);
        let shared = Arc::new(StreamShared {
            core: Mutex::new(core),
            readable: Notify::new(),
        });
        self.inner
            .streams
            .lock()
            .expect("streams lock")
            .insert(local_id, shared.clone());
        let handle = StreamHandle {
            shared,
            destination: self.clone(),
        };
        {
            let mut core = handle.shared.core.lock().expect("stream lock");
            core.flush(); // SYN
        }
        self.pump();
        handle
    }

    /// Wait for a peer-initiated stream.
    pub async fn accept(&self) -> Option<StreamHandle> {
        self.inner.accept_rx.lock().await.recv().await
    }

    /// Feed one decompressed streaming packet from the garlic layer.
    pub fn handle_packet(&self, data: &[u8]) -> Result<()> {
        let packet = StreamPacket::decode(data)?;
        let stream = {
            let streams = self.inner.streams.lock().expect("streams lock");
            streams.get(&packet.send_stream_id).cloned()
        };
        match stream {
            Some(shared) => {
                let wake = {
                    let mut core = shared.core.lock().expect("stream lock");
                    let wake = core.handle_packet(&packet);
                    core.flush();
                    wake
                };
                if wake {
                    shared.readable.notify_one();
                }
                self.pump();
                Ok(())
            }
            None if packet.is_syn() => self.accept_stream(packet),
            None => {
                trace!(id = packet.send_stream_id, "packet for unknown stream");
                Err(CoreError::Malformed("unknown stream id"))
            }
        }
    }

    fn accept_stream(&self, packet: StreamPacket) -> Result<()> {
        let Some(from) = packet.from else {
            return Err(CoreError::Malformed("syn without origin"));
        };
        let local_id = rand_u32_nonzero();
        let mut core =
            StreamCore::new_inbound(self.inner.local, from, local_id, packet.recv_stream_id);
        let wake = core.handle_packet(&packet);
        core.flush();
        let shared = Arc::new(StreamShared {
            core: Mutex::new(core),
            readable: Notify::new(),
        });
        self.inner
            .streams
            .lock()
            .expect("streams lock")
            .insert(local_id, shared.clone());
        let handle = StreamHandle {
            shared: shared.clone(),
            destination: self.clone(),
        };
        if wake {
            shared.readable.notify_one();
        }
        self.pump();
        debug!(remote = ?from, "accepted stream");
        if self.inner.accept_tx.try_send(handle).is_err() {
            debug!("accept queue full, resetting inbound stream");
            let mut core = shared.core.lock().expect("stream lock");
            core.reset();
        }
        Ok(())
    }

    /// Move generated packets out through the garlic layer.
    pub fn pump(&self) {
        let mut batches: Vec<(Hash, Vec<StreamPacket>)> = Vec::new();
        {
            let streams = self.inner.streams.lock().expect("streams lock");
            for shared in streams.values() {
                let mut core = shared.core.lock().expect("stream lock");
                if !core.outbound.is_empty() {
                    batches.push((core.remote, core.outbound.drain(..).collect()));
                }
            }
        }
        for (remote, packets) in batches {
            for packet in packets {
                let out = OutboundPacket {
                    to: remote,
                    payload: packet.encode(),
                };
                if self.inner.outbound_tx.try_send(out).is_err() {
                    debug!("streaming outbound queue full, dropping packet");
                }
            }
        }
    }

    fn on_tick(&self) {
        let now = garliccraft_core::now_ms();
        let mut dead: Vec<u32> = Vec::new();
        {
            let streams = self.inner.streams.lock().expect("streams lock");
            for (id, shared) in streams.iter() {
                let mut core = shared.core.lock().expect("stream lock");
                if core.on_tick(now) {
                    shared.readable.notify_one();
                }
                if core.status == StreamStatus::Closed || core.status == StreamStatus::Reset {
                    // leave a grace period for the reader to drain
                    if core.read_buffer.is_empty() {
                        dead.push(*id);
                    }
                    shared.readable.notify_one();
                }
            }
        }
        self.pump();
        if !dead.is_empty() {
            let mut streams = self.inner.streams.lock().expect("streams lock");
            for id in dead {
                streams.remove(&id);
            }
        }
    }

    /// Reset every stream; part of shutdown.
    pub fn shutdown(&self) {
        let streams = self.inner.streams.lock().expect("streams lock");
        for shared in streams.values() {
            let mut core = shared.core.lock().expect("stream lock");
            core.reset();
            shared.readable.notify_one();
        }
        drop(streams);
        self.pump();
    }
}
