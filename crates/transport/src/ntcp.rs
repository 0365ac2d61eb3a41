//! NTCP, the TCP transport.
//!
//! A symmetric 4-phase DH handshake establishes a session-long AES-256-CBC
//! stream in each direction; frames are `size u16 || payload || pad-to-16 ||
//! adler32`, all inside the CBC stream. A zero size is a keep-alive.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use garliccraft_core::i2np::I2npMessage;
use garliccraft_core::{now_secs, CoreError, Hash, Result, RouterIdentity, RouterInfo, TransportStyle};
use garliccraft_crypto::{rand_bytes, CbcDecryptor, CbcEncryptor};

use crate::session::{InboundMessage, SessionCommand, SessionHandle, TransportKind};
use crate::{TransportsInner, SESSION_CREATION_TIMEOUT};

const NTCP_MAX_MESSAGE_SIZE: usize = 16 * 1024;
const NTCP_TERMINATION_TIMEOUT: Duration = Duration::from_secs(120);
const NTCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const NTCP_MAX_CLOCK_SKEW_SECS: u64 = 120;
const BAD_FRAMES_BEFORE_TERMINATION: u32 = 3;

const PHASE1_SIZE: usize = 256 + 32;
const PHASE2_SIZE: usize = 256 + 48;

fn align16(n: usize) -> usize {
    (n + 15) & !15
}

/// Bytes both parties sign: X || Y || H(peer) || tsA || tsB.
fn signed_data(x: &[u8; 256], y: &[u8; 256], peer: &Hash, ts_a: u32, ts_b: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + 256 + 32 + 8);
    out.extend_from_slice(x);
    out.extend_from_slice(y);
    out.extend_from_slice(peer.as_bytes());
    out.extend_from_slice(&ts_a.to_be_bytes());
    out.extend_from_slice(&ts_b.to_be_bytes());
    out
}

fn check_clock_skew(ts: u32) -> Result<()> {
    let now = now_secs();
    let skew = (now as i64 - ts as i64).unsigned_abs();
    if skew > NTCP_MAX_CLOCK_SKEW_SECS {
        return Err(CoreError::AuthFailed("handshake clock skew"));
    }
    Ok(())
}

pub struct NtcpServer {
    inner: Arc<TransportsInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl NtcpServer {
    pub(crate) fn new(inner: Arc<TransportsInner>) -> Self {
        Self {
            inner,
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("addr lock")
    }

    pub async fn start(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        *self.local_addr.lock().expect("addr lock") = Some(listener.local_addr()?);
        let server = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        if server.inner.is_banned(&peer_addr.ip()) {
                            debug!(%peer_addr, "refusing banned address");
                            continue;
                        }
                        let server = server.clone();
                        tokio::spawn(async move {
                            if let Err(err) = server.handle_inbound(stream, peer_addr).await {
                                debug!(%peer_addr, %err, "inbound ntcp handshake failed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(%err, "ntcp accept failed");
                        break;
                    }
                }
            }
        });
        *self.accept_task.lock().expect("task lock") = Some(task);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(task) = self.accept_task.lock().expect("task lock").take() {
            task.abort();
        }
    }

    /// Originate a session to `router` (handshake phases 1 and 3).
    pub async fn connect(self: &Arc<Self>, router: Arc<RouterInfo>) -> Result<()> {
        let addr = router
            .address(TransportStyle::Ntcp)
            .ok_or(CoreError::Unreachable)?;
        let sock_addr: SocketAddr = format!("{}:{}", addr.host, addr.port)
            .parse()
            .map_err(|_| CoreError::Malformed("bad ntcp address"))?;

        let stream = tokio::time::timeout(SESSION_CREATION_TIMEOUT, TcpStream::connect(sock_addr))
            .await
            .map_err(|_| CoreError::Timeout("ntcp connect"))??;
        stream.set_nodelay(true)?;

        let result = tokio::time::timeout(
            SESSION_CREATION_TIMEOUT,
            self.handshake_originator(stream, &router),
        )
        .await
        .map_err(|_| CoreError::Timeout("ntcp handshake"))?;

        match result {
            Ok((stream, encryptor, decryptor)) => {
                self.spawn_session(stream, router.identity().clone(), encryptor, decryptor);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn handshake_originator(
        &self,
        mut stream: TcpStream,
        router: &RouterInfo,
    ) -> Result<(TcpStream, CbcEncryptor, CbcDecryptor)> {
        let dh = self.inner.dh_supplier.acquire();
        let remote_hash = router.hash();

        // Phase 1: X || H(X) ⊕ H(B)
        let mut phase1 = [0u8; PHASE1_SIZE];
        phase1[..256].copy_from_slice(&dh.pub_key);
        let hx = Hash::digest(&dh.pub_key);
        for i in 0..32 {
            phase1[256 + i] = hx.0[i] ^ remote_hash.0[i];
        }
        stream.write_all(&phase1).await?;

        // Phase 2: Y || enc{ H(X||Y) || tsB || padding }
        let mut phase2 = [0u8; PHASE2_SIZE];
        stream.read_exact(&mut phase2).await?;
        let mut y = [0u8; 256];
        y.copy_from_slice(&phase2[..256]);
        let shared = dh.agree(&y);
        let session_key = garliccraft_crypto::derive_ntcp_session_key(&shared)?;

        let mut decryptor = CbcDecryptor::new(&session_key, y[240..256].try_into().expect("fixed"));
        let mut enc_part = [0u8; 48];
        enc_part.copy_from_slice(&phase2[256..]);
        // phase 3 chains off the phase 2 ciphertext tail
        let phase2_tail: [u8; 16] = phase2[PHASE2_SIZE - 16..].try_into().expect("fixed");
        decryptor.decrypt(&mut enc_part);

        let mut xy = Vec::with_capacity(512);
        xy.extend_from_slice(&dh.pub_key);
        xy.extend_from_slice(&y);
        if Hash::digest(&xy).0 != enc_part[..32] {
            return Err(CoreError::AuthFailed("phase 2 hash mismatch"));
        }
        let ts_b = u32::from_be_bytes(enc_part[32..36].try_into().expect("fixed"));
        check_clock_skew(ts_b)?;

        // Phase 3: enc{ size || A.identity || tsA || padding || sig }
        let ts_a = now_secs() as u32;
        let ident_bytes = self.inner.config.keys.identity().to_bytes();
        let sig = self
            .inner
            .config
            .keys
            .sign(&signed_data(&dh.pub_key, &y, &remote_hash, ts_a, ts_b));
        let raw_len = 2 + ident_bytes.len() + 4 + sig.len();
        let mut phase3 = vec![0u8; align16(raw_len)];
        phase3[..2].copy_from_slice(&(ident_bytes.len() as u16).to_be_bytes());
        phase3[2..2 + ident_bytes.len()].copy_from_slice(&ident_bytes);
        phase3[2 + ident_bytes.len()..2 + ident_bytes.len() + 4]
            .copy_from_slice(&ts_a.to_be_bytes());
        let sig_start = phase3.len() - sig.len();
        rand_bytes(&mut phase3[2 + ident_bytes.len() + 4..sig_start]);
        phase3[sig_start..].copy_from_slice(&sig);

        let mut encryptor = CbcEncryptor::new(&session_key, &phase2_tail);
        encryptor.encrypt(&mut phase3);
        stream.write_all(&phase3).await?;

        // Phase 4: enc{ sig || padding }
        let sig_len = router.identity().signing_key().sig_type().sig_len();
        let mut phase4 = vec![0u8; align16(sig_len)];
        stream.read_exact(&mut phase4).await?;
        decryptor.decrypt(&mut phase4);
        router.identity().verify(
            &signed_data(
                &dh.pub_key,
                &y,
                &self.inner.config.keys.hash(),
                ts_a,
                ts_b,
            ),
            &phase4[..sig_len],
        )?;

        Ok((stream, encryptor, decryptor))
    }

    /// Accept a session (handshake phases 2 and 4).
    async fn handle_inbound(
        self: &Arc<Self>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let result = tokio::time::timeout(
            SESSION_CREATION_TIMEOUT,
            self.handshake_responder(&mut stream),
        )
        .await
        .map_err(|_| CoreError::Timeout("ntcp handshake"))?;

        match result {
            Ok((remote, encryptor, decryptor)) => {
                self.spawn_session(stream, remote, encryptor, decryptor);
                Ok(())
            }
            Err(err) => {
                if matches!(err, CoreError::AuthFailed(_)) {
                    self.inner.ban(peer_addr.ip());
                }
                Err(err)
            }
        }
    }

    async fn handshake_responder(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(RouterIdentity, CbcEncryptor, CbcDecryptor)> {
        // Phase 1
        let mut phase1 = [0u8; PHASE1_SIZE];
        stream.read_exact(&mut phase1).await?;
        let mut x = [0u8; 256];
        x.copy_from_slice(&phase1[..256]);
        let hx = Hash::digest(&x);
        let our_hash = self.inner.config.keys.hash();
        for i in 0..32 {
            if phase1[256 + i] != hx.0[i] ^ our_hash.0[i] {
                return Err(CoreError::AuthFailed("phase 1 addressed to other router"));
            }
        }

        // Phase 2
        let dh = self.inner.dh_supplier.acquire();
        let shared = dh.agree(&x);
        let session_key = garliccraft_crypto::derive_ntcp_session_key(&shared)?;
        let ts_b = now_secs() as u32;

        let mut xy = Vec::with_capacity(512);
        xy.extend_from_slice(&x);
        xy.extend_from_slice(&dh.pub_key);
        let hxy = Hash::digest(&xy);

        let mut enc_part = [0u8; 48];
        enc_part[..32].copy_from_slice(&hxy.0);
        enc_part[32..36].copy_from_slice(&ts_b.to_be_bytes());
        rand_bytes(&mut enc_part[36..]);

        let y_tail: [u8; 16] = dh.pub_key[240..256].try_into().expect("fixed");
        let mut encryptor = CbcEncryptor::new(&session_key, &y_tail);
        encryptor.encrypt(&mut enc_part);

        let mut phase2 = [0u8; PHASE2_SIZE];
        phase2[..256].copy_from_slice(&dh.pub_key);
        phase2[256..].copy_from_slice(&enc_part);
        stream.write_all(&phase2).await?;

        // the initiator chains phase 3 off our phase 2 ciphertext tail
        let phase2_tail: [u8; 16] = phase2[PHASE2_SIZE - 16..].try_into().expect("fixed");
        let mut decryptor = CbcDecryptor::new(&session_key, &phase2_tail);

        // Phase 3: default-sized read first, then the remainder once the
        // identity (and so the signature length) is known
        let mut phase3 = vec![0u8; 448];
        stream.read_exact(&mut phase3).await?;
        decryptor.decrypt(&mut phase3);
        let ident_len = u16::from_be_bytes(phase3[..2].try_into().expect("fixed")) as usize;
        if ident_len < 387 || ident_len > 1024 {
            return Err(CoreError::Malformed("phase 3 identity size"));
        }
        // ensure the identity itself is fully buffered
        while phase3.len() < align16(2 + ident_len + 4) {
            let mut block = [0u8; 16];
            stream.read_exact(&mut block).await?;
            decryptor.decrypt(&mut block);
            phase3.extend_from_slice(&block);
        }
        let (remote_ident, _) = RouterIdentity::from_bytes(&phase3[2..2 + ident_len])?;
        let sig_len = remote_ident.signing_key().sig_type().sig_len();
        let total = align16(2 + ident_len + 4 + sig_len);
        while phase3.len() < total {
            let mut block = [0u8; 16];
            stream.read_exact(&mut block).await?;
            decryptor.decrypt(&mut block);
            phase3.extend_from_slice(&block);
        }
        let ts_a = u32::from_be_bytes(
            phase3[2 + ident_len..2 + ident_len + 4]
                .try_into()
                .expect("fixed"),
        );
        check_clock_skew(ts_a)?;
        remote_ident.verify(
            &signed_data(&x, &dh.pub_key, &our_hash, ts_a, ts_b),
            &phase3[total - sig_len..total],
        )?;

        // Phase 4
        let sig = self.inner.config.keys.sign(&signed_data(
            &x,
            &dh.pub_key,
            &remote_ident.hash(),
            ts_a,
            ts_b,
        ));
        let mut phase4 = vec![0u8; align16(sig.len())];
        rand_bytes(&mut phase4[sig.len()..]);
        phase4[..sig.len()].copy_from_slice(&sig);
        encryptor.encrypt(&mut phase4);
        stream.write_all(&phase4).await?;

        Ok((remote_ident, encryptor, decryptor))
    }

    fn spawn_session(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: RouterIdentity,
        encryptor: CbcEncryptor,
        decryptor: CbcDecryptor,
    ) {
        let remote_hash = remote.hash();
        let peer_ip = stream.peer_addr().ok().map(|a| a.ip());
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(64);
        let (handle, counters, closed) = SessionHandle::new(remote_hash, TransportKind::Ntcp, tx);
        info!(peer = ?remote_hash, "ntcp session established");
        self.inner.register_session(remote_hash, handle);

        let inner = self.inner.clone();
        let read_counters = counters.clone();
        let read_closed = closed.clone();
        tokio::spawn(async move {
            let mut reader = FrameReader {
                stream: read_half,
                decryptor,
                bad_frames: 0,
            };
            loop {
                let frame = tokio::time::timeout(NTCP_TERMINATION_TIMEOUT, reader.next_frame()).await;
                match frame {
                    Ok(Ok(Some(msg))) => {
                        read_counters
                            .received_bytes
                            .fetch_add(msg.encoded_len() as u64, Ordering::Relaxed);
                        inner.bandwidth.record_received(msg.encoded_len() as u64);
                        if inner
                            .inbound_tx
                            .send(InboundMessage {
                                from: remote_hash,
                                msg,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(Ok(None)) => trace!(peer = ?remote_hash, "ntcp keep-alive"),
                    Ok(Err(CoreError::AuthFailed(what))) => {
                        reader.bad_frames += 1;
                        debug!(peer = ?remote_hash, what, count = reader.bad_frames, "bad ntcp frame");
                        if reader.bad_frames >= BAD_FRAMES_BEFORE_TERMINATION {
                            if let Some(ip) = peer_ip {
                                inner.ban(ip);
                            }
                            break;
                        }
                    }
                    Ok(Err(CoreError::Expired)) | Ok(Err(CoreError::Malformed(_))) => {
                        trace!(peer = ?remote_hash, "dropping unusable message");
                    }
                    Ok(Err(_)) | Err(_) => break,
                }
            }
            read_closed.store(true, Ordering::Relaxed);
            inner.unregister_session(&remote_hash, TransportKind::Ntcp);
            debug!(peer = ?remote_hash, "ntcp session closed (read)");
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut writer = FrameWriter {
                stream: write_half,
                encryptor,
            };
            let mut rx = rx;
            loop {
                let command = tokio::time::timeout(NTCP_KEEPALIVE_INTERVAL, rx.recv()).await;
                match command {
                    Ok(Some(SessionCommand::Send(msgs))) => {
                        for msg in msgs {
                            if msg.is_expired(garliccraft_core::now_ms()) {
                                continue;
                            }
                            let encoded = msg.encode();
                            if encoded.len() > NTCP_MAX_MESSAGE_SIZE {
                                warn!(peer = ?remote_hash, "oversized i2np message dropped");
                                continue;
                            }
                            counters
                                .sent_bytes
                                .fetch_add(encoded.len() as u64, Ordering::Relaxed);
                            inner.bandwidth.record_sent(encoded.len() as u64);
                            if writer.write_frame(&encoded).await.is_err() {
                                closed.store(true, Ordering::Relaxed);
                                return;
                            }
                        }
                    }
                    Ok(Some(SessionCommand::Close)) | Ok(None) => break,
                    Err(_) => {
                        // idle: keep the CBC stream and the connection warm
                        if writer.write_keepalive().await.is_err() {
                            break;
                        }
                    }
                }
            }
            closed.store(true, Ordering::Relaxed);
            let _ = writer.stream.shutdown().await;
        });
    }
}

struct FrameReader {
    stream: OwnedReadHalf,
    decryptor: CbcDecryptor,
    bad_frames: u32,
}

impl FrameReader {
    /// Read one frame; `None` for keep-alives.
    async fn next_frame(&mut self) -> Result<Option<I2npMessage>> {
        let mut first = [0u8; 16];
        self.stream.read_exact(&mut first).await?;
        self.decryptor.decrypt(&mut first);
        let size = u16::from_be_bytes(first[..2].try_into().expect("fixed")) as usize;

        if size == 0 {
            // keep-alive: timestamp || padding || adler, all within one block
            Self::verify_adler(&first)?;
            return Ok(None);
        }
        // a nonsense size means the CBC stream is corrupt, same class as a
        // failed checksum
        if size > NTCP_MAX_MESSAGE_SIZE {
            return Err(CoreError::AuthFailed("ntcp frame size"));
        }
        let total = align16(2 + size + 4);
        let mut frame = vec![0u8; total];
        frame[..16].copy_from_slice(&first);
        self.stream.read_exact(&mut frame[16..]).await?;
        self.decryptor.decrypt(&mut frame[16..]);
        Self::verify_adler(&frame)?;
        I2npMessage::decode(&frame[2..2 + size]).map(Some)
    }

    fn verify_adler(frame: &[u8]) -> Result<()> {
        let body = &frame[..frame.len() - 4];
        let expected = u32::from_be_bytes(frame[frame.len() - 4..].try_into().expect("fixed"));
        if adler32::adler32(body).map_err(|_| CoreError::Malformed("adler input"))? != expected {
            return Err(CoreError::AuthFailed("ntcp adler mismatch"));
        }
        Ok(())
    }
}

struct FrameWriter {
    stream: OwnedWriteHalf,
    encryptor: CbcEncryptor,
}

impl FrameWriter {
    async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let total = align16(2 + payload.len() + 4);
        let mut frame = vec![0u8; total];
        frame[..2].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        frame[2..2 + payload.len()].copy_from_slice(payload);
        rand_bytes(&mut frame[2 + payload.len()..total - 4]);
        let checksum = adler32::adler32(&frame[..total - 4])
            .map_err(|_| CoreError::Malformed("adler input"))?;
        frame[total - 4..].copy_from_slice(&checksum.to_be_bytes());
        self.encryptor.encrypt(&mut frame);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn write_keepalive(&mut self) -> Result<()> {
        let mut frame = [0u8; 16];
        // size 0 || timestamp || padding || adler
        frame[2..6].copy_from_slice(&(now_secs() as u32).to_be_bytes());
        rand_bytes(&mut frame[6..12]);
        let checksum =
            adler32::adler32(&frame[..12]).map_err(|_| CoreError::Malformed("adler input"))?;
        frame[12..].copy_from_slice(&checksum.to_be_bytes());
        self.encryptor.encrypt(&mut frame);
        self.stream.write_all(&frame).await?;
        Ok(())
    }
}
