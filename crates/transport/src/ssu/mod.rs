//! SSU, the UDP transport.
//!
//! One socket serves every peer; sessions are keyed by remote endpoint and
//! move through intro-key establishment into session-key data exchange.
//! Relay introductions serve firewalled peers, and the peer test drives the
//! advertised reachability status.

mod data;
mod packet;
mod peer_test;

pub use data::{DataBody, Fragment, Reassembler, ResendQueue};
pub use packet::{PayloadType, SsuPacket, SSU_MTU};
pub use peer_test::{PeerTestManager, PeerTestOutcome, RouterStatus, StatusHandle};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use garliccraft_core::i2np::I2npMessage;
use garliccraft_core::{now_secs, CoreError, Hash, Result, RouterInfo, TransportStyle};
use garliccraft_crypto::{derive_ssu_keys, rand_u32_nonzero, DhKeypair};

use crate::session::{InboundMessage, SessionCommand, SessionHandle, TransportKind};
use crate::{TransportsInner, SESSION_CREATION_TIMEOUT};

use self::data::{fragment_message, AckBitfield};
use self::packet::{
    build_packet, establishment_signed_data, parse_packet, validate_packet, PeerTest,
    RelayIntro, RelayRequest, RelayResponse, SessionConfirmed, SessionCreated, SessionRequest,
};

const SSU_TERMINATION_TIMEOUT: Duration = Duration::from_secs(330);
const PEER_TEST_RETRY_INTERVAL: Duration = Duration::from_secs(60);

enum SessionState {
    /// We sent a SessionRequest and await SessionCreated.
    OutboundRequested {
        dh: DhKeypair,
        router: Arc<RouterInfo>,
        intro_key: [u8; 32],
        waiters: Vec<oneshot::Sender<Result<()>>>,
    },
    /// We answered a SessionRequest and await SessionConfirmed.
    InboundCreated {
        x: [u8; 256],
        y: [u8; 256],
        relay_tag: u32,
        signed_on: u32,
    },
    Established {
        remote: Hash,
    },
}

struct SsuSession {
    state: SessionState,
    session_key: [u8; 32],
    mac_key: [u8; 32],
    reassembler: Reassembler,
    resend: ResendQueue,
    pending_acks: Vec<AckBitfield>,
    pending_explicit_acks: Vec<u32>,
    last_activity: Instant,
    handle: Option<SessionHandle>,
}

impl SsuSession {
    fn established_remote(&self) -> Option<Hash> {
        match &self.state {
            SessionState::Established { remote } => Some(*remote),
            _ => None,
        }
    }
}

pub struct SsuServer {
    inner: Arc<TransportsInner>,
    status: StatusHandle,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    sessions: Mutex<HashMap<SocketAddr, Arc<Mutex<SsuSession>>>>,
    relay_tags: Mutex<HashMap<u32, SocketAddr>>,
    peer_tests: Mutex<PeerTestManager>,
    last_peer_test: Mutex<Option<Instant>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SsuServer {
    pub(crate) fn new(inner: Arc<TransportsInner>, status: StatusHandle) -> Self {
        Self {
            inner,
            status,
            socket: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            relay_tags: Mutex::new(HashMap::new()),
            peer_tests: Mutex::new(PeerTestManager::new()),
            last_peer_test: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .expect("socket lock")
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    fn local_intro_key(&self) -> Option<[u8; 32]> {
        let info = self.inner.config.local_info.read().expect("local info lock");
        info.address(TransportStyle::Ssu).and_then(|a| a.key)
    }

    pub async fn start(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        *self.socket.lock().expect("socket lock") = Some(socket.clone());

        let server = self.clone();
        let recv_socket = socket.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        if server.inner.is_banned(&from.ip()) {
                            continue;
                        }
                        server.inner.bandwidth.record_received(len as u64);
                        if let Err(err) = server.handle_packet(&buf[..len], from).await {
                            trace!(%from, %err, "ssu packet dropped");
                        }
                    }
                    Err(err) => {
                        warn!(%err, "ssu recv failed");
                        break;
                    }
                }
            }
        });

        let server = self.clone();
        let tick_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                server.housekeeping_tick().await;
            }
        });

        let mut tasks = self.tasks.lock().expect("tasks lock");
        tasks.push(recv_task);
        tasks.push(tick_task);
        Ok(())
    }

    pub async fn stop(&self) {
        let addrs: Vec<SocketAddr> = {
            let sessions = self.sessions.lock().expect("sessions lock");
            sessions.keys().copied().collect()
        };
        for addr in addrs {
            self.destroy_session(addr, true).await;
        }
        for task in self.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .expect("socket lock")
            .clone()
            .ok_or(CoreError::Shutdown)
    }

    async fn send_packet(
        &self,
        to: SocketAddr,
        session_key: &[u8; 32],
        mac_key: &[u8; 32],
        payload_type: PayloadType,
        payload: &[u8],
    ) -> Result<()> {
        let packet = build_packet(session_key, mac_key, payload_type, payload);
        self.inner.bandwidth.record_sent(packet.len() as u64);
        self.socket()?.send_to(&packet, to).await?;
        Ok(())
    }

    /// Originate a session to `router`, via an introducer when its address
    /// advertises one.
    pub async fn connect(self: &Arc<Self>, router: Arc<RouterInfo>) -> Result<()> {
        let addr = router
            .address(TransportStyle::Ssu)
            .ok_or(CoreError::Unreachable)?
            .clone();
        let intro_key = addr.key.ok_or(CoreError::Malformed("ssu address without key"))?;
        let remote_addr: SocketAddr = format!("{}:{}", addr.host, addr.port)
            .parse()
            .map_err(|_| CoreError::Malformed("bad ssu address"))?;

        if !addr.introducers.is_empty() {
            // the peer is firewalled; ask an introducer to open its NAT first
            self.request_introduction(&addr.introducers[0]).await?;
        }

        let (tx, rx) = oneshot::channel();
        // decide under the lock, await outside it
        enum Plan {
            AlreadyUp,
            Joined,
            SendRequest([u8; 256]),
            Refuse,
        }
        let plan = {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            match sessions.get(&remote_addr) {
                Some(existing) => {
                    let mut session = existing.lock().expect("session lock");
                    match &mut session.state {
                        SessionState::Established { .. } => Plan::AlreadyUp,
                        SessionState::OutboundRequested { waiters, .. } => {
                            waiters.push(tx);
                            Plan::Joined
                        }
                        _ => Plan::Refuse,
                    }
                }
                None => {
                    let dh = self.inner.dh_supplier.acquire();
                    let x = dh.pub_key;
                    sessions.insert(
                        remote_addr,
                        Arc::new(Mutex::new(SsuSession {
                            state: SessionState::OutboundRequested {
                                dh,
                                router: router.clone(),
                                intro_key,
                                waiters: vec![tx],
                            },
                            session_key: intro_key,
                            mac_key: intro_key,
                            reassembler: Reassembler::new(),
                            resend: ResendQueue::new(),
                            pending_acks: Vec::new(),
                            pending_explicit_acks: Vec::new(),
                            last_activity: Instant::now(),
                            handle: None,
                        })),
                    );
                    Plan::SendRequest(x)
                }
            }
        };

        match plan {
            Plan::AlreadyUp => return Ok(()),
            Plan::Refuse => return Err(CoreError::Unreachable),
            Plan::Joined => {}
            Plan::SendRequest(x) => {
                let request = SessionRequest {
                    x,
                    to_ip: remote_addr.ip(),
                };
                self.send_packet(
                    remote_addr,
                    &intro_key,
                    &intro_key,
                    PayloadType::SessionRequest,
                    &request.encode(),
                )
                .await?;
            }
        }

        tokio::time::timeout(SESSION_CREATION_TIMEOUT, rx)
            .await
            .map_err(|_| CoreError::Timeout("ssu establishment"))?
            .map_err(|_| CoreError::Unreachable)?
    }

    async fn request_introduction(&self, intro: &garliccraft_core::Introducer) -> Result<()> {
        let introducer_addr: SocketAddr = format!("{}:{}", intro.host, intro.port)
            .parse()
            .map_err(|_| CoreError::Malformed("bad introducer address"))?;
        let our_key = self.local_intro_key().ok_or(CoreError::Unreachable)?;
        let local = self.local_addr().ok_or(CoreError::Shutdown)?;
        let request = RelayRequest {
            relay_tag: intro.tag,
            alice_ip: local.ip(),
            alice_port: local.port(),
            intro_key: our_key,
            nonce: rand_u32_nonzero(),
        };
        self.send_packet(
            introducer_addr,
            &intro.key,
            &intro.key,
            PayloadType::RelayRequest,
            &request.encode(),
        )
        .await?;
        // give the hole punch a moment to land before SessionRequest
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    async fn handle_packet(self: &Arc<Self>, raw: &[u8], from: SocketAddr) -> Result<()> {
        let session = {
            let sessions = self.sessions.lock().expect("sessions lock");
            sessions.get(&from).cloned()
        };
        match session {
            Some(session) => self.handle_session_packet(raw, from, session).await,
            None => self.handle_sessionless_packet(raw, from).await,
        }
    }

    /// Packets from an endpoint we have no session with are only meaningful
    /// under our intro key.
    async fn handle_sessionless_packet(self: &Arc<Self>, raw: &[u8], from: SocketAddr) -> Result<()> {
        let intro_key = self.local_intro_key().ok_or(CoreError::Unreachable)?;
        if !validate_packet(&intro_key, raw) {
            return Err(CoreError::AuthFailed("ssu mac mismatch"));
        }
        let packet = parse_packet(&intro_key, &intro_key, raw)?;
        match packet.payload_type {
            PayloadType::SessionRequest => self.on_session_request(&packet.payload, from).await,
            PayloadType::RelayRequest => self.on_relay_request(&packet.payload, from).await,
            PayloadType::PeerTest => {
                // a Charlie reaching us directly: our address is reachable
                let test = PeerTest::decode(&packet.payload)?;
                let outcome = self
                    .peer_tests
                    .lock()
                    .expect("peer test lock")
                    .on_charlie_contact(test.nonce);
                if let Some(outcome) = outcome {
                    info!(?outcome, "peer test completed");
                    PeerTestManager::apply_outcome(&self.status, outcome);
                }
                Ok(())
            }
            _ => Err(CoreError::Malformed("unexpected sessionless payload")),
        }
    }

    async fn on_session_request(self: &Arc<Self>, payload: &[u8], from: SocketAddr) -> Result<()> {
        let request = SessionRequest::decode(payload)?;
        let intro_key = self.local_intro_key().ok_or(CoreError::Unreachable)?;
        let dh = self.inner.dh_supplier.acquire();
        let shared = dh.agree(&request.x);
        let (session_key, mac_key) = derive_ssu_keys(&shared)?;

        // introducer-capable routers hand out a relay tag with the session
        let relay_tag = {
            let info = self.inner.config.local_info.read().expect("local info lock");
            if info.is_introducer() {
                rand_u32_nonzero()
            } else {
                0
            }
        };
        let signed_on = now_secs() as u32;
        let signed = establishment_signed_data(
            &request.x,
            &dh.pub_key,
            &from.ip(),
            from.port(),
            relay_tag,
            signed_on,
        );
        let created = SessionCreated {
            y: dh.pub_key,
            your_ip: from.ip(),
            your_port: from.port(),
            relay_tag,
            signed_on,
            signature: self.inner.config.keys.sign(&signed),
        };

        {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            sessions.insert(
                from,
                Arc::new(Mutex::new(SsuSession {
                    state: SessionState::InboundCreated {
                        x: request.x,
                        y: dh.pub_key,
                        relay_tag,
                        signed_on,
                    },
                    session_key,
                    mac_key,
                    reassembler: Reassembler::new(),
                    resend: ResendQueue::new(),
                    pending_acks: Vec::new(),
                    pending_explicit_acks: Vec::new(),
                    last_activity: Instant::now(),
                    handle: None,
                })),
            );
        }

        self.send_packet(
            from,
            &intro_key,
            &intro_key,
            PayloadType::SessionCreated,
            &created.encode(),
        )
        .await
    }

    async fn on_relay_request(self: &Arc<Self>, payload: &[u8], from: SocketAddr) -> Result<()> {
        let request = RelayRequest::decode(payload)?;
        let target = {
            let tags = self.relay_tags.lock().expect("relay tags lock");
            tags.get(&request.relay_tag).copied()
        };
        let Some(target_addr) = target else {
            return Err(CoreError::Malformed("unknown relay tag"));
        };
        // tell the firewalled peer to punch toward Alice
        let intro = RelayIntro {
            alice_ip: from.ip(),
            alice_port: from.port(),
        };
        let session = {
            let sessions = self.sessions.lock().expect("sessions lock");
            sessions.get(&target_addr).cloned()
        };
        if let Some(session) = session {
            let (session_key, mac_key) = {
                let session = session.lock().expect("session lock");
                (session.session_key, session.mac_key)
            };
            self.send_packet(
                target_addr,
                &session_key,
                &mac_key,
                PayloadType::RelayIntro,
                &intro.encode(),
            )
            .await?;
        }
        // and tell Alice where the peer really is
        let response = RelayResponse {
            charlie_ip: target_addr.ip(),
            charlie_port: target_addr.port(),
            nonce: request.nonce,
        };
        self.send_packet(
            from,
            &request.intro_key,
            &request.intro_key,
            PayloadType::RelayResponse,
            &response.encode(),
        )
        .await
    }

    async fn handle_session_packet(
        self: &Arc<Self>,
        raw: &[u8],
        from: SocketAddr,
        session: Arc<Mutex<SsuSession>>,
    ) -> Result<()> {
        enum Action {
            SessionCreated(SsuPacket),
            SessionConfirmed(SsuPacket),
            Established(SsuPacket, Hash),
        }

        let action = {
            let mut guard = session.lock().expect("session lock");
            guard.last_activity = Instant::now();
            match &guard.state {
                SessionState::OutboundRequested { intro_key, .. } => {
                    let intro_key = *intro_key;
                    let packet = parse_packet(&intro_key, &intro_key, raw)?;
                    Action::SessionCreated(packet)
                }
                SessionState::InboundCreated { .. } => {
                    let packet = parse_packet(&guard.session_key, &guard.mac_key, raw)?;
                    Action::SessionConfirmed(packet)
                }
                SessionState::Established { remote } => {
                    let remote = *remote;
                    let packet = parse_packet(&guard.session_key, &guard.mac_key, raw)?;
                    Action::Established(packet, remote)
                }
            }
        };

        match action {
            Action::SessionCreated(packet) => {
                if packet.payload_type != PayloadType::SessionCreated {
                    return Err(CoreError::Malformed("expected session created"));
                }
                self.on_session_created(&packet.payload, from, session).await
            }
            Action::SessionConfirmed(packet) => {
                if packet.payload_type != PayloadType::SessionConfirmed {
                    return Err(CoreError::Malformed("expected session confirmed"));
                }
                self.on_session_confirmed(&packet.payload, from, session).await
            }
            Action::Established(packet, remote) => {
                self.on_established_packet(packet, from, session, remote).await
            }
        }
    }

    async fn on_session_created(
        self: &Arc<Self>,
        payload: &[u8],
        from: SocketAddr,
        session: Arc<Mutex<SsuSession>>,
    ) -> Result<()> {
        let (dh, router, waiters) = {
            let mut guard = session.lock().expect("session lock");
            match std::mem::replace(
                &mut guard.state,
                SessionState::Established { remote: Hash::ZERO },
            ) {
                SessionState::OutboundRequested {
                    dh,
                    router,
                    waiters,
                    ..
                } => (dh, router, waiters),
                other => {
                    guard.state = other;
                    return Err(CoreError::Malformed("unexpected session created"));
                }
            }
        };

        let sig_len = router.identity().signing_key().sig_type().sig_len();
        let created = SessionCreated::decode(payload, sig_len)?;
        let shared = dh.agree(&created.y);
        let (session_key, mac_key) = derive_ssu_keys(&shared)?;

        let signed = establishment_signed_data(
            &dh.pub_key,
            &created.y,
            &created.your_ip,
            created.your_port,
            created.relay_tag,
            created.signed_on,
        );
        if let Err(err) = router.identity().verify(&signed, &created.signature) {
            self.remove_session(&from);
            for waiter in waiters {
                let _ = waiter.send(Err(CoreError::AuthFailed("session created signature")));
            }
            return Err(err);
        }

        // confirm under the freshly derived keys
        let signed_on = now_secs() as u32;
        let confirm_signed = establishment_signed_data(
            &dh.pub_key,
            &created.y,
            &created.your_ip,
            created.your_port,
            created.relay_tag,
            signed_on,
        );
        let confirmed = SessionConfirmed {
            identity: self.inner.config.keys.identity().clone(),
            signed_on,
            signature: self.inner.config.keys.sign(&confirm_signed),
        };

        let remote_hash = router.hash();
        {
            let mut guard = session.lock().expect("session lock");
            guard.session_key = session_key;
            guard.mac_key = mac_key;
            guard.state = SessionState::Established {
                remote: remote_hash,
            };
        }
        self.send_packet(
            from,
            &session_key,
            &mac_key,
            PayloadType::SessionConfirmed,
            &confirmed.encode(),
        )
        .await?;

        if created.relay_tag != 0 {
            // the peer will introduce others to us under this tag
            debug!(tag = created.relay_tag, peer = ?remote_hash, "received relay tag");
        }
        self.establish(from, remote_hash, session);
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        info!(peer = ?remote_hash, %from, "ssu session established (outbound)");
        Ok(())
    }

    async fn on_session_confirmed(
        self: &Arc<Self>,
        payload: &[u8],
        from: SocketAddr,
        session: Arc<Mutex<SsuSession>>,
    ) -> Result<()> {
        let confirmed = SessionConfirmed::decode(payload)?;
        let (x, y, relay_tag, signed_on) = {
            let guard = session.lock().expect("session lock");
            match &guard.state {
                SessionState::InboundCreated {
                    x,
                    y,
                    relay_tag,
                    signed_on: _,
                } => (*x, *y, *relay_tag, confirmed.signed_on),
                _ => return Err(CoreError::Malformed("unexpected session confirmed")),
            }
        };
        let signed = establishment_signed_data(&x, &y, &from.ip(), from.port(), relay_tag, signed_on);
        confirmed.identity.verify(&signed, &confirmed.signature)?;

        let remote_hash = confirmed.identity.hash();
        {
            let mut guard = session.lock().expect("session lock");
            guard.state = SessionState::Established {
                remote: remote_hash,
            };
        }
        if relay_tag != 0 {
            self.relay_tags
                .lock()
                .expect("relay tags lock")
                .insert(relay_tag, from);
        }
        self.establish(from, remote_hash, session);
        info!(peer = ?remote_hash, %from, "ssu session established (inbound)");
        Ok(())
    }

    /// Wire an established session into the dispatcher: writer task, handle
    /// registration, delayed-message flush.
    fn establish(self: &Arc<Self>, addr: SocketAddr, remote: Hash, session: Arc<Mutex<SsuSession>>) {
        let (tx, mut rx) = mpsc::channel(64);
        let (handle, counters, closed) = SessionHandle::new(remote, TransportKind::Ssu, tx);
        {
            let mut guard = session.lock().expect("session lock");
            guard.handle = Some(handle.clone());
        }
        self.inner.register_session(remote, handle);

        let server = self.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    SessionCommand::Send(msgs) => {
                        for msg in msgs {
                            if msg.is_expired(garliccraft_core::now_ms()) {
                                continue;
                            }
                            let encoded = msg.encode();
                            counters
                                .sent_bytes
                                .fetch_add(encoded.len() as u64, Ordering::Relaxed);
                            let fragments = fragment_message(msg.msg_id, &encoded);
                            let (session_key, mac_key, bodies) = {
                                let mut guard = session.lock().expect("session lock");
                                guard.resend.track(fragments.clone());
                                let mut bodies = Vec::new();
                                for frag in fragments {
                                    bodies.push(DataBody {
                                        explicit_acks: guard.pending_explicit_acks.drain(..).collect(),
                                        ack_bitfields: guard.pending_acks.drain(..).collect(),
                                        fragments: vec![frag],
                                    });
                                }
                                (guard.session_key, guard.mac_key, bodies)
                            };
                            for body in bodies {
                                if server
                                    .send_packet(
                                        addr,
                                        &session_key,
                                        &mac_key,
                                        PayloadType::Data,
                                        &body.encode(),
                                    )
                                    .await
                                    .is_err()
                                {
                                    closed.store(true, Ordering::Relaxed);
                                    return;
                                }
                            }
                        }
                    }
                    SessionCommand::Close => break,
                }
            }
            closed.store(true, Ordering::Relaxed);
            server.destroy_session(addr, true).await;
        });
    }

    async fn on_established_packet(
        self: &Arc<Self>,
        packet: SsuPacket,
        from: SocketAddr,
        session: Arc<Mutex<SsuSession>>,
        remote: Hash,
    ) -> Result<()> {
        if packet.rekey {
            // no rekey path; the peer keeps its keys until the session is
            // rebuilt
            trace!(peer = ?remote, "ignoring rekey flag");
        }
        match packet.payload_type {
            PayloadType::Data => {
                let body = DataBody::decode(&packet.payload)?;
                let mut completed = Vec::new();
                {
                    let mut guard = session.lock().expect("session lock");
                    for id in &body.explicit_acks {
                        guard.resend.ack_message(*id);
                    }
                    for ack in &body.ack_bitfields {
                        guard.resend.ack_fragments(ack);
                    }
                    for frag in body.fragments {
                        let msg_id = frag.msg_id;
                        match guard.reassembler.handle_fragment(frag) {
                            Ok(Some(msg)) => {
                                guard.pending_explicit_acks.push(msg_id);
                                completed.push(msg);
                            }
                            Ok(None) => {
                                let bits = guard.reassembler.received_bitfield(msg_id);
                                guard.pending_acks.push(bits);
                            }
                            Err(CoreError::Duplicate) => {
                                // re-ack so the sender stops resending
                                guard.pending_explicit_acks.push(msg_id);
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
                for raw in completed {
                    match I2npMessage::decode(&raw) {
                        Ok(msg) => {
                            let _ = self
                                .inner
                                .inbound_tx
                                .send(InboundMessage { from: remote, msg })
                                .await;
                        }
                        Err(err) => debug!(peer = ?remote, %err, "bad reassembled message"),
                    }
                }
                Ok(())
            }
            PayloadType::PeerTest => self.on_session_peer_test(&packet.payload, from, remote).await,
            PayloadType::RelayIntro => {
                // we are firewalled; punch a hole toward Alice
                let intro = RelayIntro::decode(&packet.payload)?;
                let target = SocketAddr::new(intro.alice_ip, intro.alice_port);
                let _ = self.socket()?.send_to(&[0u8], target).await;
                Ok(())
            }
            PayloadType::SessionDestroyed => {
                debug!(peer = ?remote, "session destroyed by peer");
                self.destroy_session(from, false).await;
                Ok(())
            }
            _ => Err(CoreError::Malformed("unexpected session payload")),
        }
    }

    /// PeerTest over an established session: we are Bob for a testing Alice,
    /// Charlie for a delegating Bob, or Alice receiving Bob's echo.
    async fn on_session_peer_test(
        self: &Arc<Self>,
        payload: &[u8],
        from: SocketAddr,
        remote: Hash,
    ) -> Result<()> {
        let test = PeerTest::decode(payload)?;

        if self.peer_tests.lock().expect("peer test lock").is_running(test.nonce) {
            // Bob echoed our test back
            self.peer_tests
                .lock()
                .expect("peer test lock")
                .on_bob_reply(test.nonce);
            return Ok(());
        }

        match test.ip {
            None => {
                // Alice asked us (Bob) to run a test: echo, then delegate to
                // a Charlie with her observed endpoint filled in
                let echo = PeerTest {
                    nonce: test.nonce,
                    ip: None,
                    port: test.port,
                    intro_key: test.intro_key,
                };
                let (session_key, mac_key) = {
                    let sessions = self.sessions.lock().expect("sessions lock");
                    let session = sessions.get(&from).ok_or(CoreError::Unreachable)?;
                    let guard = session.lock().expect("session lock");
                    (guard.session_key, guard.mac_key)
                };
                self.send_packet(from, &session_key, &mac_key, PayloadType::PeerTest, &echo.encode())
                    .await?;

                let charlie = {
                    let sessions = self.sessions.lock().expect("sessions lock");
                    sessions
                        .iter()
                        .filter(|(addr, _)| **addr != from)
                        .find_map(|(addr, s)| {
                            let guard = s.lock().expect("session lock");
                            guard.established_remote().map(|_| {
                                (*addr, guard.session_key, guard.mac_key)
                            })
                        })
                };
                if let Some((charlie_addr, session_key, mac_key)) = charlie {
                    let delegated = PeerTest {
                        nonce: test.nonce,
                        ip: Some(from.ip()),
                        port: from.port(),
                        intro_key: test.intro_key,
                    };
                    self.send_packet(
                        charlie_addr,
                        &session_key,
                        &mac_key,
                        PayloadType::PeerTest,
                        &delegated.encode(),
                    )
                    .await?;
                } else {
                    debug!(peer = ?remote, "no charlie available for peer test");
                }
                Ok(())
            }
            Some(alice_ip) => {
                // Bob delegated: we are Charlie; contact Alice directly with
                // her intro key
                let alice_addr = SocketAddr::new(alice_ip, test.port);
                let direct = PeerTest {
                    nonce: test.nonce,
                    ip: Some(alice_ip),
                    port: test.port,
                    intro_key: test.intro_key,
                };
                self.send_packet(
                    alice_addr,
                    &test.intro_key,
                    &test.intro_key,
                    PayloadType::PeerTest,
                    &direct.encode(),
                )
                .await
            }
        }
    }

    /// Begin a reachability test through an established session (Bob).
    pub async fn start_peer_test(self: &Arc<Self>) -> Result<()> {
        let our_key = self.local_intro_key().ok_or(CoreError::Unreachable)?;
        let local_port = self.local_addr().map(|a| a.port()).unwrap_or(0);
        let bob = {
            let sessions = self.sessions.lock().expect("sessions lock");
            sessions.iter().find_map(|(addr, s)| {
                let guard = s.lock().expect("session lock");
                guard
                    .established_remote()
                    .map(|_| (*addr, guard.session_key, guard.mac_key))
            })
        };
        let Some((bob_addr, session_key, mac_key)) = bob else {
            return Err(CoreError::Unreachable);
        };
        let nonce = rand_u32_nonzero();
        self.peer_tests.lock().expect("peer test lock").start(nonce);
        let test = PeerTest {
            nonce,
            ip: None,
            port: local_port,
            intro_key: our_key,
        };
        self.send_packet(bob_addr, &session_key, &mac_key, PayloadType::PeerTest, &test.encode())
            .await
    }

    async fn housekeeping_tick(self: &Arc<Self>) {
        // resends, reassembly expiry, idle termination
        let mut resends: Vec<(SocketAddr, [u8; 32], [u8; 32], Vec<Fragment>)> = Vec::new();
        let mut ack_flushes: Vec<(SocketAddr, [u8; 32], [u8; 32], DataBody)> = Vec::new();
        let mut idle: Vec<SocketAddr> = Vec::new();
        {
            let sessions = self.sessions.lock().expect("sessions lock");
            for (addr, session) in sessions.iter() {
                let mut guard = session.lock().expect("session lock");
                guard.reassembler.expire();
                if guard.last_activity.elapsed() > SSU_TERMINATION_TIMEOUT {
                    idle.push(*addr);
                    continue;
                }
                let due = guard.resend.due_for_resend();
                if !due.is_empty() {
                    resends.push((*addr, guard.session_key, guard.mac_key, due));
                }
                if !guard.pending_acks.is_empty() || !guard.pending_explicit_acks.is_empty() {
                    let body = DataBody {
                        explicit_acks: guard.pending_explicit_acks.drain(..).collect(),
                        ack_bitfields: guard.pending_acks.drain(..).collect(),
                        fragments: Vec::new(),
                    };
                    ack_flushes.push((*addr, guard.session_key, guard.mac_key, body));
                }
            }
        }
        for (addr, session_key, mac_key, fragments) in resends {
            for frag in fragments {
                let body = DataBody {
                    explicit_acks: Vec::new(),
                    ack_bitfields: Vec::new(),
                    fragments: vec![frag],
                };
                let _ = self
                    .send_packet(addr, &session_key, &mac_key, PayloadType::Data, &body.encode())
                    .await;
            }
        }
        for (addr, session_key, mac_key, body) in ack_flushes {
            let _ = self
                .send_packet(addr, &session_key, &mac_key, PayloadType::Data, &body.encode())
                .await;
        }
        for addr in idle {
            debug!(%addr, "terminating idle ssu session");
            self.destroy_session(addr, true).await;
        }

        // peer test outcomes and periodic restarts
        let outcomes = self.peer_tests.lock().expect("peer test lock").evaluate();
        for (_, outcome) in outcomes {
            info!(?outcome, "peer test completed");
            PeerTestManager::apply_outcome(&self.status, outcome);
        }
        if self.status.get() == RouterStatus::Testing {
            let due = {
                let mut last = self.last_peer_test.lock().expect("peer test timer lock");
                if last.map_or(true, |t| t.elapsed() > PEER_TEST_RETRY_INTERVAL) {
                    *last = Some(Instant::now());
                    true
                } else {
                    false
                }
            };
            if due {
                let _ = self.start_peer_test().await;
            }
        }
    }

    fn remove_session(&self, addr: &SocketAddr) {
        self.sessions.lock().expect("sessions lock").remove(addr);
    }

    async fn destroy_session(&self, addr: SocketAddr, notify_peer: bool) {
        let session = {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            sessions.remove(&addr)
        };
        let Some(session) = session else { return };
        let (remote, session_key, mac_key) = {
            let guard = session.lock().expect("session lock");
            (guard.established_remote(), guard.session_key, guard.mac_key)
        };
        if notify_peer {
            let _ = self
                .send_packet(addr, &session_key, &mac_key, PayloadType::SessionDestroyed, &[])
                .await;
        }
        if let Some(remote) = remote {
            self.relay_tags
                .lock()
                .expect("relay tags lock")
                .retain(|_, a| *a != addr);
            self.inner.unregister_session(&remote, TransportKind::Ssu);
        }
    }
}
