//! GarlicCraft Transports
//!
//! The two wire transports (NTCP over TCP, SSU over UDP) and the dispatcher
//! that owns both: a peer table with delayed-message queues, session
//! establishment with NTCP-then-SSU attempt order, bandwidth accounting,
//! and the warm DH keypair supply.

mod bandwidth;
mod ntcp;
mod session;
mod ssu;

pub use bandwidth::{Bandwidth, LOW_BANDWIDTH_LIMIT};
pub use ntcp::NtcpServer;
pub use session::{InboundMessage, SessionCommand, SessionHandle, TransportKind};
pub use ssu::{PeerTestOutcome, RouterStatus, SsuServer};

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use garliccraft_core::i2np::I2npMessageRef;
use garliccraft_core::{Hash, PrivateKeys, RouterInfo, TransportStyle};
use garliccraft_crypto::DhKeypairSupplier;
use garliccraft_netdb::NetDb;

/// One session-establishment attempt may take this long before the next
/// transport is tried.
pub const SESSION_CREATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Peers that never produced a session are evicted after five attempts'
/// worth of establishment time.
pub const PEER_EVICTION_TIMEOUT: Duration = Duration::from_secs(50);

/// Repeatedly misbehaving peers are refused for this long.
pub const BAN_TIMEOUT: Duration = Duration::from_secs(70);

/// Messages queued per peer while a session comes up; beyond this the
/// oldest non-critical messages are shed.
const MAX_DELAYED_MESSAGES: usize = 64;

/// Everything the transports need from the local router.
#[derive(Clone)]
pub struct TransportConfig {
    pub keys: Arc<PrivateKeys>,
    /// The local RouterInfo as currently advertised; replaced on change.
    pub local_info: Arc<RwLock<Arc<RouterInfo>>>,
    pub ntcp_addr: SocketAddr,
    pub ssu_addr: SocketAddr,
}

struct Peer {
    router: Option<Arc<RouterInfo>>,
    sessions: Vec<SessionHandle>,
    delayed: VecDeque<I2npMessageRef>,
    num_attempts: u8,
    created_at: Instant,
}

impl Peer {
    fn new(router: Option<Arc<RouterInfo>>) -> Self {
        Self {
            router,
            sessions: Vec::new(),
            delayed: VecDeque::new(),
            num_attempts: 0,
            created_at: Instant::now(),
        }
    }
}

struct TransportsInner {
    config: TransportConfig,
    netdb: NetDb,
    peers: Mutex<HashMap<Hash, Peer>>,
    banned: Mutex<HashMap<IpAddr, Instant>>,
    bandwidth: Bandwidth,
    dh_supplier: Arc<DhKeypairSupplier>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    status: ssu::StatusHandle,
}

/// The transport dispatcher, shared by handle.
#[derive(Clone)]
pub struct Transports {
    inner: Arc<TransportsInner>,
    ntcp: Arc<NtcpServer>,
    ssu: Arc<SsuServer>,
}

impl Transports {
    /// Build the dispatcher. Inbound I2NP messages from all sessions arrive
    /// on the returned receiver; the router's dispatch task drains it.
    pub fn new(
        config: TransportConfig,
        netdb: NetDb,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let status = ssu::StatusHandle::new();
        let inner = Arc::new(TransportsInner {
            config: config.clone(),
            netdb: netdb.clone(),
            peers: Mutex::new(HashMap::new()),
            banned: Mutex::new(HashMap::new()),
            bandwidth: Bandwidth::new(),
            dh_supplier: DhKeypairSupplier::new(),
            inbound_tx: inbound_tx.clone(),
            status: status.clone(),
        });
        let ntcp = Arc::new(NtcpServer::new(inner.clone()));
        let ssu = Arc::new(SsuServer::new(inner.clone(), status));
        (
            Self { inner, ntcp, ssu },
            inbound_rx,
        )
    }

    /// Bind listeners and start housekeeping. Startup failures here abort
    /// the router.
    pub async fn start(&self) -> garliccraft_core::Result<()> {
        self.ntcp.start(self.inner.config.ntcp_addr).await?;
        self.ssu.start(self.inner.config.ssu_addr).await?;
        self.inner.bandwidth.start_sampler();
        self.spawn_housekeeping();
        info!(
            ntcp = %self.inner.config.ntcp_addr,
            ssu = %self.inner.config.ssu_addr,
            "transports started"
        );
        Ok(())
    }

    /// Two-phase drain: stop accepting, then close every live session.
    pub async fn stop(&self) {
        self.ntcp.stop();
        self.ssu.stop().await;
        let handles: Vec<SessionHandle> = {
            let mut peers = self.inner.peers.lock().expect("peer table lock");
            peers
                .drain()
                .flat_map(|(_, p)| p.sessions.into_iter())
                .collect()
        };
        for session in handles {
            session.close().await;
        }
        info!("transports stopped");
    }

    pub fn bandwidth(&self) -> &Bandwidth {
        &self.inner.bandwidth
    }

    pub fn local_hash(&self) -> Hash {
        self.inner.config.keys.hash()
    }

    /// The RouterInfo currently advertised for this router.
    pub fn local_router_info(&self) -> Arc<RouterInfo> {
        self.inner
            .config
            .local_info
            .read()
            .expect("local info lock")
            .clone()
    }

    /// Actual bound listener addresses, once started.
    pub fn ntcp_local_addr(&self) -> Option<SocketAddr> {
        self.ntcp.local_addr()
    }

    pub fn ssu_local_addr(&self) -> Option<SocketAddr> {
        self.ssu.local_addr()
    }

    pub fn router_status(&self) -> RouterStatus {
        self.inner.status.get()
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.inner.is_banned(ip)
    }

    /// Queue one message to `to`, establishing a session if needed.
    pub fn send_message(&self, to: Hash, msg: I2npMessageRef) {
        self.send_messages(to, vec![msg]);
    }

    /// Queue a batch to `to`. If no session exists the messages wait in the
    /// peer's delayed queue while NTCP, then SSU, are attempted; an unknown
    /// peer first gets a RouterInfo lookup.
    pub fn send_messages(&self, to: Hash, msgs: Vec<I2npMessageRef>) {
        if to == self.inner.config.keys.hash() {
            warn!("dropping messages addressed to ourselves");
            return;
        }
        let session = {
            let mut peers = self.inner.peers.lock().expect("peer table lock");
            let peer = peers
                .entry(to)
                .or_insert_with(|| Peer::new(self.inner.netdb.find_router(&to)));
            if let Some(session) = peer.sessions.first() {
                Some(session.clone())
            } else {
                for msg in msgs.iter().cloned() {
                    if peer.delayed.len() >= MAX_DELAYED_MESSAGES {
                        peer.delayed.pop_front();
                    }
                    peer.delayed.push_back(msg);
                }
                None
            }
        };
        match session {
            Some(session) => session.send(msgs),
            None => self.connect_to(to),
        }
    }

    /// Drive session establishment for `to` in the background.
    fn connect_to(&self, to: Hash) {
        let this = self.clone();
        tokio::spawn(async move {
            let cached = {
                let peers = this.inner.peers.lock().expect("peer table lock");
                peers.get(&to).and_then(|p| p.router.clone())
            };
            let router = match cached.or_else(|| this.inner.netdb.find_router(&to)) {
                Some(r) => Some(r),
                // unknown peer: ask the netdb and retry in the completion
                None => this.inner.netdb.lookup_router(to).await,
            };
            let Some(router) = router else {
                debug!(peer = ?to, "no router info, dropping delayed messages");
                this.drop_peer(&to);
                return;
            };
            {
                let mut peers = this.inner.peers.lock().expect("peer table lock");
                if let Some(peer) = peers.get_mut(&to) {
                    if !peer.sessions.is_empty() {
                        return; // raced with an inbound session
                    }
                    peer.router = Some(router.clone());
                    peer.num_attempts += 1;
                    if peer.num_attempts > 3 {
                        peers.remove(&to);
                        this.inner.netdb.mark_unreachable(&to);
                        return;
                    }
                }
            }
            // NTCP first, SSU second
            let mut connected = if router.address(TransportStyle::Ntcp).is_some() {
                this.ntcp.connect(router.clone()).await.is_ok()
            } else {
                false
            };
            if !connected && router.address(TransportStyle::Ssu).is_some() {
                match this.ssu.connect(router.clone()).await {
                    Ok(()) => connected = true,
                    Err(err) => debug!(peer = ?to, %err, "ssu establishment failed"),
                }
            }
            if !connected {
                // no transport could reach the peer; shed it and remember
                debug!(peer = ?to, "all session attempts failed");
                this.inner.netdb.mark_unreachable(&to);
                this.drop_peer(&to);
            }
        });
    }

    fn drop_peer(&self, to: &Hash) {
        self.inner.peers.lock().expect("peer table lock").remove(to);
    }

    fn spawn_housekeeping(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(10));
            loop {
                tick.tick().await;
                let now = Instant::now();
                inner.peers.lock().expect("peer table lock").retain(|hash, peer| {
                    peer.sessions.retain(|s| !s.is_closed());
                    let keep = !peer.sessions.is_empty()
                        || now.duration_since(peer.created_at) < PEER_EVICTION_TIMEOUT;
                    if !keep {
                        debug!(peer = ?hash, "evicting sessionless peer");
                    }
                    keep
                });
                inner
                    .banned
                    .lock()
                    .expect("ban list lock")
                    .retain(|_, until| *until > now);
            }
        });
    }
}

impl TransportsInner {
    fn is_banned(&self, ip: &IpAddr) -> bool {
        self.banned
            .lock()
            .expect("ban list lock")
            .get(ip)
            .is_some_and(|until| *until > Instant::now())
    }

    fn ban(&self, ip: IpAddr) {
        warn!(%ip, "banning peer address");
        self.banned
            .lock()
            .expect("ban list lock")
            .insert(ip, Instant::now() + BAN_TIMEOUT);
    }

    /// Register an established session and flush the peer's delayed queue.
    fn register_session(&self, remote: Hash, handle: SessionHandle) {
        let delayed: Vec<I2npMessageRef> = {
            let mut peers = self.peers.lock().expect("peer table lock");
            let peer = peers.entry(remote).or_insert_with(|| Peer::new(None));
            peer.sessions.push(handle.clone());
            peer.num_attempts = 0;
            peer.delayed.drain(..).collect()
        };
        if !delayed.is_empty() {
            debug!(peer = ?remote, count = delayed.len(), "flushing delayed messages");
            handle.send(delayed);
        }
    }

    fn unregister_session(&self, remote: &Hash, kind: TransportKind) {
        let mut peers = self.peers.lock().expect("peer table lock");
        if let Some(peer) = peers.get_mut(remote) {
            peer.sessions.retain(|s| s.kind() != kind || !s.is_closed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garliccraft_core::Capabilities;
    use garliccraft_crypto::SigType;

    fn test_config() -> TransportConfig {
        let keys = Arc::new(PrivateKeys::generate(SigType::Ed25519).unwrap());
        let mut info = RouterInfo::new(
            keys.identity().clone(),
            garliccraft_core::now_ms(),
            vec![],
            Capabilities::REACHABLE,
        );
        info.sign(&keys).unwrap();
        TransportConfig {
            keys,
            local_info: Arc::new(RwLock::new(Arc::new(info))),
            ntcp_addr: "127.0.0.1:0".parse().unwrap(),
            ssu_addr: "127.0.0.1:0".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_ban_expires() {
        let (transports, _rx) = Transports::new(test_config(), NetDb::new_for_tests());
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        assert!(!transports.is_banned(&ip));
        transports.inner.ban(ip);
        assert!(transports.is_banned(&ip));
        // expiry is wall-clock driven; force it by rewriting the entry
        transports
            .inner
            .banned
            .lock()
            .unwrap()
            .insert(ip, Instant::now() - Duration::from_secs(1));
        assert!(!transports.is_banned(&ip));
    }

    #[tokio::test]
    async fn test_messages_delay_until_session() {
        let (transports, _rx) = Transports::new(test_config(), NetDb::new_for_tests());
        let peer_hash = Hash::digest(b"peer");
        let msg = garliccraft_core::i2np::I2npMessage::new(
            garliccraft_core::i2np::MessageType::Data,
            bytes::Bytes::from_static(b"x"),
        )
        .shared();
        transports.send_message(peer_hash, msg);
        // unknown peer with no netdb entry: message parked in delayed queue
        // until the lookup fails and the peer is dropped
        let delayed = {
            let peers = transports.inner.peers.lock().unwrap();
            peers.get(&peer_hash).map(|p| p.delayed.len())
        };
        assert!(matches!(delayed, Some(1) | None));
    }
}
