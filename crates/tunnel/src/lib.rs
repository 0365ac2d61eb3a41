//! GarlicCraft Tunnels
//!
//! The tunnel subsystem: pools of our own layered tunnels, transit relaying
//! for other routers' tunnels, build-request chains, and the 1024-byte
//! frame codec that carries I2NP through them.

mod build;
mod message;
mod participating;
mod pool;
mod tunnel;

pub use build::{
    apply_reply, build_records, find_our_record, process_reply, BuildRequestRecord,
    BUILD_REPLY_ACCEPT, BUILD_REPLY_BANDWIDTH, BUILD_REPLY_REJECT,
};
pub use message::{build_frames, open_frame, seal_frame, Delivery, Fragment, FragmentReassembler};
pub use participating::{ParticipatingTable, ParticipatingTunnel, TransitRole};
pub use pool::{PoolConfig, PoolEvent, PoolId, TunnelPool};
pub use tunnel::{Tunnel, TunnelHop, TunnelState, TUNNEL_EXPIRING_THRESHOLD_MS, TUNNEL_LIFETIME_MS};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use garliccraft_core::i2np::{
    I2npMessage, MessageType, TunnelBuild, TunnelData, TunnelGateway, TUNNEL_BUILD_RECORD_SIZE,
};
use garliccraft_core::{
    now_ms, now_secs, CoreError, Hash, PrivateKeys, Result, RouterInfo, TransportStyle, TunnelId,
};
use garliccraft_crypto::{rand_u32_nonzero, tunnel_encrypt, TUNNEL_DATA_SIZE};
use garliccraft_netdb::NetDb;
use garliccraft_transport::Transports;

/// A build not answered within this budget has failed.
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on concurrent transit tunnels.
pub const DEFAULT_MAX_PARTICIPATING: usize = 2500;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

/// A message that left the tunnel layer and terminates above it.
///
/// `pool` names the tunnel pool whose inbound tunnel delivered it, when
/// there is one; the dispatcher uses it to find the owning destination.
#[derive(Debug)]
pub enum TunnelDelivery {
    /// Terminates at this router: hand to the router dispatcher.
    Local {
        msg: I2npMessage,
        pool: Option<PoolId>,
    },
    /// Addressed to a local destination.
    ToDestination {
        dest: Hash,
        msg: I2npMessage,
        pool: Option<PoolId>,
    },
}

struct PendingBuild {
    pool: PoolId,
    is_inbound: bool,
    hops: Vec<TunnelHop>,
    slot_of_hop: Vec<usize>,
    our_tunnel_id: TunnelId,
    deadline: std::time::Instant,
}

struct TunnelsInner {
    keys: Arc<PrivateKeys>,
    local_hash: Hash,
    netdb: NetDb,
    transports: Transports,
    pools: Mutex<HashMap<PoolId, TunnelPool>>,
    next_pool_id: AtomicU32,
    participating: Mutex<ParticipatingTable>,
    pending: Mutex<HashMap<u32, PendingBuild>>,
    /// Our inbound tunnels: receive id → owning pool.
    inbound_index: Mutex<HashMap<TunnelId, PoolId>>,
    /// Reassembly state per source tunnel.
    reassemblers: Mutex<HashMap<TunnelId, FragmentReassembler>>,
    delivery_tx: mpsc::Sender<TunnelDelivery>,
}

/// The tunnel registry, shared by handle.
#[derive(Clone)]
pub struct Tunnels {
    inner: Arc<TunnelsInner>,
}

impl Tunnels {
    pub fn new(
        keys: Arc<PrivateKeys>,
        netdb: NetDb,
        transports: Transports,
        max_participating: usize,
    ) -> (Self, mpsc::Receiver<TunnelDelivery>) {
        let (delivery_tx, delivery_rx) = mpsc::channel(256);
        let local_hash = keys.hash();
        (
            Self {
                inner: Arc::new(TunnelsInner {
                    keys,
                    local_hash,
                    netdb,
                    transports,
                    pools: Mutex::new(HashMap::new()),
                    next_pool_id: AtomicU32::new(1),
                    participating: Mutex::new(ParticipatingTable::new(max_participating)),
                    pending: Mutex::new(HashMap::new()),
                    inbound_index: Mutex::new(HashMap::new()),
                    reassemblers: Mutex::new(HashMap::new()),
                    delivery_tx,
                }),
            },
            delivery_rx,
        )
    }

    pub fn start(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            loop {
                tick.tick().await;
                this.housekeeping();
            }
        });
        info!("tunnels started");
    }

    /// Stop accepting new builds and drop pool state.
    pub fn stop(&self) {
        self.inner.pending.lock().expect("pending lock").clear();
        self.inner.pools.lock().expect("pools lock").clear();
        self.inner.inbound_index.lock().expect("index lock").clear();
        info!("tunnels stopped");
    }

    pub fn participating_count(&self) -> usize {
        self.inner.participating.lock().expect("participating lock").len()
    }

    pub fn create_pool(&self, config: PoolConfig, events: mpsc::Sender<PoolEvent>) -> PoolId {
        let id = self.inner.next_pool_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .pools
            .lock()
            .expect("pools lock")
            .insert(id, TunnelPool::new(id, config, events));
        id
    }

    pub fn remove_pool(&self, pool_id: PoolId) {
        let removed = self.inner.pools.lock().expect("pools lock").remove(&pool_id);
        if let Some(pool) = removed {
            let mut index = self.inner.inbound_index.lock().expect("index lock");
            for tunnel in pool.tunnels() {
                if tunnel.is_inbound {
                    index.remove(&tunnel.id);
                }
            }
        }
    }

    /// Current leases for the pool's owner.
    pub fn pool_leases(&self, pool_id: PoolId) -> Vec<(Hash, TunnelId, u64)> {
        self.inner
            .pools
            .lock()
            .expect("pools lock")
            .get(&pool_id)
            .map(|p| p.leases(now_ms()))
            .unwrap_or_default()
    }

    pub fn pool_ready(&self, pool_id: PoolId) -> bool {
        let pools = self.inner.pools.lock().expect("pools lock");
        let now = now_ms();
        pools.get(&pool_id).is_some_and(|p| {
            p.established(true, now).next().is_some() && p.established(false, now).next().is_some()
        })
    }

    /// Send `msg` out through one of `pool`'s outbound tunnels so that the
    /// terminal hop applies `delivery`.
    pub fn send_through_pool(
        &self,
        pool_id: PoolId,
        delivery: Delivery,
        msg: &I2npMessage,
    ) -> Result<()> {
        let encoded = msg.encode();
        let (first_hop, first_tunnel, frames) = {
            let mut pools = self.inner.pools.lock().expect("pools lock");
            let pool = pools
                .get_mut(&pool_id)
                .ok_or(CoreError::Malformed("no such pool"))?;
            let tunnel = pool
                .select_outbound(now_ms())
                .ok_or(CoreError::Timeout("no outbound tunnel"))?;
            let mut frames = build_frames(delivery, msg.msg_id, &encoded);
            for frame in frames.iter_mut() {
                tunnel.apply_layers(frame);
            }
            let (hop, id) = tunnel.first_hop();
            (hop, id, frames)
        };
        for frame in frames {
            let data = TunnelData {
                tunnel_id: first_tunnel,
                data: frame,
            };
            let msg = I2npMessage::new(MessageType::TunnelData, data.encode()).shared();
            self.inner.transports.send_message(first_hop, msg);
        }
        Ok(())
    }

    /// All tunnel-layer message types funnel through here from the router
    /// dispatcher.
    pub async fn handle_message(&self, from: Hash, msg: &I2npMessage) -> Result<()> {
        match msg.msg_type {
            MessageType::TunnelData => self.handle_tunnel_data(&msg.payload).await,
            MessageType::TunnelGateway => self.handle_tunnel_gateway(&msg.payload).await,
            MessageType::TunnelBuild => self.handle_build(from, msg).await,
            MessageType::TunnelBuildReply => self.handle_build_reply(msg),
            _ => Err(CoreError::Malformed("not a tunnel message")),
        }
    }

    async fn handle_tunnel_data(&self, payload: &[u8]) -> Result<()> {
        let data = TunnelData::decode(payload)?;

        // our own inbound tunnel?
        let pool_id = {
            let index = self.inner.inbound_index.lock().expect("index lock");
            index.get(&data.tunnel_id).copied()
        };
        if let Some(pool_id) = pool_id {
            let mut frame = data.data;
            {
                let pools = self.inner.pools.lock().expect("pools lock");
                let pool = pools.get(&pool_id).ok_or(CoreError::Shutdown)?;
                let tunnel = pool
                    .get(&data.tunnel_id)
                    .ok_or(CoreError::Malformed("unknown inbound tunnel"))?;
                tunnel.apply_layers(&mut frame);
            }
            return self.dispatch_frame(data.tunnel_id, Some(pool_id), &frame).await;
        }

        // a transit tunnel we relay for someone else
        let entry = {
            let table = self.inner.participating.lock().expect("participating lock");
            table.get(&data.tunnel_id).cloned()
        };
        let Some(entry) = entry else {
            return Err(CoreError::Malformed("unknown tunnel id"));
        };
        let mut frame = data.data;
        tunnel_encrypt(&mut frame, &entry.layer_key, &entry.iv_key);
        self.inner
            .participating
            .lock()
            .expect("participating lock")
            .record_relayed(&data.tunnel_id, TUNNEL_DATA_SIZE as u64);

        match entry.role {
            TransitRole::Participant | TransitRole::InboundGateway => {
                let forwarded = TunnelData {
                    tunnel_id: entry.next_tunnel_id,
                    data: frame,
                };
                let msg =
                    I2npMessage::new(MessageType::TunnelData, forwarded.encode()).shared();
                self.inner.transports.send_message(entry.next_hop, msg);
                Ok(())
            }
            TransitRole::OutboundEndpoint => {
                // every layer is cancelled now; parse and route fragments
                self.dispatch_frame(data.tunnel_id, None, &frame).await
            }
        }
    }

    /// Parse a cleartext frame and route its fragments.
    async fn dispatch_frame(
        &self,
        source: TunnelId,
        pool: Option<PoolId>,
        frame: &[u8; TUNNEL_DATA_SIZE],
    ) -> Result<()> {
        let fragments = open_frame(frame)?;
        let mut complete = Vec::new();
        {
            let mut reassemblers = self.inner.reassemblers.lock().expect("reassembler lock");
            let reassembler = reassemblers.entry(source).or_default();
            for fragment in fragments {
                if let Some(done) = reassembler.feed(fragment) {
                    complete.push(done);
                }
            }
        }
        for (delivery, payload) in complete {
            if let Err(err) = self.deliver(delivery, pool, &payload).await {
                debug!(%err, "tunnel fragment delivery failed");
            }
        }
        Ok(())
    }

    async fn deliver(&self, delivery: Delivery, pool: Option<PoolId>, payload: &[u8]) -> Result<()> {
        match delivery {
            Delivery::Local => {
                let msg = I2npMessage::decode(payload)?;
                self.inner
                    .delivery_tx
                    .send(TunnelDelivery::Local { msg, pool })
                    .await
                    .map_err(|_| CoreError::Shutdown)
            }
            Delivery::Destination(dest) => {
                let msg = I2npMessage::decode(payload)?;
                self.inner
                    .delivery_tx
                    .send(TunnelDelivery::ToDestination { dest, msg, pool })
                    .await
                    .map_err(|_| CoreError::Shutdown)
            }
            Delivery::Router(router) => {
                let msg = I2npMessage::decode(payload)?;
                if router == self.inner.local_hash {
                    self.inner
                        .delivery_tx
                        .send(TunnelDelivery::Local { msg, pool })
                        .await
                        .map_err(|_| CoreError::Shutdown)
                } else {
                    self.inner.transports.send_message(router, msg.shared());
                    Ok(())
                }
            }
            Delivery::Tunnel(gateway, tunnel_id) => {
                let wrapped = TunnelGateway {
                    tunnel_id,
                    data: Bytes::copy_from_slice(payload),
                };
                let msg = I2npMessage::new(MessageType::TunnelGateway, wrapped.encode());
                if gateway == self.inner.local_hash {
                    self.handle_tunnel_gateway(&msg.payload).await
                } else {
                    self.inner.transports.send_message(gateway, msg.shared());
                    Ok(())
                }
            }
        }
    }

    async fn handle_tunnel_gateway(&self, payload: &[u8]) -> Result<()> {
        let gateway = TunnelGateway::decode(payload)?;

        // as inbound gateway for a tunnel we relay: wrap into frames and
        // push them down the tunnel
        let entry = {
            let table = self.inner.participating.lock().expect("participating lock");
            table.get(&gateway.tunnel_id).cloned()
        };
        if let Some(entry) = entry {
            if entry.role != TransitRole::InboundGateway {
                return Err(CoreError::Malformed("gateway message for non-gateway"));
            }
            let msg_id = rand_u32_nonzero();
            let mut frames = build_frames(Delivery::Local, msg_id, &gateway.data);
            for frame in frames.iter_mut() {
                tunnel_encrypt(frame, &entry.layer_key, &entry.iv_key);
                let forwarded = TunnelData {
                    tunnel_id: entry.next_tunnel_id,
                    data: *frame,
                };
                let msg =
                    I2npMessage::new(MessageType::TunnelData, forwarded.encode()).shared();
                self.inner.transports.send_message(entry.next_hop, msg);
            }
            self.inner
                .participating
                .lock()
                .expect("participating lock")
                .record_relayed(&gateway.tunnel_id, gateway.data.len() as u64);
            return Ok(());
        }

        // a gateway message for one of our own inbound tunnels (zero-hop
        // reply path): the payload terminates here
        let msg = I2npMessage::decode(&gateway.data)?;
        let pool = {
            let index = self.inner.inbound_index.lock().expect("index lock");
            index.get(&gateway.tunnel_id).copied()
        };
        self.inner
            .delivery_tx
            .send(TunnelDelivery::Local { msg, pool })
            .await
            .map_err(|_| CoreError::Shutdown)
    }

    /// A TunnelBuild can be a request for us to join (participant path) or
    /// the final delivery of our own inbound build (creator path).
    async fn handle_build(&self, _from: Hash, msg: &I2npMessage) -> Result<()> {
        let mut build = TunnelBuild::decode(&msg.payload)?;

        // our own inbound build coming home?
        if self.try_complete_build(msg.msg_id, &mut build.records) {
            return Ok(());
        }

        let found = find_our_record(&build.records, &self.inner.local_hash, &self.inner.keys)?;
        let record = found.record;

        // low-bandwidth-class routers shed participating traffic once the
        // instantaneous rate crosses the cap
        let throttled = self.inner.transports.local_router_info().is_low_bandwidth()
            && self.inner.transports.bandwidth().exceeds_low_limit();
        let reply = {
            let table = self.inner.participating.lock().expect("participating lock");
            if table.at_capacity() || throttled {
                BUILD_REPLY_BANDWIDTH
            } else {
                BUILD_REPLY_ACCEPT
            }
        };

        if reply == BUILD_REPLY_ACCEPT {
            let role = if record.is_inbound_gateway {
                TransitRole::InboundGateway
            } else if record.is_outbound_endpoint {
                TransitRole::OutboundEndpoint
            } else {
                TransitRole::Participant
            };
            let inserted = self.inner.participating.lock().expect("participating lock").insert(
                record.receive_tunnel,
                record.next_ident,
                record.next_tunnel,
                record.layer_key,
                record.iv_key,
                role,
            );
            if !inserted {
                // raced to capacity; fall through with a bandwidth reply
                return self
                    .forward_build(&mut build, &record, found.index, BUILD_REPLY_BANDWIDTH)
                    .await;
            }
            debug!(
                tunnel = record.receive_tunnel,
                ?role,
                "accepted participating tunnel"
            );
        }
        self.forward_build(&mut build, &record, found.index, reply).await
    }

    async fn forward_build(
        &self,
        build: &mut TunnelBuild,
        record: &BuildRequestRecord,
        our_index: usize,
        reply: u8,
    ) -> Result<()> {
        apply_reply(
            &mut build.records,
            our_index,
            &record.reply_key,
            &record.reply_iv,
            reply,
        );

        if record.is_outbound_endpoint {
            // the processed records become the build reply, delivered to the
            // creator via its reply tunnel (or directly when bootstrapping)
            let reply_msg = I2npMessage::with_id(
                MessageType::TunnelBuildReply,
                record.send_msg_id,
                TunnelBuild {
                    records: build.records.clone(),
                }
                .encode(),
            );
            if record.next_tunnel == 0 {
                self.inner
                    .transports
                    .send_message(record.next_ident, reply_msg.shared());
            } else {
                let wrapped = TunnelGateway {
                    tunnel_id: record.next_tunnel,
                    data: Bytes::from(reply_msg.encode()),
                };
                let msg = I2npMessage::new(MessageType::TunnelGateway, wrapped.encode());
                self.inner
                    .transports
                    .send_message(record.next_ident, msg.shared());
            }
            return Ok(());
        }

        // middle hop (or inbound gateway): pass the build onward; for the
        // last inbound hop the "next hop" is the creator, completing the
        // build message's journey
        let forwarded = I2npMessage::with_id(
            MessageType::TunnelBuild,
            record.send_msg_id.max(1),
            TunnelBuild {
                records: build.records.clone(),
            }
            .encode(),
        );
        self.inner
            .transports
            .send_message(record.next_ident, forwarded.shared());
        Ok(())
    }

    fn handle_build_reply(&self, msg: &I2npMessage) -> Result<()> {
        let mut build = TunnelBuild::decode(&msg.payload)?;
        if self.try_complete_build(msg.msg_id, &mut build.records) {
            Ok(())
        } else {
            Err(CoreError::Malformed("unmatched build reply"))
        }
    }

    /// Match a build reply against a pending build and finalize the tunnel.
    fn try_complete_build(
        &self,
        msg_id: u32,
        records: &mut [[u8; TUNNEL_BUILD_RECORD_SIZE]],
    ) -> bool {
        let pending = {
            let mut pending = self.inner.pending.lock().expect("pending lock");
            pending.remove(&msg_id)
        };
        let Some(pending) = pending else {
            return false;
        };

        let accepted = process_reply(records, &pending.hops, &pending.slot_of_hop).is_ok();
        let mut pools = self.inner.pools.lock().expect("pools lock");
        let Some(pool) = pools.get_mut(&pending.pool) else {
            return true;
        };
        if let Some(tunnel) = pool.get_mut(&pending.our_tunnel_id) {
            if accepted {
                tunnel.state = TunnelState::Established;
                info!(
                    tunnel = pending.our_tunnel_id,
                    inbound = pending.is_inbound,
                    hops = pending.hops.len(),
                    "tunnel established"
                );
                if pending.is_inbound {
                    let _ = pool.events.try_send(PoolEvent::InboundChanged);
                }
            } else {
                warn!(tunnel = pending.our_tunnel_id, "tunnel build failed");
                tunnel.state = TunnelState::Failed;
            }
        }
        true
    }

    /// Select hops and launch one build for `pool`.
    fn launch_build(&self, pool_id: PoolId, is_inbound: bool) -> Result<()> {
        let (length, explicit) = {
            let pools = self.inner.pools.lock().expect("pools lock");
            let pool = pools.get(&pool_id).ok_or(CoreError::Shutdown)?;
            (pool.config.length, pool.config.explicit_peers.clone())
        };

        let hop_infos = self.select_hops(length, explicit.as_deref())?;
        let mut hops: Vec<TunnelHop> = hop_infos
            .iter()
            .map(|info| TunnelHop::generate(info.hash()))
            .collect();
        for i in 0..hops.len() - 1 {
            hops[i].next_tunnel_id = hops[i + 1].recv_tunnel_id;
        }

        let reply_msg_id = rand_u32_nonzero();
        let our_tunnel_id;
        let endpoint_ident;

        if is_inbound {
            // last hop forwards to us on a fresh id we listen on
            our_tunnel_id = rand_u32_nonzero();
            let n = hops.len();
            hops[n - 1].next_tunnel_id = our_tunnel_id;
            endpoint_ident = self.inner.local_hash;
        } else {
            // reply comes back through one of our inbound tunnels, or
            // directly while bootstrapping
            our_tunnel_id = hops[0].recv_tunnel_id;
            let reply_path = self.any_inbound_lease(pool_id);
            let n = hops.len();
            match reply_path {
                Some((gateway, tunnel_id)) => {
                    hops[n - 1].next_tunnel_id = tunnel_id;
                    endpoint_ident = gateway;
                }
                None => {
                    hops[n - 1].next_tunnel_id = 0;
                    endpoint_ident = self.inner.local_hash;
                }
            }
        }

        let infos: Vec<&RouterInfo> = hop_infos.iter().map(Arc::as_ref).collect();
        let (records, slot_of_hop) = build_records(
            &hops,
            &infos,
            is_inbound,
            endpoint_ident,
            reply_msg_id,
            now_secs() as u32,
        )?;

        let tunnel = Tunnel::new(hops.clone(), is_inbound, our_tunnel_id);
        {
            let mut pools = self.inner.pools.lock().expect("pools lock");
            if let Some(pool) = pools.get_mut(&pool_id) {
                pool.insert(tunnel);
            }
        }
        if is_inbound {
            self.inner
                .inbound_index
                .lock()
                .expect("index lock")
                .insert(our_tunnel_id, pool_id);
        }
        self.inner.pending.lock().expect("pending lock").insert(
            reply_msg_id,
            PendingBuild {
                pool: pool_id,
                is_inbound,
                hops: hops.clone(),
                slot_of_hop,
                our_tunnel_id,
                deadline: std::time::Instant::now() + BUILD_TIMEOUT,
            },
        );

        let build_msg = I2npMessage::new(
            MessageType::TunnelBuild,
            TunnelBuild { records }.encode(),
        );
        let first_hop = hops[0].ident;
        if is_inbound {
            // reach the distant gateway through an outbound tunnel when we
            // have one; directly otherwise
            let sent = self
                .send_through_pool(pool_id, Delivery::Router(first_hop), &build_msg)
                .is_ok();
            if !sent {
                self.inner
                    .transports
                    .send_message(first_hop, build_msg.shared());
            }
        } else {
            self.inner
                .transports
                .send_message(first_hop, build_msg.shared());
        }
        debug!(pool = pool_id, inbound = is_inbound, "tunnel build launched");
        Ok(())
    }

    /// Hop selection: reachable, distinct, not us, transport-compatible.
    fn select_hops(
        &self,
        length: usize,
        explicit: Option<&[Hash]>,
    ) -> Result<Vec<Arc<RouterInfo>>> {
        let mut chosen: Vec<Arc<RouterInfo>> = Vec::with_capacity(length);
        let mut used: HashSet<Hash> = HashSet::new();
        used.insert(self.inner.local_hash);

        if let Some(peers) = explicit {
            for hash in peers.iter().take(length) {
                let info = self
                    .inner
                    .netdb
                    .find_router(hash)
                    .ok_or(CoreError::Unreachable)?;
                chosen.push(info);
            }
            if chosen.len() < length {
                return Err(CoreError::Unreachable);
            }
            return Ok(chosen);
        }

        for _ in 0..length {
            let next = self
                .inner
                .netdb
                .select_random_router(|info| {
                    !used.contains(&info.hash())
                        && (info.address(TransportStyle::Ntcp).is_some()
                            || info.address(TransportStyle::Ssu).is_some())
                })
                .ok_or(CoreError::Unreachable)?;
            used.insert(next.hash());
            chosen.push(next);
        }
        Ok(chosen)
    }

    fn any_inbound_lease(&self, pool_id: PoolId) -> Option<(Hash, TunnelId)> {
        let pools = self.inner.pools.lock().expect("pools lock");
        let pool = pools.get(&pool_id)?;
        let result = pool
            .established(true, now_ms())
            .next()
            .map(|t| t.gateway());
        result
    }

    fn housekeeping(&self) {
        let now = now_ms();

        // expired transit entries
        let evicted = self
            .inner
            .participating
            .lock()
            .expect("participating lock")
            .expire(now);
        if evicted > 0 {
            debug!(evicted, "expired participating tunnels");
        }

        // timed-out builds
        let timed_out: Vec<(u32, PoolId, TunnelId)> = {
            let mut pending = self.inner.pending.lock().expect("pending lock");
            let now_instant = std::time::Instant::now();
            let expired: Vec<u32> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now_instant)
                .map(|(id, _)| *id)
                .collect();
            expired
                .into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p.pool, p.our_tunnel_id)))
                .collect()
        };
        for (_, pool_id, tunnel_id) in timed_out {
            warn!(tunnel = tunnel_id, "tunnel build timed out");
            let mut pools = self.inner.pools.lock().expect("pools lock");
            if let Some(pool) = pools.get_mut(&pool_id) {
                if let Some(tunnel) = pool.get_mut(&tunnel_id) {
                    tunnel.state = TunnelState::Failed;
                }
            }
        }

        // pool maintenance: sweep dead tunnels, build replacements
        let mut deficits: Vec<(PoolId, bool, usize)> = Vec::new();
        {
            let mut pools = self.inner.pools.lock().expect("pools lock");
            let mut dead_inbound: Vec<TunnelId> = Vec::new();
            for pool in pools.values_mut() {
                let inbound_before: Vec<TunnelId> = pool
                    .tunnels()
                    .filter(|t| t.is_inbound)
                    .map(|t| t.id)
                    .collect();
                if pool.sweep(now) {
                    let _ = pool.events.try_send(PoolEvent::InboundChanged);
                }
                for id in inbound_before {
                    if pool.get(&id).is_none() {
                        dead_inbound.push(id);
                    }
                }
                for inbound in [true, false] {
                    let target = if inbound {
                        pool.config.inbound_count
                    } else {
                        pool.config.outbound_count
                    };
                    let healthy = pool.healthy_count(inbound, now);
                    let pending = pool.pending_count(inbound);
                    if healthy + pending < target {
                        deficits.push((pool.id, inbound, target - healthy - pending));
                    }
                }
            }
            if !dead_inbound.is_empty() {
                let mut index = self.inner.inbound_index.lock().expect("index lock");
                for id in dead_inbound {
                    index.remove(&id);
                }
            }
        }
        for (pool_id, inbound, count) in deficits {
            for _ in 0..count {
                if let Err(err) = self.launch_build(pool_id, inbound) {
                    debug!(pool = pool_id, inbound, %err, "cannot launch build");
                    break;
                }
            }
        }

        // stale fragment state
        let mut reassemblers = self.inner.reassemblers.lock().expect("reassembler lock");
        for reassembler in reassemblers.values_mut() {
            reassembler.expire();
        }
    }
}
