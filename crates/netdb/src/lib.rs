//! GarlicCraft NetDb
//!
//! The Kademlia-like distributed store of RouterInfo and LeaseSet records.
//! In-memory tables shared read-mostly, flood-fill store and lookup
//! protocols against the daily-rotated routing keyspace, RouterInfo
//! persistence, and exploratory discovery.

mod persistence;
mod requests;

pub use persistence::Persistence;
pub use requests::{LookupResult, PendingRequests, MAX_LOOKUP_FLOODFILLS, MAX_LOOKUP_TIMEOUT};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use garliccraft_core::i2np::{
    DatabaseLookup, DatabaseSearchReply, DatabaseStore, DeliveryStatus, I2npMessage, MessageType,
    TunnelGateway, STORE_TYPE_LEASE_SET, STORE_TYPE_ROUTER_INFO,
};
use garliccraft_core::{
    now_ms, CoreError, Hash, LeaseSet, Result, RouterInfo, RoutingKeyCalculator,
};

/// Below this many known routers the router signals for a reseed.
pub const MIN_REQUIRED_ROUTERS: usize = 25;

/// Exploration stops once the table is comfortably populated.
pub const EXPLORATION_ROUTER_TARGET: usize = 2500;

/// Exploratory lookups fire on this cadence while under-populated.
pub const EXPLORATION_INTERVAL: Duration = Duration::from_secs(30);

/// Stores are flooded to this many closest floodfills.
pub const FLOOD_REDUNDANCY: usize = 3;

/// Peers that refused every session attempt stay marked unreachable.
pub const UNREACHABLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// A message NetDb wants delivered to a specific router.
#[derive(Debug)]
pub struct NetDbOutbound {
    pub to: Hash,
    pub msg: I2npMessage,
}

struct NetDbInner {
    local_hash: Hash,
    is_floodfill: bool,
    routers: RwLock<HashMap<Hash, Arc<RouterInfo>>>,
    lease_sets: RwLock<HashMap<Hash, Arc<LeaseSet>>>,
    floodfills: RwLock<Vec<Hash>>,
    unreachable: Mutex<HashMap<Hash, Instant>>,
    routing_keys: Mutex<RoutingKeyCalculator>,
    requests: Mutex<PendingRequests>,
    outbound_tx: mpsc::Sender<NetDbOutbound>,
    persistence: Option<Persistence>,
    reseed_needed: AtomicBool,
    aggressive_expiry: AtomicBool,
}

/// Cheap-to-clone handle on the network database.
#[derive(Clone)]
pub struct NetDb {
    inner: Arc<NetDbInner>,
}

impl NetDb {
    /// Build the database. Outbound protocol messages appear on the
    /// returned receiver; the router wires it into the transports.
    pub fn new(
        local_hash: Hash,
        is_floodfill: bool,
        data_dir: Option<PathBuf>,
    ) -> (Self, mpsc::Receiver<NetDbOutbound>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let netdb = Self {
            inner: Arc::new(NetDbInner {
                local_hash,
                is_floodfill,
                routers: RwLock::new(HashMap::new()),
                lease_sets: RwLock::new(HashMap::new()),
                floodfills: RwLock::new(Vec::new()),
                unreachable: Mutex::new(HashMap::new()),
                routing_keys: Mutex::new(RoutingKeyCalculator::new()),
                requests: Mutex::new(PendingRequests::new()),
                outbound_tx,
                persistence: data_dir.map(Persistence::new),
                reseed_needed: AtomicBool::new(false),
                aggressive_expiry: AtomicBool::new(false),
            }),
        };
        (netdb, outbound_rx)
    }

    /// A detached database for unit tests: no disk, outbound dropped.
    pub fn new_for_tests() -> Self {
        let (netdb, mut rx) = Self::new(Hash::digest(b"test-local"), false, None);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        netdb
    }

    /// Load persisted RouterInfos and start the background tasks.
    pub fn start(&self) -> Result<()> {
        if let Some(persistence) = &self.inner.persistence {
            let loaded = persistence.load_all()?;
            let count = loaded.len();
            for info in loaded {
                if let Err(err) = self.insert_router_info(info, false) {
                    debug!(%err, "skipping persisted router info");
                }
            }
            info!(count, "loaded netdb from disk");
        }
        if self.known_routers() < MIN_REQUIRED_ROUTERS {
            warn!(
                known = self.known_routers(),
                required = MIN_REQUIRED_ROUTERS,
                "too few routers known, reseed needed"
            );
            self.inner.reseed_needed.store(true, Ordering::Relaxed);
        }
        self.spawn_exploration();
        self.spawn_housekeeping();
        Ok(())
    }

    /// Persist current RouterInfos; part of shutdown.
    pub fn stop(&self) {
        if let Some(persistence) = &self.inner.persistence {
            let routers = self.inner.routers.read().expect("routers lock");
            for info in routers.values() {
                if let Err(err) = persistence.store(info) {
                    debug!(%err, "failed to persist router info");
                }
            }
        }
    }

    pub fn local_hash(&self) -> Hash {
        self.inner.local_hash
    }

    pub fn needs_reseed(&self) -> bool {
        self.inner.reseed_needed.load(Ordering::Relaxed)
    }

    /// Firewalled routers expire peers aggressively (their own address
    /// churns with the introducer set).
    pub fn set_aggressive_expiry(&self, on: bool) {
        self.inner.aggressive_expiry.store(on, Ordering::Relaxed);
    }

    pub fn known_routers(&self) -> usize {
        self.inner.routers.read().expect("routers lock").len()
    }

    pub fn known_floodfills(&self) -> usize {
        self.inner.floodfills.read().expect("floodfills lock").len()
    }

    pub fn find_router(&self, hash: &Hash) -> Option<Arc<RouterInfo>> {
        self.inner
            .routers
            .read()
            .expect("routers lock")
            .get(hash)
            .cloned()
    }

    pub fn find_lease_set(&self, hash: &Hash) -> Option<Arc<LeaseSet>> {
        let ls = self
            .inner
            .lease_sets
            .read()
            .expect("lease sets lock")
            .get(hash)
            .cloned()?;
        if ls.is_unusable(now_ms()) {
            self.inner
                .lease_sets
                .write()
                .expect("lease sets lock")
                .remove(hash);
            return None;
        }
        Some(ls)
    }

    /// Verify and insert a RouterInfo. Timestamps must be monotonic per
    /// identity; stale stores are dropped as duplicates.
    pub fn add_router_info(&self, data: &[u8]) -> Result<Arc<RouterInfo>> {
        let info = RouterInfo::from_bytes(data)?;
        info.verify()?;
        self.insert_router_info(info, true)
    }

    fn insert_router_info(&self, info: RouterInfo, persist: bool) -> Result<Arc<RouterInfo>> {
        let hash = info.hash();
        if hash == self.inner.local_hash {
            return Err(CoreError::Duplicate);
        }
        let info = Arc::new(info);
        {
            let mut routers = self.inner.routers.write().expect("routers lock");
            if let Some(existing) = routers.get(&hash) {
                if existing.published() >= info.published() {
                    return Err(CoreError::Duplicate);
                }
            }
            routers.insert(hash, info.clone());
        }
        {
            let mut floodfills = self.inner.floodfills.write().expect("floodfills lock");
            let listed = floodfills.contains(&hash);
            if info.is_floodfill() && !listed {
                floodfills.push(hash);
            } else if !info.is_floodfill() && listed {
                floodfills.retain(|h| h != &hash);
            }
        }
        if persist {
            if let Some(persistence) = &self.inner.persistence {
                let _ = persistence.store(&info);
            }
        }
        Ok(info)
    }

    /// Verify and insert a LeaseSet; expired sets are rejected.
    pub fn add_lease_set(&self, data: &[u8]) -> Result<Arc<LeaseSet>> {
        let ls = LeaseSet::from_bytes(data)?;
        ls.verify()?;
        if ls.is_unusable(now_ms()) {
            return Err(CoreError::Expired);
        }
        let ls = Arc::new(ls);
        self.inner
            .lease_sets
            .write()
            .expect("lease sets lock")
            .insert(ls.hash(), ls.clone());
        Ok(ls)
    }

    pub fn mark_unreachable(&self, hash: &Hash) {
        debug!(peer = ?hash, "marking unreachable");
        self.inner
            .unreachable
            .lock()
            .expect("unreachable lock")
            .insert(*hash, Instant::now());
    }

    pub fn is_unreachable(&self, hash: &Hash) -> bool {
        self.inner
            .unreachable
            .lock()
            .expect("unreachable lock")
            .get(hash)
            .is_some_and(|at| at.elapsed() < UNREACHABLE_TIMEOUT)
    }

    /// The floodfill minimizing `ident XOR routingKey(key)`, ties broken
    /// lexicographically on hash.
    pub fn closest_floodfill(&self, key: &Hash, excluded: &HashSet<Hash>) -> Option<Arc<RouterInfo>> {
        self.closest_floodfills(key, 1, excluded).into_iter().next()
    }

    pub fn closest_floodfills(
        &self,
        key: &Hash,
        n: usize,
        excluded: &HashSet<Hash>,
    ) -> Vec<Arc<RouterInfo>> {
        let target = self
            .inner
            .routing_keys
            .lock()
            .expect("routing keys lock")
            .key_for(key);
        let candidates: Vec<Hash> = {
            let floodfills = self.inner.floodfills.read().expect("floodfills lock");
            floodfills
                .iter()
                .filter(|h| !excluded.contains(h) && !self.is_unreachable(h))
                .copied()
                .collect()
        };
        let mut scored: Vec<(Hash, [u8; 32])> = candidates
            .into_iter()
            .map(|h| (h, h.xor_distance(&target)))
            .collect();
        scored.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let routers = self.inner.routers.read().expect("routers lock");
        scored
            .into_iter()
            .take(n)
            .filter_map(|(h, _)| routers.get(&h).cloned())
            .collect()
    }

    /// Random reachable router for tunnel hop selection.
    pub fn select_random_router<F>(&self, filter: F) -> Option<Arc<RouterInfo>>
    where
        F: Fn(&RouterInfo) -> bool,
    {
        let routers = self.inner.routers.read().expect("routers lock");
        let eligible: Vec<&Arc<RouterInfo>> = routers
            .values()
            .filter(|r| !r.is_unreachable() && !self.is_unreachable(&r.hash()) && filter(r))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let index = garliccraft_crypto::rand_in_range(0..eligible.len());
        Some(eligible[index].clone())
    }

    /// Iterative lookup for a RouterInfo, driven by DatabaseSearchReply
    /// responses. Budget: 7 floodfills or 5 seconds.
    pub async fn lookup_router(&self, key: Hash) -> Option<Arc<RouterInfo>> {
        if let Some(found) = self.find_router(&key) {
            return Some(found);
        }
        match self.lookup(key, false).await {
            Some(LookupResult::Router(info)) => Some(info),
            _ => None,
        }
    }

    /// Iterative lookup for a LeaseSet.
    pub async fn lookup_lease_set(&self, key: Hash) -> Option<Arc<LeaseSet>> {
        if let Some(found) = self.find_lease_set(&key) {
            return Some(found);
        }
        match self.lookup(key, false).await {
            Some(LookupResult::Lease(ls)) => Some(ls),
            _ => None,
        }
    }

    async fn lookup(&self, key: Hash, exploratory: bool) -> Option<LookupResult> {
        let rx = {
            let mut requests = self.inner.requests.lock().expect("requests lock");
            match requests.subscribe(key, exploratory) {
                (rx, true) => {
                    // new request: fire the first floodfill
                    let first = self.closest_floodfill(&key, &HashSet::new());
                    match first {
                        Some(ff) => {
                            requests.record_attempt(&key, ff.hash());
                            drop(requests);
                            self.send_lookup(key, ff.hash(), exploratory, Vec::new());
                        }
                        None => {
                            requests.fail(&key);
                            return None;
                        }
                    }
                    rx
                }
                (rx, false) => rx,
            }
        };
        match tokio::time::timeout(MAX_LOOKUP_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            _ => {
                self.inner
                    .requests
                    .lock()
                    .expect("requests lock")
                    .fail(&key);
                None
            }
        }
    }

    fn send_lookup(&self, key: Hash, to: Hash, exploratory: bool, excluded: Vec<Hash>) {
        let lookup = DatabaseLookup {
            key,
            from: self.inner.local_hash,
            reply_tunnel: None,
            exploratory,
            excluded,
        };
        let msg = I2npMessage::new(MessageType::DatabaseLookup, lookup.encode());
        self.queue_outbound(to, msg);
    }

    fn queue_outbound(&self, to: Hash, msg: I2npMessage) {
        if self
            .inner
            .outbound_tx
            .try_send(NetDbOutbound { to, msg })
            .is_err()
        {
            debug!(peer = ?to, "netdb outbound queue full, dropping");
        }
    }

    /// Entry point for all NetDb-typed I2NP messages.
    pub fn handle_message(&self, from: Hash, msg: &I2npMessage) -> Result<()> {
        match msg.msg_type {
            MessageType::DatabaseStore => self.on_store(from, &msg.payload),
            MessageType::DatabaseLookup => self.on_lookup(from, &msg.payload),
            MessageType::DatabaseSearchReply => self.on_search_reply(&msg.payload),
            _ => Err(CoreError::Malformed("not a netdb message")),
        }
    }

    fn on_store(&self, from: Hash, payload: &[u8]) -> Result<()> {
        let store = DatabaseStore::decode(payload)?;
        let result = match store.store_type {
            STORE_TYPE_ROUTER_INFO => self
                .add_router_info(&store.data)
                .map(LookupResult::Router),
            STORE_TYPE_LEASE_SET => self.add_lease_set(&store.data).map(LookupResult::Lease),
            _ => Err(CoreError::Malformed("unknown store type")),
        };

        match result {
            Ok(entry) => {
                // settle any lookup waiting on this key
                self.inner
                    .requests
                    .lock()
                    .expect("requests lock")
                    .complete(&store.key, entry);
            }
            Err(CoreError::Duplicate) => {}
            Err(err) => return Err(err),
        }

        if self.inner.is_floodfill && store.reply_token != 0 {
            self.flood(&store);
            let status = DeliveryStatus {
                msg_id: store.reply_token,
                timestamp: now_ms(),
            };
            let status_msg = I2npMessage::new(MessageType::DeliveryStatus, status.encode());
            if store.reply_gateway != Hash::ZERO {
                let gateway = TunnelGateway {
                    tunnel_id: store.reply_tunnel,
                    data: Bytes::from(status_msg.encode()),
                };
                let wrapped = I2npMessage::new(MessageType::TunnelGateway, gateway.encode());
                self.queue_outbound(store.reply_gateway, wrapped);
            } else {
                self.queue_outbound(from, status_msg);
            }
        }
        Ok(())
    }

    fn flood(&self, store: &DatabaseStore) {
        let mut excluded = HashSet::new();
        excluded.insert(self.inner.local_hash);
        let targets = self.closest_floodfills(&store.key, FLOOD_REDUNDANCY, &excluded);
        for target in targets {
            let flooded = DatabaseStore {
                key: store.key,
                store_type: store.store_type,
                reply_token: 0,
                reply_tunnel: 0,
                reply_gateway: Hash::ZERO,
                data: store.data.clone(),
            };
            let msg = I2npMessage::new(MessageType::DatabaseStore, flooded.encode());
            self.queue_outbound(target.hash(), msg);
        }
    }

    fn on_lookup(&self, from: Hash, payload: &[u8]) -> Result<()> {
        let lookup = DatabaseLookup::decode(payload)?;
        let reply_to = lookup.from;

        let stored: Option<(u8, Bytes)> = if lookup.exploratory {
            None
        } else if let Some(info) = self.find_router(&lookup.key) {
            Some((STORE_TYPE_ROUTER_INFO, Bytes::from(info.to_bytes())))
        } else {
            self.find_lease_set(&lookup.key)
                .map(|ls| (STORE_TYPE_LEASE_SET, Bytes::from(ls.to_bytes())))
        };

        let response = match stored {
            Some((store_type, data)) => {
                let store = DatabaseStore {
                    key: lookup.key,
                    store_type,
                    reply_token: 0,
                    reply_tunnel: 0,
                    reply_gateway: Hash::ZERO,
                    data,
                };
                I2npMessage::new(MessageType::DatabaseStore, store.encode())
            }
            None => {
                let mut excluded: HashSet<Hash> = lookup.excluded.iter().copied().collect();
                excluded.insert(self.inner.local_hash);
                let peers = self
                    .closest_floodfills(&lookup.key, FLOOD_REDUNDANCY, &excluded)
                    .iter()
                    .map(|r| r.hash())
                    .collect();
                let reply = DatabaseSearchReply {
                    key: lookup.key,
                    peers,
                    from: self.inner.local_hash,
                };
                I2npMessage::new(MessageType::DatabaseSearchReply, reply.encode())
            }
        };

        match lookup.reply_tunnel {
            Some(tunnel_id) => {
                let gateway = TunnelGateway {
                    tunnel_id,
                    data: Bytes::from(response.encode()),
                };
                let wrapped = I2npMessage::new(MessageType::TunnelGateway, gateway.encode());
                self.queue_outbound(reply_to, wrapped);
            }
            None => {
                let to = if reply_to == Hash::ZERO { from } else { reply_to };
                self.queue_outbound(to, response);
            }
        }
        Ok(())
    }

    fn on_search_reply(&self, payload: &[u8]) -> Result<()> {
        let reply = DatabaseSearchReply::decode(payload)?;
        let next = {
            let mut requests = self.inner.requests.lock().expect("requests lock");
            requests.on_negative_reply(&reply.key, reply.from)
        };
        match next {
            requests::NextStep::Retry(excluded) => {
                let excluded_set: HashSet<Hash> = excluded.iter().copied().collect();
                let exploratory = {
                    let requests = self.inner.requests.lock().expect("requests lock");
                    requests.is_exploratory(&reply.key)
                };
                match self.closest_floodfill(&reply.key, &excluded_set) {
                    Some(ff) => {
                        self.inner
                            .requests
                            .lock()
                            .expect("requests lock")
                            .record_attempt(&reply.key, ff.hash());
                        self.send_lookup(reply.key, ff.hash(), exploratory, excluded);
                    }
                    None => {
                        self.inner
                            .requests
                            .lock()
                            .expect("requests lock")
                            .fail(&reply.key);
                    }
                }
            }
            requests::NextStep::GiveUp => {
                self.inner
                    .requests
                    .lock()
                    .expect("requests lock")
                    .fail(&reply.key);
            }
            requests::NextStep::NotPending => {}
        }
        // peers named in the reply that we do not know yet are discovery
        // candidates; fetch them lazily
        for peer in reply.peers {
            if self.find_router(&peer).is_none() && peer != self.inner.local_hash {
                let this = self.clone();
                tokio::spawn(async move {
                    let _ = this.lookup_router(peer).await;
                });
            }
        }
        Ok(())
    }

    fn spawn_exploration(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EXPLORATION_INTERVAL);
            loop {
                tick.tick().await;
                if this.known_routers() >= EXPLORATION_ROUTER_TARGET {
                    continue;
                }
                let mut random_key = [0u8; 32];
                garliccraft_crypto::rand_bytes(&mut random_key);
                let key = Hash(random_key);
                let this = this.clone();
                tokio::spawn(async move {
                    let _ = this.lookup(key, true).await;
                });
            }
        });
    }

    fn spawn_housekeeping(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(300));
            loop {
                tick.tick().await;
                this.expire_records();
                let rotated = this
                    .inner
                    .routing_keys
                    .lock()
                    .expect("routing keys lock")
                    .check_rotation();
                if rotated {
                    info!("routing key space rotated");
                }
                this.inner
                    .requests
                    .lock()
                    .expect("requests lock")
                    .expire();
            }
        });
    }

    fn expire_records(&self) {
        let now = now_ms();
        {
            let mut lease_sets = self.inner.lease_sets.write().expect("lease sets lock");
            lease_sets.retain(|_, ls| !ls.is_unusable(now));
        }
        let count = self.known_routers();
        let ttl_ms = if self.inner.aggressive_expiry.load(Ordering::Relaxed) {
            60 * 60 * 1000
        } else if count > 300 {
            30 * 60 * 60 * 1000
        } else {
            72 * 60 * 60 * 1000
        };
        let stale: Vec<Hash> = {
            let routers = self.inner.routers.read().expect("routers lock");
            routers
                .iter()
                .filter(|(_, info)| info.published() + ttl_ms < now)
                .map(|(h, _)| *h)
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        debug!(count = stale.len(), "expiring stale router infos");
        let mut routers = self.inner.routers.write().expect("routers lock");
        let mut floodfills = self.inner.floodfills.write().expect("floodfills lock");
        for hash in stale {
            routers.remove(&hash);
            floodfills.retain(|h| h != &hash);
            if let Some(persistence) = &self.inner.persistence {
                let _ = persistence.remove(&hash);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garliccraft_core::{Capabilities, PrivateKeys, RouterAddress};
    use garliccraft_crypto::SigType;

    fn make_router(caps: Capabilities) -> (PrivateKeys, RouterInfo) {
        let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
        let mut info = RouterInfo::new(
            keys.identity().clone(),
            now_ms(),
            vec![RouterAddress::ntcp("127.0.0.1", 1234)],
            caps,
        );
        info.sign(&keys).unwrap();
        (keys, info)
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let netdb = NetDb::new_for_tests();
        let (_, info) = make_router(Capabilities::REACHABLE);
        let hash = info.hash();
        let inserted = netdb.add_router_info(&info.to_bytes()).unwrap();
        assert_eq!(inserted.hash(), hash);
        assert_eq!(netdb.find_router(&hash).unwrap().hash(), hash);
        assert_eq!(netdb.known_floodfills(), 0);
    }

    #[tokio::test]
    async fn test_floodfill_indexed() {
        let netdb = NetDb::new_for_tests();
        let (_, info) = make_router(Capabilities::FLOODFILL | Capabilities::REACHABLE);
        netdb.add_router_info(&info.to_bytes()).unwrap();
        assert_eq!(netdb.known_floodfills(), 1);
        let closest = netdb.closest_floodfill(&Hash::digest(b"anything"), &HashSet::new());
        assert_eq!(closest.unwrap().hash(), info.hash());
    }

    #[tokio::test]
    async fn test_stale_store_rejected() {
        let netdb = NetDb::new_for_tests();
        let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
        let mut newer = RouterInfo::new(
            keys.identity().clone(),
            2_000,
            vec![RouterAddress::ntcp("127.0.0.1", 1)],
            Capabilities::REACHABLE,
        );
        newer.sign(&keys).unwrap();
        let mut older = RouterInfo::new(
            keys.identity().clone(),
            1_000,
            vec![RouterAddress::ntcp("127.0.0.1", 1)],
            Capabilities::REACHABLE,
        );
        older.sign(&keys).unwrap();

        netdb.add_router_info(&newer.to_bytes()).unwrap();
        assert!(matches!(
            netdb.add_router_info(&older.to_bytes()),
            Err(CoreError::Duplicate)
        ));
        assert_eq!(netdb.find_router(&keys.hash()).unwrap().published(), 2_000);
    }

    #[tokio::test]
    async fn test_closest_floodfill_ordering() {
        let netdb = NetDb::new_for_tests();
        let mut floodfills = Vec::new();
        for _ in 0..8 {
            let (_, info) = make_router(Capabilities::FLOODFILL | Capabilities::REACHABLE);
            netdb.add_router_info(&info.to_bytes()).unwrap();
            floodfills.push(info.hash());
        }
        let key = Hash::digest(b"lookup-target");
        let best = netdb
            .closest_floodfill(&key, &HashSet::new())
            .unwrap()
            .hash();

        // the winner must beat every other candidate under the XOR metric
        // against the daily routing key
        let target = garliccraft_core::routing_key(&key, garliccraft_core::now_secs());
        for other in &floodfills {
            assert!(best.xor_distance(&target) <= other.xor_distance(&target));
        }

        // excluding the winner yields a strictly worse (or absent) choice
        let mut excluded = HashSet::new();
        excluded.insert(best);
        if let Some(second) = netdb.closest_floodfill(&key, &excluded) {
            assert!(second.hash().xor_distance(&target) >= best.xor_distance(&target));
            assert_ne!(second.hash(), best);
        }
    }

    #[tokio::test]
    async fn test_unreachable_excluded_from_selection() {
        let netdb = NetDb::new_for_tests();
        let (_, info) = make_router(Capabilities::FLOODFILL | Capabilities::REACHABLE);
        netdb.add_router_info(&info.to_bytes()).unwrap();
        netdb.mark_unreachable(&info.hash());
        assert!(netdb
            .closest_floodfill(&Hash::digest(b"k"), &HashSet::new())
            .is_none());
        assert!(netdb.select_random_router(|_| true).is_none());
    }

    #[tokio::test]
    async fn test_lookup_responds_with_store() {
        let (netdb, mut rx) = NetDb::new(Hash::digest(b"local"), true, None);
        let (_, info) = make_router(Capabilities::REACHABLE);
        netdb.add_router_info(&info.to_bytes()).unwrap();

        let lookup = DatabaseLookup {
            key: info.hash(),
            from: Hash::digest(b"asker"),
            reply_tunnel: None,
            exploratory: false,
            excluded: vec![],
        };
        let msg = I2npMessage::new(MessageType::DatabaseLookup, lookup.encode());
        netdb.handle_message(Hash::digest(b"asker"), &msg).unwrap();

        let out = rx.recv().await.unwrap();
        assert_eq!(out.to, Hash::digest(b"asker"));
        assert_eq!(out.msg.msg_type, MessageType::DatabaseStore);
        let store = DatabaseStore::decode(&out.msg.payload).unwrap();
        assert_eq!(store.key, info.hash());
    }

    #[tokio::test]
    async fn test_unknown_lookup_gets_search_reply() {
        let (netdb, mut rx) = NetDb::new(Hash::digest(b"local"), true, None);
        let (_, ff) = make_router(Capabilities::FLOODFILL | Capabilities::REACHABLE);
        netdb.add_router_info(&ff.to_bytes()).unwrap();

        let lookup = DatabaseLookup {
            key: Hash::digest(b"missing"),
            from: Hash::digest(b"asker"),
            reply_tunnel: None,
            exploratory: false,
            excluded: vec![],
        };
        let msg = I2npMessage::new(MessageType::DatabaseLookup, lookup.encode());
        netdb.handle_message(Hash::digest(b"asker"), &msg).unwrap();

        let out = rx.recv().await.unwrap();
        assert_eq!(out.msg.msg_type, MessageType::DatabaseSearchReply);
        let reply = DatabaseSearchReply::decode(&out.msg.payload).unwrap();
        assert_eq!(reply.peers, vec![ff.hash()]);
    }

    #[tokio::test]
    async fn test_floodfill_store_floods_and_acks() {
        let (netdb, mut rx) = NetDb::new(Hash::digest(b"local"), true, None);
        for _ in 0..4 {
            let (_, ff) = make_router(Capabilities::FLOODFILL | Capabilities::REACHABLE);
            netdb.add_router_info(&ff.to_bytes()).unwrap();
        }
        let (_, info) = make_router(Capabilities::REACHABLE);
        let store = DatabaseStore {
            key: info.hash(),
            store_type: STORE_TYPE_ROUTER_INFO,
            reply_token: 99,
            reply_tunnel: 0,
            reply_gateway: Hash::ZERO,
            data: Bytes::from(info.to_bytes()),
        };
        let msg = I2npMessage::new(MessageType::DatabaseStore, store.encode());
        let sender = Hash::digest(b"sender");
        netdb.handle_message(sender, &msg).unwrap();

        let mut flooded = 0;
        let mut acked = false;
        for _ in 0..4 {
            let out = rx.recv().await.unwrap();
            match out.msg.msg_type {
                MessageType::DatabaseStore => flooded += 1,
                MessageType::DeliveryStatus => {
                    assert_eq!(out.to, sender);
                    let status = DeliveryStatus::decode(&out.msg.payload).unwrap();
                    assert_eq!(status.msg_id, 99);
                    acked = true;
                }
                other => panic!("unexpected outbound {other:?}"),
            }
        }
        assert_eq!(flooded, FLOOD_REDUNDANCY);
        assert!(acked);
    }
}
