//! GarlicCraft Router
//!
//! The process-wide wiring: one context, one NetDb, one Transports, one
//! Tunnels registry, N local destinations. Subsystems are connected with
//! channels here and torn down in reverse order on shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use garliccraft_client::LocalDestination;
use garliccraft_core::i2np::{I2npMessage, MessageType};
use garliccraft_core::{
    now_ms, Capabilities, CoreError, Hash, PrivateKeys, Result, RouterAddress, RouterInfo,
};
use garliccraft_netdb::{NetDb, NetDbOutbound};
use garliccraft_transport::{InboundMessage, RouterStatus, TransportConfig, Transports};
use garliccraft_tunnel::{PoolConfig, PoolId, TunnelDelivery, Tunnels};

/// External configuration the core consumes; everything else is internal.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub v6: bool,
    pub floodfill: bool,
    pub bandwidth: char,
    pub max_participating: usize,
    pub explicit_peers: Vec<Hash>,
}

/// The local router's identity and advertised RouterInfo.
pub struct RouterContext {
    keys: Arc<PrivateKeys>,
    local_info: Arc<RwLock<Arc<RouterInfo>>>,
    intro_key: [u8; 32],
}

impl RouterContext {
    fn create(config: &RouterConfig) -> Result<Self> {
        let keys = Arc::new(
            garliccraft_keystore::load_or_generate_keys(&config.data_dir).map_err(|e| match e {
                garliccraft_keystore::KeystoreError::Io(io) => CoreError::Io(io),
                garliccraft_keystore::KeystoreError::Corrupt(core) => core,
            })?,
        );
        let mut intro_key = [0u8; 32];
        garliccraft_crypto::rand_bytes(&mut intro_key);

        let mut caps = Capabilities::REACHABLE;
        if config.floodfill {
            caps |= Capabilities::FLOODFILL;
        }
        match config.bandwidth {
            'O' => caps |= Capabilities::HIGH_BANDWIDTH,
            'P' => caps |= Capabilities::HIGH_BANDWIDTH | Capabilities::EXTRA_BANDWIDTH,
            _ => caps |= Capabilities::LOW_BANDWIDTH,
        }

        let mut info = RouterInfo::new(
            keys.identity().clone(),
            now_ms(),
            vec![
                RouterAddress::ntcp(config.host.clone(), config.port),
                RouterAddress::ssu(config.host.clone(), config.port, intro_key),
            ],
            caps,
        );
        info.sign(&keys)?;
        garliccraft_keystore::save_router_info(&config.data_dir, &info)
            .map_err(|_| CoreError::Malformed("cannot persist router info"))?;

        Ok(Self {
            keys,
            local_info: Arc::new(RwLock::new(Arc::new(info))),
            intro_key,
        })
    }

    pub fn keys(&self) -> &Arc<PrivateKeys> {
        &self.keys
    }

    pub fn hash(&self) -> Hash {
        self.keys.hash()
    }

    pub fn router_info(&self) -> Arc<RouterInfo> {
        self.local_info.read().expect("local info lock").clone()
    }

    /// Re-sign and re-publish the RouterInfo, e.g. when reachability
    /// changes and introducers must be advertised.
    fn update_router_info(&self, info: RouterInfo) {
        *self.local_info.write().expect("local info lock") = Arc::new(info);
    }
}

/// The assembled router.
pub struct Router {
    context: Arc<RouterContext>,
    config: RouterConfig,
    netdb: NetDb,
    transports: Transports,
    tunnels: Tunnels,
    destinations: Arc<Mutex<HashMap<Hash, LocalDestination>>>,
    pools: Arc<Mutex<HashMap<PoolId, Hash>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Router {
    /// Bring the core up: context → netdb → transports → tunnels. Failures
    /// here (bind, keys) abort startup.
    pub async fn start(config: RouterConfig) -> Result<Arc<Self>> {
        let context = Arc::new(RouterContext::create(&config)?);
        info!(router = ?context.hash(), "starting router");

        let (netdb, netdb_outbound) = NetDb::new(
            context.hash(),
            config.floodfill,
            Some(config.data_dir.clone()),
        );
        netdb.start()?;
        if netdb.needs_reseed() {
            // reseeding itself is an external collaborator
            warn!("netdb below minimum router count; reseed required");
        }

        let bind_addr: SocketAddr = if config.v6 {
            format!("[::]:{}", config.port)
        } else {
            format!("0.0.0.0:{}", config.port)
        }
        .parse()
        .map_err(|_| CoreError::Malformed("bad bind address"))?;
        let transport_config = TransportConfig {
            keys: context.keys.clone(),
            local_info: context.local_info.clone(),
            ntcp_addr: bind_addr,
            ssu_addr: bind_addr,
        };
        let (transports, transports_inbound) = Transports::new(transport_config, netdb.clone());
        transports.start().await?;

        let (tunnels, tunnel_deliveries) = Tunnels::new(
            context.keys.clone(),
            netdb.clone(),
            transports.clone(),
            config.max_participating,
        );
        tunnels.start();

        let router = Arc::new(Self {
            context,
            config,
            netdb,
            transports,
            tunnels,
            destinations: Arc::new(Mutex::new(HashMap::new())),
            pools: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        });
        router.spawn_netdb_pump(netdb_outbound);
        router.spawn_inbound_dispatch(transports_inbound);
        router.spawn_tunnel_dispatch(tunnel_deliveries);
        router.spawn_status_watch();
        info!(router = ?router.context.hash(), "router started");
        Ok(router)
    }

    /// Two-phase drain in reverse start order.
    pub async fn stop(&self) {
        info!("stopping router");
        let destinations: Vec<LocalDestination> = {
            let mut map = self.destinations.lock().expect("destinations lock");
            map.drain().map(|(_, d)| d).collect()
        };
        for destination in destinations {
            destination.stop();
        }
        self.tunnels.stop();
        self.transports.stop().await;
        self.netdb.stop();
        for task in self.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
        info!("router stopped");
    }

    pub fn context(&self) -> &RouterContext {
        &self.context
    }

    pub fn netdb(&self) -> &NetDb {
        &self.netdb
    }

    pub fn transports(&self) -> &Transports {
        &self.transports
    }

    pub fn tunnels(&self) -> &Tunnels {
        &self.tunnels
    }

    /// Create a client destination with its own tunnel pool.
    pub fn create_destination(
        &self,
        mut pool_config: PoolConfig,
    ) -> Result<(LocalDestination, mpsc::Receiver<garliccraft_client::Datagram>)> {
        if !self.config.explicit_peers.is_empty() && pool_config.explicit_peers.is_none() {
            pool_config.explicit_peers = Some(self.config.explicit_peers.clone());
        }
        let (destination, datagrams) = LocalDestination::new(
            self.netdb.clone(),
            self.tunnels.clone(),
            self.transports.clone(),
            pool_config,
        )?;
        self.pools
            .lock()
            .expect("pools lock")
            .insert(destination.pool_id(), destination.hash());
        self.destinations
            .lock()
            .expect("destinations lock")
            .insert(destination.hash(), destination.clone());
        Ok((destination, datagrams))
    }

    fn destination_for_pool(&self, pool: PoolId) -> Option<LocalDestination> {
        let hash = *self.pools.lock().expect("pools lock").get(&pool)?;
        self.destinations
            .lock()
            .expect("destinations lock")
            .get(&hash)
            .cloned()
    }

    fn destination_for_hash(&self, hash: &Hash) -> Option<LocalDestination> {
        self.destinations
            .lock()
            .expect("destinations lock")
            .get(hash)
            .cloned()
    }

    /// NetDb's outbound protocol messages go out over the transports.
    fn spawn_netdb_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<NetDbOutbound>) {
        let router = self.clone();
        let task = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                router.transports.send_message(out.to, out.msg.shared());
            }
        });
        self.tasks.lock().expect("tasks lock").push(task);
    }

    /// Messages arriving from peers, demultiplexed by I2NP type.
    fn spawn_inbound_dispatch(self: &Arc<Self>, mut rx: mpsc::Receiver<InboundMessage>) {
        let router = self.clone();
        let task = tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                router.dispatch(inbound.from, inbound.msg, None).await;
            }
        });
        self.tasks.lock().expect("tasks lock").push(task);
    }

    /// Messages leaving the tunnel layer.
    fn spawn_tunnel_dispatch(self: &Arc<Self>, mut rx: mpsc::Receiver<TunnelDelivery>) {
        let router = self.clone();
        let local = self.context.hash();
        let task = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match delivery {
                    TunnelDelivery::Local { msg, pool } => {
                        router.dispatch(local, msg, pool).await;
                    }
                    TunnelDelivery::ToDestination { dest, msg, pool: _ } => {
                        match router.destination_for_hash(&dest) {
                            Some(destination) => destination.handle_message(&msg).await,
                            None => debug!(?dest, "message for unknown destination"),
                        }
                    }
                }
            }
        });
        self.tasks.lock().expect("tasks lock").push(task);
    }

    async fn dispatch(&self, from: Hash, msg: I2npMessage, pool: Option<PoolId>) {
        // anything that rode one of a destination's inbound tunnels belongs
        // to that destination
        if let Some(pool) = pool {
            if matches!(
                msg.msg_type,
                MessageType::Garlic | MessageType::DeliveryStatus | MessageType::Data
            ) {
                if let Some(destination) = self.destination_for_pool(pool) {
                    destination.handle_message(&msg).await;
                    return;
                }
            }
        }
        let result = match msg.msg_type {
            MessageType::DatabaseStore
            | MessageType::DatabaseLookup
            | MessageType::DatabaseSearchReply => self.netdb.handle_message(from, &msg),
            MessageType::TunnelData
            | MessageType::TunnelGateway
            | MessageType::TunnelBuild
            | MessageType::TunnelBuildReply => self.tunnels.handle_message(from, &msg).await,
            MessageType::DeliveryStatus => {
                // without pool provenance, offer it to every destination
                let destinations: Vec<LocalDestination> = {
                    let map = self.destinations.lock().expect("destinations lock");
                    map.values().cloned().collect()
                };
                for destination in destinations {
                    destination.handle_message(&msg).await;
                }
                Ok(())
            }
            MessageType::Garlic => {
                debug!("garlic message addressed to bare router dropped");
                Ok(())
            }
            MessageType::Data => {
                debug!("data message addressed to bare router dropped");
                Ok(())
            }
        };
        if let Err(err) = result {
            debug!(%err, msg_type = ?msg.msg_type, "inbound message dropped");
        }
    }

    /// Track reachability: firewalled routers advertise introducers and
    /// expire peers aggressively.
    fn spawn_status_watch(self: &Arc<Self>) {
        let router = self.clone();
        let task = tokio::spawn(async move {
            let mut last = RouterStatus::Testing;
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tick.tick().await;
                let status = router.transports.router_status();
                if status != last {
                    info!(?status, "router reachability changed");
                    last = status;
                    router
                        .netdb
                        .set_aggressive_expiry(status == RouterStatus::Firewalled);
                    router.refresh_router_info(status);
                }
            }
        });
        self.tasks.lock().expect("tasks lock").push(task);
    }

    fn refresh_router_info(&self, status: RouterStatus) {
        let keys = &self.context.keys;
        let current = self.context.router_info();
        let mut caps = current.capabilities();
        caps.remove(Capabilities::REACHABLE);
        caps.remove(Capabilities::UNREACHABLE);
        match status {
            RouterStatus::Ok => caps |= Capabilities::REACHABLE,
            RouterStatus::Firewalled => caps |= Capabilities::UNREACHABLE,
            RouterStatus::Testing => {}
        }
        let mut info = RouterInfo::new(
            keys.identity().clone(),
            now_ms(),
            vec![
                RouterAddress::ntcp(self.config.host.clone(), self.config.port),
                RouterAddress::ssu(self.config.host.clone(), self.config.port, self.context.intro_key),
            ],
            caps,
        );
        if info.sign(keys).is_ok() {
            let _ = garliccraft_keystore::save_router_info(&self.config.data_dir, &info);
            self.context.update_router_info(info);
        }
    }
}
