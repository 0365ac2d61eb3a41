//! GarlicCraft Client Destinations
//!
//! A LocalDestination is one pseudonymous endpoint: its own identity, a
//! tunnel pool, garlic session state, a streaming destination, and the
//! LeaseSet publication that makes it reachable.

mod datagram;

pub use datagram::{build_signed_datagram, open_signed_datagram, Datagram};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use garliccraft_core::i2np::{
    DataPayload, DatabaseStore, DeliveryStatus, I2npMessage, MessageType, TunnelGateway,
    STORE_TYPE_LEASE_SET,
};
use garliccraft_core::{
    now_ms, CoreError, Hash, Lease, LeaseSet, PrivateKeys, Result, TunnelId,
};
use garliccraft_crypto::{rand_u32_nonzero, SigType};
use garliccraft_garlic::{Clove, GarlicDelivery, GarlicEngine};
use garliccraft_netdb::NetDb;
use garliccraft_streaming::{compress_payload, decompress_payload, StreamHandle, StreamingDestination};
use garliccraft_transport::Transports;
use garliccraft_tunnel::{PoolConfig, PoolEvent, PoolId, Tunnels};

/// I2CP-style protocol codes inside the Data payload framing.
pub const PROTOCOL_STREAMING: u8 = 6;
pub const PROTOCOL_DATAGRAM: u8 = 17;

struct DestinationInner {
    keys: Arc<PrivateKeys>,
    local_router: Hash,
    netdb: NetDb,
    tunnels: Tunnels,
    transports: Transports,
    pool_id: PoolId,
    garlic: Mutex<GarlicEngine>,
    streaming: StreamingDestination,
    datagram_tx: mpsc::Sender<Datagram>,
    /// Nonces of LeaseSet publishes awaiting DeliveryStatus confirmation.
    pending_publishes: Mutex<HashSet<u32>>,
}

/// One local application endpoint, exclusively owning its tunnel pool,
/// garlic state, and streaming destination.
#[derive(Clone)]
pub struct LocalDestination {
    inner: Arc<DestinationInner>,
}

impl LocalDestination {
    /// Create and start a destination with a fresh identity.
    pub fn new(
        netdb: NetDb,
        tunnels: Tunnels,
        transports: Transports,
        pool_config: PoolConfig,
    ) -> Result<(Self, mpsc::Receiver<Datagram>)> {
        let keys = Arc::new(PrivateKeys::generate(SigType::Ed25519)?);
        Self::with_keys(keys, netdb, tunnels, transports, pool_config)
    }

    pub fn with_keys(
        keys: Arc<PrivateKeys>,
        netdb: NetDb,
        tunnels: Tunnels,
        transports: Transports,
        pool_config: PoolConfig,
    ) -> Result<(Self, mpsc::Receiver<Datagram>)> {
        let (pool_events_tx, pool_events_rx) = mpsc::channel(16);
        let pool_id = tunnels.create_pool(pool_config, pool_events_tx);
        let (streaming, streaming_out_rx) = StreamingDestination::new(keys.hash());
        let (datagram_tx, datagram_rx) = mpsc::channel(64);
        let local_router = transports.local_hash();

        let destination = Self {
            inner: Arc::new(DestinationInner {
                keys,
                local_router,
                netdb,
                tunnels,
                transports,
                pool_id,
                garlic: Mutex::new(GarlicEngine::new()),
                streaming: streaming.clone(),
                datagram_tx,
                pending_publishes: Mutex::new(HashSet::new()),
            }),
        };
        destination.inner.streaming.start();
        destination.spawn_pool_events(pool_events_rx);
        destination.spawn_streaming_pump(streaming_out_rx);
        destination.spawn_cleanup();
        info!(dest = ?destination.hash(), "local destination started");
        Ok((destination, datagram_rx))
    }

    pub fn hash(&self) -> Hash {
        self.inner.keys.hash()
    }

    /// The tunnel pool this destination owns; the router dispatcher keys
    /// inbound deliveries on it.
    pub fn pool_id(&self) -> PoolId {
        self.inner.pool_id
    }

    pub fn identity(&self) -> &garliccraft_core::RouterIdentity {
        self.inner.keys.identity()
    }

    /// Whether the destination has tunnels in both directions.
    pub fn is_ready(&self) -> bool {
        self.inner.tunnels.pool_ready(self.inner.pool_id)
    }

    /// Open a reliable stream to `remote`. The remote LeaseSet is resolved
    /// first so the initial packets have somewhere to go.
    pub async fn create_stream(&self, remote: Hash, _port: u16) -> Result<StreamHandle> {
        self.inner
            .netdb
            .lookup_lease_set(remote)
            .await
            .ok_or(CoreError::Timeout("lease set lookup"))?;
        Ok(self.inner.streaming.connect(remote))
    }

    /// Wait for the next inbound stream.
    pub async fn accept_stream(&self) -> Option<StreamHandle> {
        self.inner.streaming.accept().await
    }

    /// Fire-and-forget signed datagram.
    pub async fn send_datagram(
        &self,
        remote: Hash,
        from_port: u16,
        to_port: u16,
        payload: &[u8],
    ) -> Result<()> {
        let signed = build_signed_datagram(&self.inner.keys, payload);
        let framed = frame_payload(PROTOCOL_DATAGRAM, from_port, to_port, &signed);
        self.send_data(remote, framed).await
    }

    /// Wrap framed client bytes into Data → garlic → tunnels toward
    /// `remote`.
    async fn send_data(&self, remote: Hash, framed: Vec<u8>) -> Result<()> {
        let lease_set = match self.inner.netdb.find_lease_set(&remote) {
            Some(ls) => ls,
            None => self
                .inner
                .netdb
                .lookup_lease_set(remote)
                .await
                .ok_or(CoreError::Timeout("lease set lookup"))?,
        };
        let lease = pick_lease(&lease_set)?;

        let data_msg = I2npMessage::new(
            MessageType::Data,
            DataPayload(Bytes::from(compress_payload(&framed))).encode(),
        );
        let reply_lease = self.reply_lease();
        let garlic_msg = {
            let mut garlic = self.inner.garlic.lock().expect("garlic lock");
            garlic.wrap(&lease_set, data_msg, reply_lease)?
        };
        self.inner.tunnels.send_through_pool(
            self.inner.pool_id,
            garliccraft_tunnel::Delivery::Tunnel(lease.tunnel_gateway, lease.tunnel_id),
            &garlic_msg,
        )
    }

    fn reply_lease(&self) -> Option<(Hash, TunnelId)> {
        self.inner
            .tunnels
            .pool_leases(self.inner.pool_id)
            .first()
            .map(|(gw, id, _)| (*gw, *id))
    }

    /// I2NP messages addressed to this destination (garlic, delivery
    /// status) arrive here from the router dispatcher.
    pub async fn handle_message(&self, msg: &I2npMessage) {
        match msg.msg_type {
            MessageType::Garlic => {
                let cloves = {
                    let mut garlic = self.inner.garlic.lock().expect("garlic lock");
                    garlic.unwrap(&self.inner.keys, &msg.payload)
                };
                match cloves {
                    Ok(cloves) => {
                        for clove in cloves {
                            self.route_clove(clove).await;
                        }
                    }
                    // failed tag/ElGamal: silent drop
                    Err(err) => trace!(%err, "garlic message dropped"),
                }
            }
            MessageType::DeliveryStatus => {
                if let Ok(status) = DeliveryStatus::decode(&msg.payload) {
                    self.on_delivery_status(status.msg_id);
                }
            }
            other => debug!(?other, "destination ignoring message type"),
        }
    }

    async fn route_clove(&self, clove: Clove) {
        match clove.delivery {
            GarlicDelivery::Local | GarlicDelivery::Destination(_) => {
                self.process_local_clove(clove).await;
            }
            GarlicDelivery::Router(router) => {
                if router == self.inner.local_router {
                    debug!("dropping clove cycling to own router");
                    return;
                }
                self.inner
                    .transports
                    .send_message(router, clove.message.shared());
            }
            GarlicDelivery::Tunnel(gateway, tunnel_id) => {
                if gateway == self.inner.local_router {
                    debug!("dropping clove cycling into own tunnel");
                    return;
                }
                let wrapped = TunnelGateway {
                    tunnel_id,
                    data: Bytes::from(clove.message.encode()),
                };
                let msg = I2npMessage::new(MessageType::TunnelGateway, wrapped.encode());
                self.inner.transports.send_message(gateway, msg.shared());
            }
        }
    }

    async fn process_local_clove(&self, clove: Clove) {
        match clove.message.msg_type {
            MessageType::Data => {
                let Ok(data) = DataPayload::decode(&clove.message.payload) else {
                    return;
                };
                let Ok(framed) = decompress_payload(&data.0) else {
                    return;
                };
                let Some((protocol, from_port, to_port, body)) = unframe_payload(&framed) else {
                    return;
                };
                match protocol {
                    PROTOCOL_STREAMING => {
                        if let Err(err) = self.inner.streaming.handle_packet(body) {
                            trace!(%err, "streaming packet dropped");
                        }
                    }
                    PROTOCOL_DATAGRAM => match open_signed_datagram(body) {
                        Ok((identity, payload)) => {
                            let _ = self.inner.datagram_tx.try_send(Datagram {
                                from: identity.hash(),
                                from_port,
                                to_port,
                                payload,
                            });
                        }
                        Err(err) => debug!(%err, "datagram signature rejected"),
                    },
                    other => debug!(protocol = other, "unknown client protocol"),
                }
            }
            MessageType::DeliveryStatus => {
                if let Ok(status) = DeliveryStatus::decode(&clove.message.payload) {
                    self.on_delivery_status(status.msg_id);
                }
            }
            MessageType::DatabaseStore => {
                // peers bundle their LeaseSet with the first message
                if let Ok(store) = DatabaseStore::decode(&clove.message.payload) {
                    if store.store_type == STORE_TYPE_LEASE_SET {
                        let _ = self.inner.netdb.add_lease_set(&store.data);
                    }
                }
            }
            other => debug!(?other, "unhandled clove message type"),
        }
    }

    fn on_delivery_status(&self, nonce: u32) {
        let confirmed_tags = {
            let mut garlic = self.inner.garlic.lock().expect("garlic lock");
            garlic.handle_delivery_status(nonce)
        };
        let confirmed_publish = self
            .inner
            .pending_publishes
            .lock()
            .expect("publish lock")
            .remove(&nonce);
        if confirmed_publish {
            debug!(dest = ?self.hash(), "lease set publish confirmed");
        } else if !confirmed_tags {
            trace!(nonce, "delivery status for unknown nonce");
        }
    }

    /// React to tunnel pool changes: republish the LeaseSet.
    fn spawn_pool_events(&self, mut events: mpsc::Receiver<PoolEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PoolEvent::InboundChanged => {
                        if let Err(err) = this.publish_lease_set() {
                            debug!(%err, "lease set publish failed");
                        }
                    }
                }
            }
        });
    }

    fn publish_lease_set(&self) -> Result<()> {
        let leases: Vec<Lease> = self
            .inner
            .tunnels
            .pool_leases(self.inner.pool_id)
            .into_iter()
            .map(|(gateway, tunnel_id, end_date)| Lease {
                tunnel_gateway: gateway,
                tunnel_id,
                end_date,
            })
            .collect();
        if leases.is_empty() {
            return Err(CoreError::Timeout("no inbound tunnels yet"));
        }

        let mut lease_set = LeaseSet::new(
            self.inner.keys.identity().clone(),
            *self.inner.keys.identity().public_key(),
            leases,
        )?;
        lease_set.sign(&self.inner.keys)?;
        let encoded = lease_set.to_bytes();

        // keep our own table fresh
        let _ = self.inner.netdb.add_lease_set(&encoded);

        let floodfill = self
            .inner
            .netdb
            .closest_floodfill(&self.hash(), &HashSet::new())
            .ok_or(CoreError::Unreachable)?;

        let reply_token = rand_u32_nonzero();
        let (reply_gateway, reply_tunnel) =
            self.reply_lease().ok_or(CoreError::Timeout("no reply lease"))?;
        let store = DatabaseStore {
            key: self.hash(),
            store_type: STORE_TYPE_LEASE_SET,
            reply_token,
            reply_tunnel,
            reply_gateway,
            data: Bytes::from(encoded),
        };
        let msg = I2npMessage::new(MessageType::DatabaseStore, store.encode());
        self.inner
            .pending_publishes
            .lock()
            .expect("publish lock")
            .insert(reply_token);
        self.inner.tunnels.send_through_pool(
            self.inner.pool_id,
            garliccraft_tunnel::Delivery::Router(floodfill.hash()),
            &msg,
        )?;
        info!(dest = ?self.hash(), "lease set published");
        Ok(())
    }

    /// Ship streaming packets out through garlic.
    fn spawn_streaming_pump(
        &self,
        mut outbound: mpsc::Receiver<garliccraft_streaming::OutboundPacket>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(packet) = outbound.recv().await {
                let framed = frame_payload(PROTOCOL_STREAMING, 0, 0, &packet.payload);
                if let Err(err) = this.send_data(packet.to, framed).await {
                    trace!(%err, "streaming packet undeliverable");
                }
            }
        });
    }

    fn spawn_cleanup(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tick.tick().await;
                this.inner.garlic.lock().expect("garlic lock").cleanup();
            }
        });
    }

    /// Shut the destination down: streams reset, pool released.
    pub fn stop(&self) {
        self.inner.streaming.shutdown();
        self.inner.tunnels.remove_pool(self.inner.pool_id);
        info!(dest = ?self.hash(), "local destination stopped");
    }
}

fn pick_lease(lease_set: &LeaseSet) -> Result<Lease> {
    let now = now_ms();
    let candidates: Vec<&Lease> = lease_set.non_expired_leases(now).collect();
    if candidates.is_empty() {
        return Err(CoreError::Expired);
    }
    let index = garliccraft_crypto::rand_in_range(0..candidates.len());
    Ok(*candidates[index])
}

/// `protocol u8 || from_port u16 || to_port u16 || body`.
fn frame_payload(protocol: u8, from_port: u16, to_port: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + body.len());
    out.push(protocol);
    out.extend_from_slice(&from_port.to_be_bytes());
    out.extend_from_slice(&to_port.to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn unframe_payload(buf: &[u8]) -> Option<(u8, u16, u16, &[u8])> {
    if buf.len() < 5 {
        return None;
    }
    let protocol = buf[0];
    let from_port = u16::from_be_bytes([buf[1], buf[2]]);
    let to_port = u16::from_be_bytes([buf[3], buf[4]]);
    Some((protocol, from_port, to_port, &buf[5..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_framing_roundtrip() {
        let framed = frame_payload(PROTOCOL_STREAMING, 1234, 80, b"segment");
        let (protocol, from_port, to_port, body) = unframe_payload(&framed).unwrap();
        assert_eq!(protocol, PROTOCOL_STREAMING);
        assert_eq!(from_port, 1234);
        assert_eq!(to_port, 80);
        assert_eq!(body, b"segment");
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(unframe_payload(&[1, 2]).is_none());
    }

    #[test]
    fn test_pick_lease_skips_expired() {
        let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
        let mut ls = LeaseSet::new(
            keys.identity().clone(),
            *keys.identity().public_key(),
            vec![
                Lease {
                    tunnel_gateway: Hash::digest(b"dead"),
                    tunnel_id: 1,
                    end_date: now_ms() - 1,
                },
                Lease {
                    tunnel_gateway: Hash::digest(b"live"),
                    tunnel_id: 2,
                    end_date: now_ms() + 60_000,
                },
            ],
        )
        .unwrap();
        ls.sign(&keys).unwrap();
        for _ in 0..10 {
            assert_eq!(pick_lease(&ls).unwrap().tunnel_gateway, Hash::digest(b"live"));
        }
    }

    #[test]
    fn test_fully_expired_lease_set_unusable() {
        let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
        let mut ls = LeaseSet::new(
            keys.identity().clone(),
            *keys.identity().public_key(),
            vec![Lease {
                tunnel_gateway: Hash::digest(b"dead"),
                tunnel_id: 1,
                end_date: now_ms() - 1,
            }],
        )
        .unwrap();
        ls.sign(&keys).unwrap();
        assert!(matches!(pick_lease(&ls), Err(CoreError::Expired)));
    }
}
