//! GarlicCraft Core
//!
//! Identity and routing records, the I2NP message layer, and the shared
//! error taxonomy. Everything that travels between routers is encoded here;
//! the wire layouts are hand-written big-endian and bit-exact.

mod error;
pub mod i2np;
mod identity;
mod lease_set;
mod router_info;
mod routing_key;
mod types;

pub use error::{CoreError, Result};
pub use identity::{Certificate, Destination, PrivateKeys, RouterIdentity};
pub use lease_set::{Lease, LeaseSet, MAX_LEASES, MAX_LEASE_LIFETIME_MS};
pub use router_info::{
    Capabilities, Introducer, RouterAddress, RouterInfo, TransportStyle,
};
pub use routing_key::{routing_key, RoutingKeyCalculator};
pub use types::{
    i2p_base64_decode, i2p_base64_encode, now_ms, now_secs, Hash, SessionTag, TunnelId,
};
