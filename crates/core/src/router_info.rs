//! RouterInfo: a router's signed directory record.
//!
//! Identity, publication timestamp, transport addresses, and option mapping,
//! all covered by a trailing signature from the contained identity.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::identity::{PrivateKeys, RouterIdentity};
use crate::types::{i2p_base64_decode, i2p_base64_encode};
use crate::{CoreError, Hash, Result};

bitflags! {
    /// Capability letter flags from the `caps` option.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u16 {
        const FLOODFILL       = 1 << 0; // F
        const HIGH_BANDWIDTH  = 1 << 1; // O
        const EXTRA_BANDWIDTH = 1 << 2; // P
        const HIDDEN          = 1 << 3; // H
        const PEER_TEST       = 1 << 4; // B
        const INTRODUCER      = 1 << 5; // C
        const REACHABLE       = 1 << 6; // R
        const UNREACHABLE     = 1 << 7; // U
        const LOW_BANDWIDTH   = 1 << 8; // L
    }
}

const CAP_LETTERS: [(Capabilities, char); 9] = [
    (Capabilities::FLOODFILL, 'F'),
    (Capabilities::HIGH_BANDWIDTH, 'O'),
    (Capabilities::EXTRA_BANDWIDTH, 'P'),
    (Capabilities::HIDDEN, 'H'),
    (Capabilities::PEER_TEST, 'B'),
    (Capabilities::INTRODUCER, 'C'),
    (Capabilities::REACHABLE, 'R'),
    (Capabilities::UNREACHABLE, 'U'),
    (Capabilities::LOW_BANDWIDTH, 'L'),
];

impl Capabilities {
    pub fn to_caps_string(self) -> String {
        CAP_LETTERS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, letter)| letter)
            .collect()
    }

    pub fn from_caps_string(s: &str) -> Self {
        let mut caps = Capabilities::empty();
        for c in s.chars() {
            if let Some((flag, _)) = CAP_LETTERS.iter().find(|(_, letter)| *letter == c) {
                caps |= *flag;
            }
        }
        caps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStyle {
    Ntcp,
    Ssu,
}

impl TransportStyle {
    fn as_str(&self) -> &'static str {
        match self {
            TransportStyle::Ntcp => "NTCP",
            TransportStyle::Ssu => "SSU",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NTCP" => Ok(TransportStyle::Ntcp),
            "SSU" => Ok(TransportStyle::Ssu),
            _ => Err(CoreError::Malformed("unknown transport style")),
        }
    }
}

/// A relay entry for reaching a firewalled SSU peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introducer {
    pub host: String,
    pub port: u16,
    pub tag: u32,
    pub key: [u8; 32],
}

/// One advertised transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAddress {
    pub style: TransportStyle,
    pub cost: u8,
    pub expiration: u64,
    pub host: String,
    pub port: u16,
    /// SSU intro key; absent for NTCP.
    pub key: Option<[u8; 32]>,
    pub introducers: Vec<Introducer>,
}

impl RouterAddress {
    pub fn ntcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            style: TransportStyle::Ntcp,
            cost: 10,
            expiration: 0,
            host: host.into(),
            port,
            key: None,
            introducers: Vec::new(),
        }
    }

    pub fn ssu(host: impl Into<String>, port: u16, intro_key: [u8; 32]) -> Self {
        Self {
            style: TransportStyle::Ssu,
            cost: 5,
            expiration: 0,
            host: host.into(),
            port,
            key: Some(intro_key),
            introducers: Vec::new(),
        }
    }

    fn to_options(&self) -> BTreeMap<String, String> {
        let mut opts = BTreeMap::new();
        opts.insert("host".into(), self.host.clone());
        opts.insert("port".into(), self.port.to_string());
        if let Some(key) = &self.key {
            opts.insert("key".into(), i2p_base64_encode(key));
        }
        for (i, intro) in self.introducers.iter().enumerate() {
            opts.insert(format!("ihost{i}"), intro.host.clone());
            opts.insert(format!("iport{i}"), intro.port.to_string());
            opts.insert(format!("itag{i}"), intro.tag.to_string());
            opts.insert(format!("ikey{i}"), i2p_base64_encode(&intro.key));
        }
        opts
    }

    fn from_options(
        style: TransportStyle,
        cost: u8,
        expiration: u64,
        opts: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let host = opts
            .get("host")
            .cloned()
            .ok_or(CoreError::Malformed("address missing host"))?;
        let port = opts
            .get("port")
            .and_then(|p| p.parse().ok())
            .ok_or(CoreError::Malformed("address missing port"))?;
        let key = match opts.get("key") {
            Some(v) => Some(
                i2p_base64_decode(v)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(CoreError::Malformed("bad intro key"))?,
            ),
            None => None,
        };
        let mut introducers = Vec::new();
        for i in 0.. {
            let Some(ihost) = opts.get(&format!("ihost{i}")) else {
                break;
            };
            let port = opts
                .get(&format!("iport{i}"))
                .and_then(|p| p.parse().ok())
                .ok_or(CoreError::Malformed("introducer missing port"))?;
            let tag = opts
                .get(&format!("itag{i}"))
                .and_then(|t| t.parse().ok())
                .ok_or(CoreError::Malformed("introducer missing tag"))?;
            let key = opts
                .get(&format!("ikey{i}"))
                .and_then(|k| i2p_base64_decode(k))
                .and_then(|b| b.try_into().ok())
                .ok_or(CoreError::Malformed("introducer missing key"))?;
            introducers.push(Introducer {
                host: ihost.clone(),
                port,
                tag,
                key,
            });
        }
        Ok(Self {
            style,
            cost,
            expiration,
            host,
            port,
            key,
            introducers,
        })
    }
}

/// A router's signed, published directory record.
#[derive(Debug, Clone)]
pub struct RouterInfo {
    identity: RouterIdentity,
    published: u64,
    addresses: Vec<RouterAddress>,
    capabilities: Capabilities,
    options: BTreeMap<String, String>,
    signature: Vec<u8>,
}

impl RouterInfo {
    pub fn new(
        identity: RouterIdentity,
        published: u64,
        addresses: Vec<RouterAddress>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            identity,
            published,
            addresses,
            capabilities,
            options: BTreeMap::new(),
            signature: Vec::new(),
        }
    }

    pub fn identity(&self) -> &RouterIdentity {
        &self.identity
    }

    pub fn hash(&self) -> Hash {
        self.identity.hash()
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn addresses(&self) -> &[RouterAddress] {
        &self.addresses
    }

    pub fn set_option(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.options.insert(key.into(), value.into());
        self.signature.clear();
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn is_floodfill(&self) -> bool {
        self.capabilities.contains(Capabilities::FLOODFILL)
    }

    pub fn is_unreachable(&self) -> bool {
        self.capabilities.contains(Capabilities::UNREACHABLE)
    }

    pub fn is_introducer(&self) -> bool {
        self.capabilities.contains(Capabilities::INTRODUCER)
    }

    pub fn is_low_bandwidth(&self) -> bool {
        self.capabilities.contains(Capabilities::LOW_BANDWIDTH)
    }

    pub fn address(&self, style: TransportStyle) -> Option<&RouterAddress> {
        self.addresses.iter().find(|a| a.style == style)
    }

    fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.identity.to_bytes());
        out.extend_from_slice(&self.published.to_be_bytes());
        out.push(self.addresses.len() as u8);
        for addr in &self.addresses {
            out.push(addr.cost);
            out.extend_from_slice(&addr.expiration.to_be_bytes());
            write_string(&mut out, addr.style.as_str());
            write_mapping(&mut out, &addr.to_options());
        }
        out.push(0); // peer count, unused
        let mut options = self.options.clone();
        options.insert("caps".into(), self.capabilities.to_caps_string());
        write_mapping(&mut out, &options);
        out
    }

    /// Sign with the identity's private keys; the keys must match.
    pub fn sign(&mut self, keys: &PrivateKeys) -> Result<()> {
        if keys.hash() != self.hash() {
            return Err(CoreError::AuthFailed("signing with foreign keys"));
        }
        self.signature = keys.sign(&self.signable_bytes());
        Ok(())
    }

    /// Check the trailing signature against the contained identity.
    pub fn verify(&self) -> Result<()> {
        self.identity.verify(&self.signable_bytes(), &self.signature)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.signable_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let (identity, mut offset) = RouterIdentity::from_bytes(buf)?;
        let published = read_u64(buf, &mut offset)?;
        let num_addresses = read_u8(buf, &mut offset)?;
        let mut addresses = Vec::with_capacity(num_addresses as usize);
        for _ in 0..num_addresses {
            let cost = read_u8(buf, &mut offset)?;
            let expiration = read_u64(buf, &mut offset)?;
            let style = TransportStyle::from_str(&read_string(buf, &mut offset)?)?;
            let opts = read_mapping(buf, &mut offset)?;
            addresses.push(RouterAddress::from_options(style, cost, expiration, &opts)?);
        }
        let _peer_count = read_u8(buf, &mut offset)?;
        let mut options = read_mapping(buf, &mut offset)?;
        let capabilities = options
            .remove("caps")
            .map(|s| Capabilities::from_caps_string(&s))
            .unwrap_or_default();

        let sig_len = identity.signing_key().sig_type().sig_len();
        if buf.len() < offset + sig_len {
            return Err(CoreError::Malformed("router info signature truncated"));
        }
        let signature = buf[offset..offset + sig_len].to_vec();

        Ok(Self {
            identity,
            published,
            addresses,
            capabilities,
            options,
            signature,
        })
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= 255);
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
}

fn read_u8(buf: &[u8], offset: &mut usize) -> Result<u8> {
    let b = *buf
        .get(*offset)
        .ok_or(CoreError::Malformed("unexpected end of record"))?;
    *offset += 1;
    Ok(b)
}

fn read_u64(buf: &[u8], offset: &mut usize) -> Result<u64> {
    if buf.len() < *offset + 8 {
        return Err(CoreError::Malformed("unexpected end of record"));
    }
    let v = u64::from_be_bytes(buf[*offset..*offset + 8].try_into().expect("length checked"));
    *offset += 8;
    Ok(v)
}

fn read_string(buf: &[u8], offset: &mut usize) -> Result<String> {
    let len = read_u8(buf, offset)? as usize;
    if buf.len() < *offset + len {
        return Err(CoreError::Malformed("string truncated"));
    }
    let s = std::str::from_utf8(&buf[*offset..*offset + len])
        .map_err(|_| CoreError::Malformed("string not utf-8"))?
        .to_string();
    *offset += len;
    Ok(s)
}

/// Mappings are `size_u16be` followed by `len-prefixed key '=' len-prefixed
/// value ';'` entries, keys in sorted order so signatures are stable.
fn write_mapping(out: &mut Vec<u8>, map: &BTreeMap<String, String>) {
    let mut body = Vec::new();
    for (k, v) in map {
        write_string(&mut body, k);
        body.push(b'=');
        write_string(&mut body, v);
        body.push(b';');
    }
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(&body);
}

fn read_mapping(buf: &[u8], offset: &mut usize) -> Result<BTreeMap<String, String>> {
    if buf.len() < *offset + 2 {
        return Err(CoreError::Malformed("mapping truncated"));
    }
    let size = u16::from_be_bytes([buf[*offset], buf[*offset + 1]]) as usize;
    *offset += 2;
    let end = *offset + size;
    if buf.len() < end {
        return Err(CoreError::Malformed("mapping truncated"));
    }
    let mut map = BTreeMap::new();
    while *offset < end {
        let key = read_string(buf, offset)?;
        if read_u8(buf, offset)? != b'=' {
            return Err(CoreError::Malformed("mapping missing '='"));
        }
        let value = read_string(buf, offset)?;
        if read_u8(buf, offset)? != b';' {
            return Err(CoreError::Malformed("mapping missing ';'"));
        }
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use garliccraft_crypto::SigType;

    fn make_router_info() -> (PrivateKeys, RouterInfo) {
        let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
        let mut ri = RouterInfo::new(
            keys.identity().clone(),
            1_700_000_000_000,
            vec![
                RouterAddress::ntcp("10.0.0.1", 12345),
                RouterAddress::ssu("10.0.0.1", 12345, [7u8; 32]),
            ],
            Capabilities::FLOODFILL | Capabilities::REACHABLE,
        );
        ri.sign(&keys).unwrap();
        (keys, ri)
    }

    #[test]
    fn test_sign_and_verify() {
        let (_, ri) = make_router_info();
        assert!(ri.verify().is_ok());
    }

    #[test]
    fn test_roundtrip() {
        let (_, ri) = make_router_info();
        let bytes = ri.to_bytes();
        let decoded = RouterInfo::from_bytes(&bytes).unwrap();
        assert!(decoded.verify().is_ok());
        assert_eq!(decoded.hash(), ri.hash());
        assert_eq!(decoded.published(), ri.published());
        assert_eq!(decoded.addresses(), ri.addresses());
        assert!(decoded.is_floodfill());
        assert!(!decoded.is_unreachable());
    }

    #[test]
    fn test_tampered_record_fails_verification() {
        let (_, ri) = make_router_info();
        let mut bytes = ri.to_bytes();
        bytes[400] ^= 0x01;
        match RouterInfo::from_bytes(&bytes) {
            Ok(decoded) => assert!(decoded.verify().is_err()),
            Err(_) => {} // tampering may also break the framing
        }
    }

    #[test]
    fn test_foreign_keys_rejected() {
        let (_, mut ri) = make_router_info();
        let other = PrivateKeys::generate(SigType::Ed25519).unwrap();
        assert!(ri.sign(&other).is_err());
    }

    #[test]
    fn test_caps_string_roundtrip() {
        let caps = Capabilities::FLOODFILL | Capabilities::HIGH_BANDWIDTH | Capabilities::REACHABLE;
        let s = caps.to_caps_string();
        assert_eq!(s, "FOR");
        assert_eq!(Capabilities::from_caps_string(&s), caps);
        // unknown letters are ignored
        assert_eq!(Capabilities::from_caps_string("FXR"), Capabilities::FLOODFILL | Capabilities::REACHABLE);
    }

    #[test]
    fn test_introducers_roundtrip() {
        let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
        let mut addr = RouterAddress::ssu("192.0.2.7", 9999, [1u8; 32]);
        addr.introducers.push(Introducer {
            host: "192.0.2.8".into(),
            port: 8888,
            tag: 42,
            key: [2u8; 32],
        });
        let mut ri = RouterInfo::new(
            keys.identity().clone(),
            1,
            vec![addr],
            Capabilities::UNREACHABLE | Capabilities::INTRODUCER,
        );
        ri.sign(&keys).unwrap();

        let decoded = RouterInfo::from_bytes(&ri.to_bytes()).unwrap();
        let ssu = decoded.address(TransportStyle::Ssu).unwrap();
        assert_eq!(ssu.introducers.len(), 1);
        assert_eq!(ssu.introducers[0].tag, 42);
        assert_eq!(ssu.introducers[0].key, [2u8; 32]);
    }
}
