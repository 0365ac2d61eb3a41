//! SSU packet framing: `mac[16] || iv[16] || enc{ flag || time || [extOpts] ||
//! payload || pad }`, MAC = HMAC-MD5-I2P over `ciphertext || iv || len_u16be`.

use std::net::IpAddr;

use garliccraft_core::{now_secs, CoreError, Result, RouterIdentity};
use garliccraft_crypto::{cbc_decrypt, cbc_encrypt, hmac_md5_i2p, rand_bytes};

pub const SSU_MTU: usize = 1484;
pub const SSU_HEADER_MIN: usize = 16 + 16 + 1 + 4;

const FLAG_EXTENDED_OPTIONS: u8 = 0x04;
const FLAG_REKEY: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    SessionRequest = 0,
    SessionCreated = 1,
    SessionConfirmed = 2,
    RelayRequest = 3,
    RelayResponse = 4,
    RelayIntro = 5,
    Data = 6,
    PeerTest = 7,
    SessionDestroyed = 8,
}

impl PayloadType {
    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(PayloadType::SessionRequest),
            1 => Ok(PayloadType::SessionCreated),
            2 => Ok(PayloadType::SessionConfirmed),
            3 => Ok(PayloadType::RelayRequest),
            4 => Ok(PayloadType::RelayResponse),
            5 => Ok(PayloadType::RelayIntro),
            6 => Ok(PayloadType::Data),
            7 => Ok(PayloadType::PeerTest),
            8 => Ok(PayloadType::SessionDestroyed),
            _ => Err(CoreError::Malformed("ssu payload type")),
        }
    }
}

/// A decrypted, MAC-verified SSU packet.
#[derive(Debug)]
pub struct SsuPacket {
    pub payload_type: PayloadType,
    pub timestamp: u32,
    /// Decoded for completeness; no rekey path exists.
    pub rekey: bool,
    /// Parsed length-first, then ignored.
    pub extended_options: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// Build one packet under `(session_key, mac_key)`.
pub fn build_packet(
    session_key: &[u8; 32],
    mac_key: &[u8; 32],
    payload_type: PayloadType,
    payload: &[u8],
) -> Vec<u8> {
    let mut iv = [0u8; 16];
    rand_bytes(&mut iv);

    let raw_len = 1 + 4 + payload.len();
    let padded_len = (raw_len + 15) & !15;
    let mut plaintext = vec![0u8; padded_len];
    plaintext[0] = (payload_type as u8) << 4;
    plaintext[1..5].copy_from_slice(&(now_secs() as u32).to_be_bytes());
    plaintext[5..5 + payload.len()].copy_from_slice(payload);
    rand_bytes(&mut plaintext[5 + payload.len()..]);

    cbc_encrypt(session_key, &iv, &mut plaintext);

    let mut mac_input = Vec::with_capacity(plaintext.len() + 18);
    mac_input.extend_from_slice(&plaintext);
    mac_input.extend_from_slice(&iv);
    mac_input.extend_from_slice(&(plaintext.len() as u16).to_be_bytes());
    let mac = hmac_md5_i2p(mac_key, &mac_input);

    let mut packet = Vec::with_capacity(32 + plaintext.len());
    packet.extend_from_slice(&mac);
    packet.extend_from_slice(&iv);
    packet.extend_from_slice(&plaintext);
    packet
}

/// Verify the MAC only, without decrypting; used to pick which key a packet
/// was built with.
pub fn validate_packet(mac_key: &[u8; 32], packet: &[u8]) -> bool {
    if packet.len() < SSU_HEADER_MIN || (packet.len() - 32) % 16 != 0 {
        return false;
    }
    let ciphertext = &packet[32..];
    let mut mac_input = Vec::with_capacity(ciphertext.len() + 18);
    mac_input.extend_from_slice(ciphertext);
    mac_input.extend_from_slice(&packet[16..32]);
    mac_input.extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
    hmac_md5_i2p(mac_key, &mac_input) == packet[..16]
}

/// Verify and decrypt one packet.
pub fn parse_packet(
    session_key: &[u8; 32],
    mac_key: &[u8; 32],
    packet: &[u8],
) -> Result<SsuPacket> {
    if !validate_packet(mac_key, packet) {
        return Err(CoreError::AuthFailed("ssu mac mismatch"));
    }
    let iv: [u8; 16] = packet[16..32].try_into().expect("fixed");
    let mut plaintext = packet[32..].to_vec();
    cbc_decrypt(session_key, &iv, &mut plaintext);

    let flag = plaintext[0];
    let payload_type = PayloadType::from_code(flag >> 4)?;
    let timestamp = u32::from_be_bytes(plaintext[1..5].try_into().expect("fixed"));
    let mut offset = 5;
    let extended_options = if flag & FLAG_EXTENDED_OPTIONS != 0 {
        let len = *plaintext
            .get(offset)
            .ok_or(CoreError::Malformed("ssu extended options truncated"))?
            as usize;
        offset += 1;
        if plaintext.len() < offset + len {
            return Err(CoreError::Malformed("ssu extended options truncated"));
        }
        let opts = plaintext[offset..offset + len].to_vec();
        offset += len;
        Some(opts)
    } else {
        None
    };
    Ok(SsuPacket {
        payload_type,
        timestamp,
        rekey: flag & FLAG_REKEY != 0,
        extended_options,
        payload: plaintext[offset..].to_vec(),
    })
}

fn write_ip(out: &mut Vec<u8>, ip: &IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(16);
            out.extend_from_slice(&v6.octets());
        }
    }
}

fn read_ip(buf: &[u8], offset: &mut usize) -> Result<IpAddr> {
    let size = *buf
        .get(*offset)
        .ok_or(CoreError::Malformed("ssu address truncated"))? as usize;
    *offset += 1;
    if buf.len() < *offset + size {
        return Err(CoreError::Malformed("ssu address truncated"));
    }
    let ip = match size {
        4 => {
            let octets: [u8; 4] = buf[*offset..*offset + 4].try_into().expect("fixed");
            IpAddr::from(octets)
        }
        16 => {
            let octets: [u8; 16] = buf[*offset..*offset + 16].try_into().expect("fixed");
            IpAddr::from(octets)
        }
        _ => return Err(CoreError::Malformed("ssu address size")),
    };
    *offset += size;
    Ok(ip)
}

fn read_u16(buf: &[u8], offset: &mut usize) -> Result<u16> {
    if buf.len() < *offset + 2 {
        return Err(CoreError::Malformed("ssu field truncated"));
    }
    let v = u16::from_be_bytes(buf[*offset..*offset + 2].try_into().expect("fixed"));
    *offset += 2;
    Ok(v)
}

fn read_u32(buf: &[u8], offset: &mut usize) -> Result<u32> {
    if buf.len() < *offset + 4 {
        return Err(CoreError::Malformed("ssu field truncated"));
    }
    let v = u32::from_be_bytes(buf[*offset..*offset + 4].try_into().expect("fixed"));
    *offset += 4;
    Ok(v)
}

fn read_key(buf: &[u8], offset: &mut usize) -> Result<[u8; 32]> {
    if buf.len() < *offset + 32 {
        return Err(CoreError::Malformed("ssu field truncated"));
    }
    let key: [u8; 32] = buf[*offset..*offset + 32].try_into().expect("fixed");
    *offset += 32;
    Ok(key)
}

/// SessionRequest: initiator's DH public value and the responder's address
/// as the initiator sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub x: [u8; 256],
    pub to_ip: IpAddr,
}

impl SessionRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + 17);
        out.extend_from_slice(&self.x);
        write_ip(&mut out, &self.to_ip);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 257 {
            return Err(CoreError::Malformed("session request truncated"));
        }
        let x: [u8; 256] = buf[..256].try_into().expect("fixed");
        let mut offset = 256;
        let to_ip = read_ip(buf, &mut offset)?;
        Ok(Self { x, to_ip })
    }
}

/// SessionCreated: responder's DH value, the initiator's reflected address,
/// an optional relay tag, and a signature over both DH values and addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCreated {
    pub y: [u8; 256],
    pub your_ip: IpAddr,
    pub your_port: u16,
    pub relay_tag: u32,
    pub signed_on: u32,
    pub signature: Vec<u8>,
}

impl SessionCreated {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + 32 + self.signature.len());
        out.extend_from_slice(&self.y);
        write_ip(&mut out, &self.your_ip);
        out.extend_from_slice(&self.your_port.to_be_bytes());
        out.extend_from_slice(&self.relay_tag.to_be_bytes());
        out.extend_from_slice(&self.signed_on.to_be_bytes());
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn decode(buf: &[u8], sig_len: usize) -> Result<Self> {
        if buf.len() < 257 {
            return Err(CoreError::Malformed("session created truncated"));
        }
        let y: [u8; 256] = buf[..256].try_into().expect("fixed");
        let mut offset = 256;
        let your_ip = read_ip(buf, &mut offset)?;
        let your_port = read_u16(buf, &mut offset)?;
        let relay_tag = read_u32(buf, &mut offset)?;
        let signed_on = read_u32(buf, &mut offset)?;
        if buf.len() < offset + sig_len {
            return Err(CoreError::Malformed("session created signature truncated"));
        }
        let signature = buf[offset..offset + sig_len].to_vec();
        Ok(Self {
            y,
            your_ip,
            your_port,
            relay_tag,
            signed_on,
            signature,
        })
    }
}

/// SessionConfirmed: the initiator's full identity and signature.
#[derive(Debug, Clone)]
pub struct SessionConfirmed {
    pub identity: RouterIdentity,
    pub signed_on: u32,
    pub signature: Vec<u8>,
}

impl SessionConfirmed {
    pub fn encode(&self) -> Vec<u8> {
        let ident = self.identity.to_bytes();
        let mut out = Vec::with_capacity(2 + ident.len() + 4 + self.signature.len());
        out.extend_from_slice(&(ident.len() as u16).to_be_bytes());
        out.extend_from_slice(&ident);
        out.extend_from_slice(&self.signed_on.to_be_bytes());
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let ident_len = read_u16(buf, &mut offset)? as usize;
        if buf.len() < offset + ident_len + 4 {
            return Err(CoreError::Malformed("session confirmed truncated"));
        }
        let (identity, _) = RouterIdentity::from_bytes(&buf[offset..offset + ident_len])?;
        offset += ident_len;
        let signed_on = read_u32(buf, &mut offset)?;
        let sig_len = identity.signing_key().sig_type().sig_len();
        if buf.len() < offset + sig_len {
            return Err(CoreError::Malformed("session confirmed signature truncated"));
        }
        let signature = buf[offset..offset + sig_len].to_vec();
        Ok(Self {
            identity,
            signed_on,
            signature,
        })
    }
}

/// The data both establishment signatures cover.
pub fn establishment_signed_data(
    x: &[u8; 256],
    y: &[u8; 256],
    your_ip: &IpAddr,
    your_port: u16,
    relay_tag: u32,
    signed_on: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(512 + 32);
    out.extend_from_slice(x);
    out.extend_from_slice(y);
    write_ip(&mut out, your_ip);
    out.extend_from_slice(&your_port.to_be_bytes());
    out.extend_from_slice(&relay_tag.to_be_bytes());
    out.extend_from_slice(&signed_on.to_be_bytes());
    out
}

/// RelayRequest: ask an introducer holding `relay_tag` to introduce us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub relay_tag: u32,
    pub alice_ip: IpAddr,
    pub alice_port: u16,
    pub intro_key: [u8; 32],
    pub nonce: u32,
}

impl RelayRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.relay_tag.to_be_bytes());
        write_ip(&mut out, &self.alice_ip);
        out.extend_from_slice(&self.alice_port.to_be_bytes());
        out.extend_from_slice(&self.intro_key);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let relay_tag = read_u32(buf, &mut offset)?;
        let alice_ip = read_ip(buf, &mut offset)?;
        let alice_port = read_u16(buf, &mut offset)?;
        let intro_key = read_key(buf, &mut offset)?;
        let nonce = read_u32(buf, &mut offset)?;
        Ok(Self {
            relay_tag,
            alice_ip,
            alice_port,
            intro_key,
            nonce,
        })
    }
}

/// RelayResponse: the introduced peer's real endpoint, back to the asker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    pub charlie_ip: IpAddr,
    pub charlie_port: u16,
    pub nonce: u32,
}

impl RelayResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_ip(&mut out, &self.charlie_ip);
        out.extend_from_slice(&self.charlie_port.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let charlie_ip = read_ip(buf, &mut offset)?;
        let charlie_port = read_u16(buf, &mut offset)?;
        let nonce = read_u32(buf, &mut offset)?;
        Ok(Self {
            charlie_ip,
            charlie_port,
            nonce,
        })
    }
}

/// RelayIntro: tells the firewalled peer to hole-punch toward the asker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayIntro {
    pub alice_ip: IpAddr,
    pub alice_port: u16,
}

impl RelayIntro {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_ip(&mut out, &self.alice_ip);
        out.extend_from_slice(&self.alice_port.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let alice_ip = read_ip(buf, &mut offset)?;
        let alice_port = read_u16(buf, &mut offset)?;
        Ok(Self {
            alice_ip,
            alice_port,
        })
    }
}

/// PeerTest: the 3-party reachability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTest {
    pub nonce: u32,
    /// Alice's address as observed; zero-size when Alice herself sends.
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub intro_key: [u8; 32],
}

impl PeerTest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.nonce.to_be_bytes());
        match &self.ip {
            Some(ip) => write_ip(&mut out, ip),
            None => out.push(0),
        }
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&self.intro_key);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let nonce = read_u32(buf, &mut offset)?;
        let ip = if buf.get(offset) == Some(&0) {
            offset += 1;
            None
        } else {
            Some(read_ip(buf, &mut offset)?)
        };
        let port = read_u16(buf, &mut offset)?;
        let intro_key = read_key(buf, &mut offset)?;
        Ok(Self {
            nonce,
            ip,
            port,
            intro_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let session_key = [1u8; 32];
        let mac_key = [2u8; 32];
        let payload = b"some ssu payload bytes";

        let packet = build_packet(&session_key, &mac_key, PayloadType::Data, payload);
        assert!(validate_packet(&mac_key, &packet));
        let parsed = parse_packet(&session_key, &mac_key, &packet).unwrap();
        assert_eq!(parsed.payload_type, PayloadType::Data);
        assert!(!parsed.rekey);
        // payload is padded to the block size; the prefix must survive
        assert_eq!(&parsed.payload[..payload.len()], payload);
    }

    #[test]
    fn test_wrong_mac_key_rejected() {
        let packet = build_packet(&[1u8; 32], &[2u8; 32], PayloadType::Data, b"x");
        assert!(!validate_packet(&[3u8; 32], &packet));
        assert!(matches!(
            parse_packet(&[1u8; 32], &[3u8; 32], &packet),
            Err(CoreError::AuthFailed(_))
        ));
    }

    #[test]
    fn test_bit_flip_rejected() {
        let mut packet = build_packet(&[1u8; 32], &[2u8; 32], PayloadType::Data, b"payload");
        let last = packet.len() - 1;
        packet[last] ^= 0x01;
        assert!(!validate_packet(&[2u8; 32], &packet));
    }

    #[test]
    fn test_session_request_roundtrip() {
        let req = SessionRequest {
            x: [9u8; 256],
            to_ip: "192.0.2.1".parse().unwrap(),
        };
        assert_eq!(SessionRequest::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn test_session_created_roundtrip() {
        let created = SessionCreated {
            y: [5u8; 256],
            your_ip: "192.0.2.44".parse().unwrap(),
            your_port: 8891,
            relay_tag: 42,
            signed_on: 1000,
            signature: vec![7u8; 64],
        };
        let decoded = SessionCreated::decode(&created.encode(), 64).unwrap();
        assert_eq!(decoded, created);
    }

    #[test]
    fn test_relay_and_peer_test_roundtrips() {
        let rr = RelayRequest {
            relay_tag: 7,
            alice_ip: "10.0.0.1".parse().unwrap(),
            alice_port: 1234,
            intro_key: [3u8; 32],
            nonce: 99,
        };
        assert_eq!(RelayRequest::decode(&rr.encode()).unwrap(), rr);

        let resp = RelayResponse {
            charlie_ip: "10.0.0.2".parse().unwrap(),
            charlie_port: 4321,
            nonce: 99,
        };
        assert_eq!(RelayResponse::decode(&resp.encode()).unwrap(), resp);

        let intro = RelayIntro {
            alice_ip: "10.0.0.1".parse().unwrap(),
            alice_port: 1234,
        };
        assert_eq!(RelayIntro::decode(&intro.encode()).unwrap(), intro);

        let pt = PeerTest {
            nonce: 5,
            ip: None,
            port: 7777,
            intro_key: [8u8; 32],
        };
        assert_eq!(PeerTest::decode(&pt.encode()).unwrap(), pt);

        let pt_with_ip = PeerTest {
            nonce: 5,
            ip: Some("198.51.100.3".parse().unwrap()),
            port: 7777,
            intro_key: [8u8; 32],
        };
        assert_eq!(PeerTest::decode(&pt_with_ip.encode()).unwrap(), pt_with_ip);
    }

    #[test]
    fn test_v6_address_roundtrip() {
        let req = SessionRequest {
            x: [0u8; 256],
            to_ip: "2001:db8::1".parse().unwrap(),
        };
        assert_eq!(SessionRequest::decode(&req.encode()).unwrap(), req);
    }
}
