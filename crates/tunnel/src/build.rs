//! Tunnel build records.
//!
//! A build message carries exactly 8 records of 528 bytes; unused slots are
//! random filler. Each real record is ElGamal-encrypted to one hop behind a
//! 16-byte address prefix, and the creator pre-decrypts later records with
//! earlier hops' reply keys so the en-route reply encryption cancels out.

use garliccraft_core::i2np::{TUNNEL_BUILD_RECORD_SIZE, NUM_BUILD_RECORDS};
use garliccraft_core::{CoreError, Hash, PrivateKeys, Result, RouterInfo, TunnelId};
use garliccraft_crypto::{
    cbc_decrypt, cbc_encrypt, elgamal_encrypt, rand_bytes, sha256, ELGAMAL_PLAINTEXT_SIZE,
};

use crate::tunnel::TunnelHop;

pub const BUILD_REPLY_ACCEPT: u8 = 0x00;
pub const BUILD_REPLY_REJECT: u8 = 0x10;
pub const BUILD_REPLY_BANDWIDTH: u8 = 0x30;

const FLAG_INBOUND_GATEWAY: u8 = 0x80;
const FLAG_OUTBOUND_ENDPOINT: u8 = 0x40;

/// Fixed fields of the cleartext record, before padding and hash.
const RECORD_FIELDS_LEN: usize = 4 + 4 + 32 + 32 + 32 + 32 + 16 + 1 + 4 + 4;
const RECORD_PADDING_LEN: usize = ELGAMAL_PLAINTEXT_SIZE - RECORD_FIELDS_LEN - 32;

/// What one hop learns from its decrypted build record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequestRecord {
    pub receive_tunnel: TunnelId,
    pub next_tunnel: TunnelId,
    pub next_ident: Hash,
    pub layer_key: [u8; 32],
    pub iv_key: [u8; 32],
    pub reply_key: [u8; 32],
    pub reply_iv: [u8; 16],
    pub is_inbound_gateway: bool,
    pub is_outbound_endpoint: bool,
    pub request_time: u32,
    pub send_msg_id: u32,
}

impl BuildRequestRecord {
    fn encode_cleartext(&self) -> [u8; ELGAMAL_PLAINTEXT_SIZE] {
        let mut out = [0u8; ELGAMAL_PLAINTEXT_SIZE];
        let mut offset = 0;
        out[offset..offset + 4].copy_from_slice(&self.receive_tunnel.to_be_bytes());
        offset += 4;
        out[offset..offset + 4].copy_from_slice(&self.next_tunnel.to_be_bytes());
        offset += 4;
        out[offset..offset + 32].copy_from_slice(self.next_ident.as_bytes());
        offset += 32;
        out[offset..offset + 32].copy_from_slice(&self.layer_key);
        offset += 32;
        out[offset..offset + 32].copy_from_slice(&self.iv_key);
        offset += 32;
        out[offset..offset + 32].copy_from_slice(&self.reply_key);
        offset += 32;
        out[offset..offset + 16].copy_from_slice(&self.reply_iv);
        offset += 16;
        let mut flags = 0u8;
        if self.is_inbound_gateway {
            flags |= FLAG_INBOUND_GATEWAY;
        }
        if self.is_outbound_endpoint {
            flags |= FLAG_OUTBOUND_ENDPOINT;
        }
        out[offset] = flags;
        offset += 1;
        out[offset..offset + 4].copy_from_slice(&self.request_time.to_be_bytes());
        offset += 4;
        out[offset..offset + 4].copy_from_slice(&self.send_msg_id.to_be_bytes());
        offset += 4;
        rand_bytes(&mut out[offset..offset + RECORD_PADDING_LEN]);
        offset += RECORD_PADDING_LEN;
        let digest = sha256(&out[..offset]);
        out[offset..].copy_from_slice(&digest);
        out
    }

    /// Decode a record and check its trailing hash; a mismatch is dropped
    /// as malformed.
    pub fn decode_cleartext(buf: &[u8; ELGAMAL_PLAINTEXT_SIZE]) -> Result<Self> {
        let hash_offset = ELGAMAL_PLAINTEXT_SIZE - 32;
        if sha256(&buf[..hash_offset]) != buf[hash_offset..] {
            return Err(CoreError::Malformed("build record hash mismatch"));
        }
        let mut offset = 0;
        let receive_tunnel = u32::from_be_bytes(buf[offset..offset + 4].try_into().expect("fixed"));
        offset += 4;
        let next_tunnel = u32::from_be_bytes(buf[offset..offset + 4].try_into().expect("fixed"));
        offset += 4;
        let next_ident = Hash::from_slice(&buf[offset..offset + 32]).expect("fixed slice");
        offset += 32;
        let layer_key: [u8; 32] = buf[offset..offset + 32].try_into().expect("fixed");
        offset += 32;
        let iv_key: [u8; 32] = buf[offset..offset + 32].try_into().expect("fixed");
        offset += 32;
        let reply_key: [u8; 32] = buf[offset..offset + 32].try_into().expect("fixed");
        offset += 32;
        let reply_iv: [u8; 16] = buf[offset..offset + 16].try_into().expect("fixed");
        offset += 16;
        let flags = buf[offset];
        offset += 1;
        let request_time = u32::from_be_bytes(buf[offset..offset + 4].try_into().expect("fixed"));
        offset += 4;
        let send_msg_id = u32::from_be_bytes(buf[offset..offset + 4].try_into().expect("fixed"));
        Ok(Self {
            receive_tunnel,
            next_tunnel,
            next_ident,
            layer_key,
            iv_key,
            reply_key,
            reply_iv,
            is_inbound_gateway: flags & FLAG_INBOUND_GATEWAY != 0,
            is_outbound_endpoint: flags & FLAG_OUTBOUND_ENDPOINT != 0,
            request_time,
            send_msg_id,
        })
    }
}

/// Build the 8-record chain for `hops`, ElGamal-encrypted and layered.
///
/// `hop_infos` supplies each hop's encryption key; `reply_msg_id` names the
/// build-reply message the creator will match on. The last record's next
/// hop is `endpoint_ident`: the reply gateway for outbound builds, the
/// creator itself for inbound ones (its tunnel id comes from the last
/// hop's `next_tunnel_id`). Returns the records plus, for each hop, the
/// slot its record was shuffled into (needed to read the reply).
pub fn build_records(
    hops: &[TunnelHop],
    hop_infos: &[&RouterInfo],
    is_inbound: bool,
    endpoint_ident: Hash,
    reply_msg_id: u32,
    request_time: u32,
) -> Result<(Vec<[u8; TUNNEL_BUILD_RECORD_SIZE]>, Vec<usize>)> {
    debug_assert_eq!(hops.len(), hop_infos.len());
    if hops.is_empty() || hops.len() > NUM_BUILD_RECORDS {
        return Err(CoreError::Malformed("hop count out of range"));
    }

    let mut records: Vec<[u8; TUNNEL_BUILD_RECORD_SIZE]> = Vec::with_capacity(NUM_BUILD_RECORDS);
    for (j, (hop, info)) in hops.iter().zip(hop_infos).enumerate() {
        let last = j == hops.len() - 1;
        let record = BuildRequestRecord {
            receive_tunnel: hop.recv_tunnel_id,
            next_tunnel: hop.next_tunnel_id,
            next_ident: if last {
                endpoint_ident
            } else {
                hops[j + 1].ident
            },
            layer_key: hop.layer_key,
            iv_key: hop.iv_key,
            reply_key: hop.reply_key,
            reply_iv: hop.reply_iv,
            is_inbound_gateway: is_inbound && j == 0,
            is_outbound_endpoint: !is_inbound && last,
            request_time,
            send_msg_id: if last { reply_msg_id } else { 0 },
        };

        let cleartext = record.encode_cleartext();
        let encrypted = elgamal_encrypt(info.identity().public_key(), &cleartext, false)?;
        let mut out = [0u8; TUNNEL_BUILD_RECORD_SIZE];
        out[..16].copy_from_slice(&hop.ident.as_bytes()[..16]);
        out[16..].copy_from_slice(&encrypted);

        // cancel the reply encryption hops 0..j will apply en route
        for prior in hops[..j].iter().rev() {
            cbc_decrypt(&prior.reply_key, &prior.reply_iv, &mut out);
        }
        records.push(out);
    }

    // filler records, indistinguishable from real ones
    while records.len() < NUM_BUILD_RECORDS {
        let mut filler = [0u8; TUNNEL_BUILD_RECORD_SIZE];
        rand_bytes(&mut filler);
        records.push(filler);
    }

    // hide which slot belongs to which hop, tracking the permutation so
    // the creator can still read each hop's reply byte
    let mut origin: Vec<usize> = (0..NUM_BUILD_RECORDS).collect();
    for i in (1..records.len()).rev() {
        let j = garliccraft_crypto::rand_in_range(0..=i);
        records.swap(i, j);
        origin.swap(i, j);
    }
    let mut slot_of_hop = vec![0usize; hops.len()];
    for (slot, &orig) in origin.iter().enumerate() {
        if orig < hops.len() {
            slot_of_hop[orig] = slot;
        }
    }
    Ok((records, slot_of_hop))
}

/// A participant's view: find and decrypt our record, then transform the
/// rest for forwarding.
pub struct ParticipantRecord {
    pub index: usize,
    pub record: BuildRequestRecord,
}

/// Locate our record by ident prefix and ElGamal-decrypt it.
pub fn find_our_record(
    records: &[[u8; TUNNEL_BUILD_RECORD_SIZE]],
    local_hash: &Hash,
    keys: &PrivateKeys,
) -> Result<ParticipantRecord> {
    let prefix = &local_hash.as_bytes()[..16];
    for (index, record) in records.iter().enumerate() {
        if &record[..16] != prefix {
            continue;
        }
        let cleartext = keys.decrypt(&record[16..], false)?;
        let parsed = BuildRequestRecord::decode_cleartext(&cleartext)?;
        return Ok(ParticipantRecord {
            index,
            record: parsed,
        });
    }
    Err(CoreError::Malformed("no build record addressed to us"))
}

/// Apply our reply: overwrite our slot with the encrypted reply byte and
/// re-encrypt every record under our reply key so successors cannot
/// correlate.
pub fn apply_reply(
    records: &mut [[u8; TUNNEL_BUILD_RECORD_SIZE]],
    our_index: usize,
    reply_key: &[u8; 32],
    reply_iv: &[u8; 16],
    reply: u8,
) {
    let mut reply_record = [0u8; TUNNEL_BUILD_RECORD_SIZE];
    rand_bytes(&mut reply_record);
    reply_record[TUNNEL_BUILD_RECORD_SIZE - 1] = reply;
    records[our_index] = reply_record;
    for record in records.iter_mut() {
        cbc_encrypt(reply_key, reply_iv, record);
    }
}

/// Creator-side reply processing: peel each hop's reply layers and read the
/// reply bytes. `Ok(())` only when every hop accepted.
pub fn process_reply(
    records: &mut [[u8; TUNNEL_BUILD_RECORD_SIZE]],
    hops: &[TunnelHop],
    slot_of_hop: &[usize],
) -> Result<()> {
    debug_assert_eq!(hops.len(), slot_of_hop.len());
    // record in slot j (belonging to hop j) was encrypted by hops j..n-1
    for (j, &slot) in slot_of_hop.iter().enumerate() {
        let record = &mut records[slot];
        for hop in hops[j..].iter().rev() {
            cbc_decrypt(&hop.reply_key, &hop.reply_iv, record);
        }
        let reply = record[TUNNEL_BUILD_RECORD_SIZE - 1];
        if reply != BUILD_REPLY_ACCEPT {
            tracing::debug!(hop = j, reply, "tunnel build rejected by hop");
            return Err(CoreError::BuildFailed);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use garliccraft_core::{now_secs, Capabilities, RouterAddress};
    use garliccraft_crypto::SigType;

    fn make_hop_router() -> (PrivateKeys, RouterInfo) {
        let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
        let mut info = RouterInfo::new(
            keys.identity().clone(),
            garliccraft_core::now_ms(),
            vec![RouterAddress::ntcp("127.0.0.1", 1)],
            Capabilities::REACHABLE,
        );
        info.sign(&keys).unwrap();
        (keys, info)
    }

    #[test]
    fn test_record_cleartext_roundtrip() {
        let record = BuildRequestRecord {
            receive_tunnel: 1,
            next_tunnel: 2,
            next_ident: Hash::digest(b"next"),
            layer_key: [3u8; 32],
            iv_key: [4u8; 32],
            reply_key: [5u8; 32],
            reply_iv: [6u8; 16],
            is_inbound_gateway: true,
            is_outbound_endpoint: false,
            request_time: 1000,
            send_msg_id: 77,
        };
        let encoded = record.encode_cleartext();
        let decoded = BuildRequestRecord::decode_cleartext(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_tampered_record_hash_fails() {
        let record = BuildRequestRecord {
            receive_tunnel: 1,
            next_tunnel: 2,
            next_ident: Hash::digest(b"next"),
            layer_key: [3u8; 32],
            iv_key: [4u8; 32],
            reply_key: [5u8; 32],
            reply_iv: [6u8; 16],
            is_inbound_gateway: false,
            is_outbound_endpoint: false,
            request_time: 0,
            send_msg_id: 0,
        };
        let mut encoded = record.encode_cleartext();
        encoded[10] ^= 0x01;
        assert!(matches!(
            BuildRequestRecord::decode_cleartext(&encoded),
            Err(CoreError::Malformed(_))
        ));
    }

    /// Walk a 3-hop build through each participant and back: every hop must
    /// find and decrypt its record after the previous hops' transformations,
    /// and the creator must read every accept byte.
    #[test]
    fn test_full_build_walkthrough() {
        let routers: Vec<(PrivateKeys, RouterInfo)> = (0..3).map(|_| make_hop_router()).collect();
        let mut hops: Vec<TunnelHop> = routers
            .iter()
            .map(|(_, info)| TunnelHop::generate(info.hash()))
            .collect();
        for i in 0..hops.len() - 1 {
            hops[i].next_tunnel_id = hops[i + 1].recv_tunnel_id;
        }
        hops[2].next_tunnel_id = 999; // reply gateway tunnel

        let infos: Vec<&RouterInfo> = routers.iter().map(|(_, info)| info).collect();
        let reply_gateway = Hash::digest(b"reply-gateway");
        let (mut records, slot_of_hop) = build_records(
            &hops,
            &infos,
            false,
            reply_gateway,
            4242,
            now_secs() as u32,
        )
        .unwrap();
        assert_eq!(records.len(), NUM_BUILD_RECORDS);

        for (j, (keys, info)) in routers.iter().enumerate() {
            let found = find_our_record(&records, &info.hash(), keys)
                .unwrap_or_else(|e| panic!("hop {j} could not find record: {e}"));
            assert_eq!(found.index, slot_of_hop[j], "shuffle map for hop {j}");
            assert_eq!(found.record.receive_tunnel, hops[j].recv_tunnel_id);
            assert_eq!(found.record.layer_key, hops[j].layer_key);
            if j == hops.len() - 1 {
                assert!(found.record.is_outbound_endpoint);
                assert_eq!(found.record.send_msg_id, 4242);
                assert_eq!(found.record.next_ident, reply_gateway);
            } else {
                assert_eq!(found.record.next_ident, hops[j + 1].ident);
            }
            apply_reply(
                &mut records,
                found.index,
                &found.record.reply_key,
                &found.record.reply_iv,
                BUILD_REPLY_ACCEPT,
            );
        }

        process_reply(&mut records, &hops, &slot_of_hop).unwrap();
    }

    #[test]
    fn test_rejecting_hop_fails_build() {
        let routers: Vec<(PrivateKeys, RouterInfo)> = (0..2).map(|_| make_hop_router()).collect();
        let mut hops: Vec<TunnelHop> = routers
            .iter()
            .map(|(_, info)| TunnelHop::generate(info.hash()))
            .collect();
        hops[0].next_tunnel_id = hops[1].recv_tunnel_id;

        let infos: Vec<&RouterInfo> = routers.iter().map(|(_, info)| info).collect();
        let (mut records, slot_of_hop) =
            build_records(&hops, &infos, true, Hash::digest(b"us"), 1, now_secs() as u32).unwrap();

        for (j, (keys, info)) in routers.iter().enumerate() {
            let found = find_our_record(&records, &info.hash(), keys).unwrap();
            assert_eq!(found.index, slot_of_hop[j]);
            let reply = if j == 1 {
                BUILD_REPLY_REJECT
            } else {
                BUILD_REPLY_ACCEPT
            };
            apply_reply(
                &mut records,
                found.index,
                &found.record.reply_key,
                &found.record.reply_iv,
                reply,
            );
        }
        assert!(matches!(
            process_reply(&mut records, &hops, &slot_of_hop),
            Err(CoreError::BuildFailed)
        ));
    }
}
