//! GarlicCraft end-to-end layer
//!
//! Wraps I2NP messages into garlic messages between destinations: ElGamal
//! bootstrap, session tags, clove aggregation, and delivery-status-driven
//! tag confirmation. The engine is owned by its destination; routing of
//! unwrapped cloves is the owner's job.

mod clove;
mod session;

pub use clove::{parse_cloves, write_cloves, Clove, GarlicDelivery, CLOVE_LIFETIME_MS};
pub use session::{
    build_aes_block, parse_aes_block, DeliveryKind, GarlicRoutingSession,
    OUTGOING_TAGS_EXPIRATION_MS, TAGS_PER_BATCH, TAG_CONFIRMATION_TIMEOUT_MS,
};

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, trace};

use garliccraft_core::i2np::{DeliveryStatus, I2npMessage, MessageType};
use garliccraft_core::{
    now_ms, CoreError, Hash, LeaseSet, PrivateKeys, Result, SessionTag, TunnelId,
};
use garliccraft_crypto::{cbc_decrypt, sha256, ELGAMAL_CIPHERTEXT_PADDED_SIZE};

/// Tags we accepted from peers expire after sixteen minutes.
pub const INCOMING_TAGS_EXPIRATION_MS: u64 = 960 * 1000;

struct InboundTag {
    session_key: [u8; 32],
    created_at: u64,
}

/// Per-destination garlic machinery: outbound sessions keyed by remote
/// destination, plus the inbound tag index.
pub struct GarlicEngine {
    sessions: HashMap<Hash, GarlicRoutingSession>,
    inbound_tags: HashMap<SessionTag, InboundTag>,
    /// Nonce → remote destination whose tag batch it confirms.
    pending_status: HashMap<u32, Hash>,
}

impl GarlicEngine {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            inbound_tags: HashMap::new(),
            pending_status: HashMap::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn inbound_tag_count(&self) -> usize {
        self.inbound_tags.len()
    }

    /// Wrap `msg` for `remote`. When fresh tags ride along, a
    /// delivery-status clove routed back through `reply_lease` asks the
    /// peer to confirm them.
    pub fn wrap(
        &mut self,
        remote: &LeaseSet,
        msg: I2npMessage,
        reply_lease: Option<(Hash, TunnelId)>,
    ) -> Result<I2npMessage> {
        let remote_hash = remote.hash();
        let session = self.sessions.entry(remote_hash).or_default();
        let (kind, iv, new_tags) = session.prepare_delivery(remote.encryption_key())?;

        let mut cloves = vec![Clove::new(GarlicDelivery::Local, msg)];
        if !new_tags.is_empty() {
            if let DeliveryKind::ElGamal { status_nonce, .. } = &kind {
                if let Some((gateway, tunnel_id)) = reply_lease {
                    let status = DeliveryStatus {
                        msg_id: *status_nonce,
                        timestamp: now_ms(),
                    };
                    let status_msg =
                        I2npMessage::new(MessageType::DeliveryStatus, status.encode());
                    cloves.push(Clove::new(
                        GarlicDelivery::Tunnel(gateway, tunnel_id),
                        status_msg,
                    ));
                    self.pending_status.insert(*status_nonce, remote_hash);
                }
            }
        }

        let payload = write_cloves(&cloves);
        let mut block = build_aes_block(&new_tags, &payload);
        session.encrypt_block(&iv, &mut block);

        let mut garlic = Vec::new();
        match kind {
            DeliveryKind::Tag(tag) => {
                garlic.extend_from_slice(&tag.0);
            }
            DeliveryKind::ElGamal { block: eg, .. } => {
                garlic.extend_from_slice(&eg);
            }
        }
        garlic.extend_from_slice(&block);

        // length-prefixed garlic body
        let mut payload = Vec::with_capacity(4 + garlic.len());
        payload.extend_from_slice(&(garlic.len() as u32).to_be_bytes());
        payload.extend_from_slice(&garlic);
        Ok(I2npMessage::new(MessageType::Garlic, Bytes::from(payload)))
    }

    /// Unwrap a received Garlic message with `keys` (the destination's
    /// identity). Returns the live cloves; expired ones are dropped here.
    pub fn unwrap(&mut self, keys: &PrivateKeys, payload: &[u8]) -> Result<Vec<Clove>> {
        if payload.len() < 4 {
            return Err(CoreError::Malformed("garlic length truncated"));
        }
        let len = u32::from_be_bytes(payload[..4].try_into().expect("fixed")) as usize;
        if payload.len() < 4 + len {
            return Err(CoreError::Malformed("garlic body truncated"));
        }
        let body = &payload[4..4 + len];

        // try the first 32 bytes as a known session tag
        if body.len() > 32 {
            if let Some(tag) = SessionTag::from_slice(&body[..32]) {
                let hit = self
                    .inbound_tags
                    .remove(&tag)
                    .filter(|t| now_ms() < t.created_at + INCOMING_TAGS_EXPIRATION_MS);
                if let Some(entry) = hit {
                    let digest = sha256(&tag.0);
                    let mut iv = [0u8; 16];
                    iv.copy_from_slice(&digest[..16]);
                    let mut data = body[32..].to_vec();
                    if data.len() % 16 != 0 {
                        return Err(CoreError::DecryptCheckFailed);
                    }
                    cbc_decrypt(&entry.session_key, &iv, &mut data);
                    return self.process_block(&entry.session_key, &data);
                }
            }
        }

        // no matching tag: ElGamal with the destination's private key
        if body.len() < ELGAMAL_CIPHERTEXT_PADDED_SIZE {
            return Err(CoreError::DecryptCheckFailed);
        }
        let block = keys.decrypt(&body[..ELGAMAL_CIPHERTEXT_PADDED_SIZE], true)?;
        let mut session_key = [0u8; 32];
        session_key.copy_from_slice(&block[..32]);
        let digest = sha256(&block[32..64]);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&digest[..16]);

        let mut data = body[ELGAMAL_CIPHERTEXT_PADDED_SIZE..].to_vec();
        if data.is_empty() || data.len() % 16 != 0 {
            return Err(CoreError::DecryptCheckFailed);
        }
        cbc_decrypt(&session_key, &iv, &mut data);
        self.process_block(&session_key, &data)
    }

    fn process_block(&mut self, session_key: &[u8; 32], data: &[u8]) -> Result<Vec<Clove>> {
        let (tags, payload) = parse_aes_block(data)?;
        let now = now_ms();
        for tag in tags {
            self.inbound_tags.insert(
                tag,
                InboundTag {
                    session_key: *session_key,
                    created_at: now,
                },
            );
        }
        let cloves = parse_cloves(&payload)?;
        let live: Vec<Clove> = cloves
            .into_iter()
            .filter(|c| {
                if c.is_expired(now) {
                    trace!(clove = c.clove_id, "dropping expired clove");
                    false
                } else {
                    true
                }
            })
            .collect();
        Ok(live)
    }

    /// A DeliveryStatus came back: if its nonce confirms one of our tag
    /// batches, promote it.
    pub fn handle_delivery_status(&mut self, nonce: u32) -> bool {
        let Some(remote) = self.pending_status.remove(&nonce) else {
            return false;
        };
        let confirmed = self
            .sessions
            .get_mut(&remote)
            .is_some_and(|s| s.confirm_batch(nonce));
        if confirmed {
            debug!(?remote, nonce, "session tags confirmed");
        }
        confirmed
    }

    /// Periodic cleanup: expired inbound tags, dead sessions, stale nonces.
    pub fn cleanup(&mut self) {
        let now = now_ms();
        self.inbound_tags
            .retain(|_, t| now < t.created_at + INCOMING_TAGS_EXPIRATION_MS);
        self.sessions.retain(|_, s| s.cleanup());
        let live: std::collections::HashSet<Hash> = self.sessions.keys().copied().collect();
        self.pending_status.retain(|_, dest| live.contains(dest));
    }
}

impl Default for GarlicEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garliccraft_core::Lease;
    use garliccraft_crypto::SigType;

    fn make_destination() -> (PrivateKeys, LeaseSet) {
        let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
        let mut ls = LeaseSet::new(
            keys.identity().clone(),
            *keys.identity().public_key(),
            vec![Lease {
                tunnel_gateway: Hash::digest(b"gw"),
                tunnel_id: 1,
                end_date: now_ms() + 300_000,
            }],
        )
        .unwrap();
        ls.sign(&keys).unwrap();
        (keys, ls)
    }

    fn make_data_message(text: &'static [u8]) -> I2npMessage {
        I2npMessage::new(MessageType::Data, Bytes::from_static(text))
    }

    #[test]
    fn test_wrap_unwrap_first_message() {
        let (bob_keys, bob_ls) = make_destination();
        let mut alice = GarlicEngine::new();
        let mut bob = GarlicEngine::new();

        let wrapped = alice
            .wrap(
                &bob_ls,
                make_data_message(b"hello bob"),
                Some((Hash::digest(b"alice-gw"), 7)),
            )
            .unwrap();
        assert_eq!(wrapped.msg_type, MessageType::Garlic);

        let cloves = bob.unwrap(&bob_keys, &wrapped.payload).unwrap();
        // the data clove plus the delivery-status clove for tag confirmation
        assert_eq!(cloves.len(), 2);
        assert!(cloves
            .iter()
            .any(|c| matches!(c.delivery, GarlicDelivery::Local)
                && c.message.payload.as_ref() == b"hello bob"));
        assert!(cloves
            .iter()
            .any(|c| matches!(c.delivery, GarlicDelivery::Tunnel(_, 7))));
        assert_eq!(bob.inbound_tag_count(), TAGS_PER_BATCH);
    }

    #[test]
    fn test_second_message_uses_tag() {
        let (bob_keys, bob_ls) = make_destination();
        let mut alice = GarlicEngine::new();
        let mut bob = GarlicEngine::new();

        let first = alice
            .wrap(&bob_ls, make_data_message(b"one"), None)
            .unwrap();
        bob.unwrap(&bob_keys, &first.payload).unwrap();

        let second = alice
            .wrap(&bob_ls, make_data_message(b"two"), None)
            .unwrap();
        // a tag-keyed message is much smaller than an ElGamal one
        assert!(second.payload.len() < first.payload.len());

        let cloves = bob.unwrap(&bob_keys, &second.payload).unwrap();
        assert_eq!(cloves.len(), 1);
        assert_eq!(cloves[0].message.payload.as_ref(), b"two");
        // one tag spent
        assert_eq!(bob.inbound_tag_count(), TAGS_PER_BATCH - 1);
    }

    #[test]
    fn test_tag_exhaustion_scenario() {
        let (bob_keys, bob_ls) = make_destination();
        let mut alice = GarlicEngine::new();
        let mut bob = GarlicEngine::new();
        let reply = Some((Hash::digest(b"alice-gw"), 1));

        // message 1: ElGamal (no live tag can match)
        let first = alice
            .wrap(&bob_ls, make_data_message(b"m1"), reply)
            .unwrap();
        let first_cloves = bob.unwrap(&bob_keys, &first.payload).unwrap();
        let status_nonce = first_cloves
            .iter()
            .find_map(|c| match c.delivery {
                GarlicDelivery::Tunnel(..) => {
                    DeliveryStatus::decode(&c.message.payload).ok().map(|s| s.msg_id)
                }
                _ => None,
            })
            .expect("status clove");

        // messages 2..=41 ride on the initial batch of 40
        for _ in 0..TAGS_PER_BATCH {
            let msg = alice.wrap(&bob_ls, make_data_message(b"m"), reply).unwrap();
            bob.unwrap(&bob_keys, &msg.payload).unwrap();
        }

        // message 42 must be ElGamal again: roughly first-message sized
        let msg42 = alice.wrap(&bob_ls, make_data_message(b"m1"), reply).unwrap();
        assert!(msg42.payload.len() + 64 > first.payload.len());

        // the delivery status for message 1 promotes that (spent) batch;
        // the session keeps running on the batch from message 42
        alice.handle_delivery_status(status_nonce);
    }

    #[test]
    fn test_unknown_destination_drops_silently() {
        let (_, bob_ls) = make_destination();
        let (eve_keys, _) = make_destination();
        let mut alice = GarlicEngine::new();
        let mut eve = GarlicEngine::new();

        let wrapped = alice
            .wrap(&bob_ls, make_data_message(b"secret"), None)
            .unwrap();
        // wrong destination: ElGamal check fails
        assert!(matches!(
            eve.unwrap(&eve_keys, &wrapped.payload),
            Err(CoreError::DecryptCheckFailed)
        ));
    }

    #[test]
    fn test_delivery_status_for_unknown_nonce() {
        let mut engine = GarlicEngine::new();
        assert!(!engine.handle_delivery_status(12345));
    }

    #[test]
    fn test_cleanup_drops_expired_inbound_tags() {
        let (bob_keys, bob_ls) = make_destination();
        let mut alice = GarlicEngine::new();
        let mut bob = GarlicEngine::new();

        let msg = alice.wrap(&bob_ls, make_data_message(b"x"), None).unwrap();
        bob.unwrap(&bob_keys, &msg.payload).unwrap();
        assert!(bob.inbound_tag_count() > 0);

        for tag in bob.inbound_tags.values_mut() {
            tag.created_at = now_ms() - INCOMING_TAGS_EXPIRATION_MS - 1;
        }
        bob.cleanup();
        assert_eq!(bob.inbound_tag_count(), 0);
    }
}
