//! Outbound garlic routing sessions.
//!
//! The first message to a destination carries the session key inside an
//! ElGamal block along with a batch of session tags; once the peer confirms
//! receipt (a DeliveryStatus for our nonce), the tags become live and later
//! messages are pure AES keyed by tag.

use std::collections::VecDeque;

use garliccraft_core::{now_ms, CoreError, Result, SessionTag};
use garliccraft_crypto::{
    cbc_encrypt, elgamal_encrypt, rand_bytes, rand_u32_nonzero, sha256,
    ELGAMAL_CIPHERTEXT_PADDED_SIZE,
};

/// Tags handed out per delivery.
pub const TAGS_PER_BATCH: usize = 40;

/// Live outbound tags expire this long after confirmation.
pub const OUTGOING_TAGS_EXPIRATION_MS: u64 = 720 * 1000;

/// A tag batch not confirmed within this window is discarded.
pub const TAG_CONFIRMATION_TIMEOUT_MS: u64 = 4_000;

struct TagBatch {
    tags: VecDeque<SessionTag>,
    created_at: u64,
    confirmed: bool,
    nonce: u32,
}

impl TagBatch {
    fn is_usable(&self, now: u64) -> bool {
        if self.confirmed {
            now < self.created_at + OUTGOING_TAGS_EXPIRATION_MS
        } else {
            now < self.created_at + TAG_CONFIRMATION_TIMEOUT_MS
        }
    }
}

/// What `prepare_delivery` decided about the head of the message.
pub enum DeliveryKind {
    /// `tag || AES{...}`; the tag names the session key on the remote side.
    Tag(SessionTag),
    /// `ElGamal{sessionKey || preIV || pad} || AES{...}` with fresh tags inside.
    ElGamal {
        block: Vec<u8>,
        /// Nonce of the delivery-status clove confirming the new batch.
        status_nonce: u32,
    },
}

/// Per-remote-destination outbound session state.
pub struct GarlicRoutingSession {
    session_key: [u8; 32],
    batches: Vec<TagBatch>,
}

impl GarlicRoutingSession {
    pub fn new() -> Self {
        let mut session_key = [0u8; 32];
        rand_bytes(&mut session_key);
        Self {
            session_key,
            batches: Vec::new(),
        }
    }

    pub fn session_key(&self) -> &[u8; 32] {
        &self.session_key
    }

    /// Count of tags currently spendable.
    pub fn available_tags(&self) -> usize {
        let now = now_ms();
        self.batches
            .iter()
            .filter(|b| b.is_usable(now))
            .map(|b| b.tags.len())
            .sum()
    }

    /// Decide how the next message is keyed. Uses a tag when one is live;
    /// otherwise builds a fresh ElGamal block carrying a new tag batch, and
    /// the caller attaches a delivery-status clove with the returned nonce.
    ///
    /// Returns `(kind, iv, new_tags_to_send)`.
    pub fn prepare_delivery(
        &mut self,
        remote_enc_key: &[u8; 256],
    ) -> Result<(DeliveryKind, [u8; 16], Vec<SessionTag>)> {
        self.cleanup();
        let now = now_ms();

        if let Some(tag) = self.take_tag(now) {
            let digest = sha256(&tag.0);
            let mut iv = [0u8; 16];
            iv.copy_from_slice(&digest[..16]);
            return Ok((DeliveryKind::Tag(tag), iv, Vec::new()));
        }

        // no live tags: back to ElGamal with a new unconfirmed batch
        let tags: Vec<SessionTag> = (0..TAGS_PER_BATCH).map(|_| SessionTag::random()).collect();
        let nonce = rand_u32_nonzero();
        self.batches.push(TagBatch {
            tags: tags.iter().copied().collect(),
            created_at: now,
            confirmed: false,
            nonce,
        });

        let mut pre_iv = [0u8; 32];
        rand_bytes(&mut pre_iv);
        let digest = sha256(&pre_iv);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&digest[..16]);

        // ElGamal block: sessionKey || preIV || random padding to 222
        let mut block = [0u8; 222];
        block[..32].copy_from_slice(&self.session_key);
        block[32..64].copy_from_slice(&pre_iv);
        rand_bytes(&mut block[64..]);
        let encrypted = elgamal_encrypt(remote_enc_key, &block, true)?;
        debug_assert_eq!(encrypted.len(), ELGAMAL_CIPHERTEXT_PADDED_SIZE);

        Ok((
            DeliveryKind::ElGamal {
                block: encrypted,
                status_nonce: nonce,
            },
            iv,
            tags,
        ))
    }

    /// AES-encrypt the block body under the session key.
    pub fn encrypt_block(&self, iv: &[u8; 16], data: &mut [u8]) {
        cbc_encrypt(&self.session_key, iv, data);
    }

    /// The peer acknowledged `nonce`: promote that batch to live.
    pub fn confirm_batch(&mut self, nonce: u32) -> bool {
        for batch in &mut self.batches {
            if batch.nonce == nonce && !batch.confirmed {
                batch.confirmed = true;
                batch.created_at = now_ms();
                return true;
            }
        }
        false
    }

    fn take_tag(&mut self, now: u64) -> Option<SessionTag> {
        for batch in &mut self.batches {
            if batch.is_usable(now) {
                if let Some(tag) = batch.tags.pop_front() {
                    return Some(tag);
                }
            }
        }
        None
    }

    /// Drop expired batches; true when the session still holds state worth
    /// keeping.
    pub fn cleanup(&mut self) -> bool {
        let now = now_ms();
        self.batches.retain(|b| b.is_usable(now) && !b.tags.is_empty());
        !self.batches.is_empty()
    }
}

impl Default for GarlicRoutingSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Sanity bound used by block builders: count || tags || len || hash || flag.
pub fn aes_block_overhead(tag_count: usize) -> usize {
    2 + tag_count * 32 + 4 + 32 + 1
}

/// Serialize the AES block: `count u16 || tags || payload_len u32 ||
/// SHA256(payload) || flag || payload || pad-to-16`.
pub fn build_aes_block(tags: &[SessionTag], payload: &[u8]) -> Vec<u8> {
    let raw = aes_block_overhead(tags.len()) + payload.len();
    let padded = (raw + 15) & !15;
    let mut out = Vec::with_capacity(padded);
    out.extend_from_slice(&(tags.len() as u16).to_be_bytes());
    for tag in tags {
        out.extend_from_slice(&tag.0);
    }
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&sha256(payload));
    out.push(0); // flag
    out.extend_from_slice(payload);
    let mut padding = vec![0u8; padded - raw];
    rand_bytes(&mut padding);
    out.extend_from_slice(&padding);
    out
}

/// Parse a decrypted AES block; the embedded hash check is what rejects a
/// wrong key or corrupted ciphertext.
pub fn parse_aes_block(data: &[u8]) -> Result<(Vec<SessionTag>, Vec<u8>)> {
    if data.len() < 2 {
        return Err(CoreError::DecryptCheckFailed);
    }
    let count = u16::from_be_bytes(data[..2].try_into().expect("fixed")) as usize;
    let mut offset = 2;
    if data.len() < offset + count * 32 + 4 + 32 + 1 {
        return Err(CoreError::DecryptCheckFailed);
    }
    let mut tags = Vec::with_capacity(count);
    for _ in 0..count {
        tags.push(SessionTag::from_slice(&data[offset..offset + 32]).expect("fixed slice"));
        offset += 32;
    }
    let payload_len =
        u32::from_be_bytes(data[offset..offset + 4].try_into().expect("fixed")) as usize;
    offset += 4;
    let expected_hash: [u8; 32] = data[offset..offset + 32].try_into().expect("fixed");
    offset += 32;
    offset += 1; // flag
    if data.len() < offset + payload_len {
        return Err(CoreError::DecryptCheckFailed);
    }
    let payload = data[offset..offset + payload_len].to_vec();
    if sha256(&payload) != expected_hash {
        return Err(CoreError::DecryptCheckFailed);
    }
    Ok((tags, payload))
}
