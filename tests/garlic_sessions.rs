//! Garlic session behavior end to end between two engines, including the
//! tag-exhaustion scenario.

use bytes::Bytes;

use garliccraft_core::i2np::{DeliveryStatus, I2npMessage, MessageType};
use garliccraft_core::{now_ms, Hash, Lease, LeaseSet, PrivateKeys};
use garliccraft_crypto::SigType;
use garliccraft_garlic::{GarlicDelivery, GarlicEngine, TAGS_PER_BATCH};

fn destination() -> (PrivateKeys, LeaseSet) {
    let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
    let mut ls = LeaseSet::new(
        keys.identity().clone(),
        *keys.identity().public_key(),
        vec![Lease {
            tunnel_gateway: Hash::digest(b"gateway"),
            tunnel_id: 11,
            end_date: now_ms() + 5 * 60 * 1000,
        }],
    )
    .unwrap();
    ls.sign(&keys).unwrap();
    (keys, ls)
}

fn data_message(body: &'static [u8]) -> I2npMessage {
    I2npMessage::new(MessageType::Data, Bytes::from_static(body))
}

/// Forty-five messages: ElGamal, forty tag messages, ElGamal again; the
/// DeliveryStatus for the first nonce promotes that batch.
#[test]
fn tag_exhaustion_over_45_messages() {
    let (bob_keys, bob_ls) = destination();
    let mut alice = GarlicEngine::new();
    let mut bob = GarlicEngine::new();
    let reply = Some((Hash::digest(b"alice-gateway"), 3));

    let mut sizes = Vec::new();
    let mut first_nonce = None;
    for i in 0..45 {
        let wrapped = alice.wrap(&bob_ls, data_message(b"payload"), reply).unwrap();
        sizes.push(wrapped.payload.len());
        let cloves = bob.unwrap(&bob_keys, &wrapped.payload).unwrap();
        if i == 0 {
            first_nonce = cloves.iter().find_map(|c| match c.delivery {
                GarlicDelivery::Tunnel(..) => {
                    DeliveryStatus::decode(&c.message.payload).ok().map(|s| s.msg_id)
                }
                _ => None,
            });
            assert!(first_nonce.is_some(), "first message must carry a status clove");
        }
    }

    // message 1 is ElGamal-sized; 2..=41 are small tag messages; 42 jumps
    // back to ElGamal size
    let elgamal_size = sizes[0];
    for (i, &size) in sizes.iter().enumerate().take(41).skip(1) {
        assert!(
            size < elgamal_size - 400,
            "message {} should be tag-keyed ({} vs {})",
            i + 1,
            size,
            elgamal_size
        );
    }
    assert!(
        sizes[41] > sizes[1],
        "message 42 should revert to ElGamal ({} vs {})",
        sizes[41],
        sizes[1]
    );

    // the DeliveryStatus for message 1 settles that batch's bookkeeping
    alice.handle_delivery_status(first_nonce.unwrap());
}

#[test]
fn bidirectional_sessions_are_independent() {
    let (alice_keys, alice_ls) = destination();
    let (bob_keys, bob_ls) = destination();
    let mut alice = GarlicEngine::new();
    let mut bob = GarlicEngine::new();

    let to_bob = alice.wrap(&bob_ls, data_message(b"a->b"), None).unwrap();
    let to_alice = bob.wrap(&alice_ls, data_message(b"b->a"), None).unwrap();

    let bob_cloves = bob.unwrap(&bob_keys, &to_bob.payload).unwrap();
    let alice_cloves = alice.unwrap(&alice_keys, &to_alice.payload).unwrap();
    assert_eq!(bob_cloves[0].message.payload.as_ref(), b"a->b");
    assert_eq!(alice_cloves[0].message.payload.as_ref(), b"b->a");

    // both sides seeded tags for their own inbound direction
    assert_eq!(alice.inbound_tag_count(), TAGS_PER_BATCH);
    assert_eq!(bob.inbound_tag_count(), TAGS_PER_BATCH);
}

#[test]
fn replayed_tag_message_is_dropped() {
    let (bob_keys, bob_ls) = destination();
    let mut alice = GarlicEngine::new();
    let mut bob = GarlicEngine::new();

    let first = alice.wrap(&bob_ls, data_message(b"one"), None).unwrap();
    bob.unwrap(&bob_keys, &first.payload).unwrap();

    let second = alice.wrap(&bob_ls, data_message(b"two"), None).unwrap();
    bob.unwrap(&bob_keys, &second.payload).unwrap();
    // a tag is single-use: replaying the same garlic message cannot match
    assert!(bob.unwrap(&bob_keys, &second.payload).is_err());
}
