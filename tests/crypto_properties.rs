//! Cryptographic round-trip properties across the public crypto surface.

use garliccraft_crypto::{
    elgamal_decrypt, elgamal_encrypt, generate_elgamal_keypair, rand_bytes, tunnel_decrypt,
    tunnel_encrypt, SigType, SigningKeypair, ELGAMAL_PLAINTEXT_SIZE, TUNNEL_DATA_SIZE,
};

// =========================================================================
// ElGamal
// =========================================================================

#[test]
fn elgamal_roundtrip_both_variants() {
    let (sk, pk) = generate_elgamal_keypair();
    for zero_padding in [false, true] {
        for _ in 0..3 {
            let mut payload = [0u8; ELGAMAL_PLAINTEXT_SIZE];
            rand_bytes(&mut payload);
            let encrypted = elgamal_encrypt(&pk, &payload, zero_padding).unwrap();
            let decrypted = elgamal_decrypt(&sk, &encrypted, zero_padding).unwrap();
            assert_eq!(decrypted, payload, "zero_padding={zero_padding}");
        }
    }
}

#[test]
fn elgamal_fresh_keypairs_are_independent() {
    let (_, pk) = generate_elgamal_keypair();
    let (other_sk, _) = generate_elgamal_keypair();
    let encrypted = elgamal_encrypt(&pk, b"independent", false).unwrap();
    assert!(elgamal_decrypt(&other_sk, &encrypted, false).is_err());
}

// =========================================================================
// Tunnel layer transform
// =========================================================================

#[test]
fn tunnel_transform_roundtrip_and_diffusion() {
    for _ in 0..5 {
        let mut layer_key = [0u8; 32];
        let mut iv_key = [0u8; 32];
        rand_bytes(&mut layer_key);
        rand_bytes(&mut iv_key);

        let mut frame = [0u8; TUNNEL_DATA_SIZE];
        rand_bytes(&mut frame);
        let original = frame;

        tunnel_encrypt(&mut frame, &layer_key, &iv_key);
        // every 16-byte block must change, including the IV block
        for (i, (enc, orig)) in frame.chunks(16).zip(original.chunks(16)).enumerate() {
            assert_ne!(enc, orig, "block {i} unchanged");
        }

        tunnel_decrypt(&mut frame, &layer_key, &iv_key);
        assert_eq!(frame[..], original[..]);
    }
}

#[test]
fn tunnel_transform_is_key_sensitive() {
    let mut frame = [7u8; TUNNEL_DATA_SIZE];
    let original = frame;
    tunnel_encrypt(&mut frame, &[1u8; 32], &[2u8; 32]);
    tunnel_decrypt(&mut frame, &[1u8; 32], &[3u8; 32]); // wrong iv key
    assert_ne!(frame[..], original[..]);
}

// =========================================================================
// Signatures
// =========================================================================

#[test]
fn signature_roundtrip_every_supported_type() {
    for sig_type in [
        SigType::DsaSha1,
        SigType::EcdsaSha256P256,
        SigType::EcdsaSha384P384,
        SigType::Ed25519,
    ] {
        let keypair = SigningKeypair::generate(sig_type).unwrap();
        let message = b"message under test";
        let sig = keypair.private.sign(message);
        keypair
            .public
            .verify(message, &sig)
            .unwrap_or_else(|e| panic!("{sig_type:?}: {e}"));

        // flipping any single bit of the signature must break it
        for byte in [0, sig.len() / 2, sig.len() - 1] {
            let mut bad = sig.clone();
            bad[byte] ^= 0x01;
            assert!(
                keypair.public.verify(message, &bad).is_err(),
                "{sig_type:?} accepted corrupt signature"
            );
        }
        // and so must flipping the message
        let mut tampered = message.to_vec();
        tampered[3] ^= 0x80;
        assert!(keypair.public.verify(&tampered, &sig).is_err());
    }
}
