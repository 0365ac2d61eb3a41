//! Tunnel build chains walked hop by hop, including the rejection path.

use garliccraft_core::{now_ms, now_secs, Capabilities, Hash, PrivateKeys, RouterAddress, RouterInfo};
use garliccraft_crypto::{tunnel_encrypt, SigType};
use garliccraft_tunnel::{
    apply_reply, build_frames, build_records, find_our_record, open_frame, process_reply,
    Delivery, Fragment, FragmentReassembler, Tunnel, TunnelHop, BUILD_REPLY_ACCEPT,
    BUILD_REPLY_REJECT,
};

fn hop_router() -> (PrivateKeys, RouterInfo) {
    let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
    let mut info = RouterInfo::new(
        keys.identity().clone(),
        now_ms(),
        vec![RouterAddress::ntcp("127.0.0.1", 1)],
        Capabilities::REACHABLE,
    );
    info.sign(&keys).unwrap();
    (keys, info)
}

fn chain(n: usize) -> (Vec<(PrivateKeys, RouterInfo)>, Vec<TunnelHop>) {
    let routers: Vec<(PrivateKeys, RouterInfo)> = (0..n).map(|_| hop_router()).collect();
    let mut hops: Vec<TunnelHop> = routers
        .iter()
        .map(|(_, info)| TunnelHop::generate(info.hash()))
        .collect();
    for i in 0..n - 1 {
        hops[i].next_tunnel_id = hops[i + 1].recv_tunnel_id;
    }
    (routers, hops)
}

#[test]
fn three_hop_build_accepted_by_every_hop() {
    let (routers, mut hops) = chain(3);
    hops[2].next_tunnel_id = 1; // reply tunnel at the creator's gateway

    let infos: Vec<&RouterInfo> = routers.iter().map(|(_, i)| i).collect();
    let (mut records, slots) = build_records(
        &hops,
        &infos,
        false,
        Hash::digest(b"reply-gateway"),
        777,
        now_secs() as u32,
    )
    .unwrap();

    for (j, (keys, info)) in routers.iter().enumerate() {
        let found = find_our_record(&records, &info.hash(), keys).unwrap();
        assert_eq!(found.index, slots[j]);
        apply_reply(
            &mut records,
            found.index,
            &found.record.reply_key,
            &found.record.reply_iv,
            BUILD_REPLY_ACCEPT,
        );
    }
    process_reply(&mut records, &hops, &slots).expect("all hops accepted");
}

/// Spec scenario: hop 2 replies 0x10; the creator sees BuildFailed.
#[test]
fn rejecting_middle_hop_fails_build() {
    let (routers, mut hops) = chain(3);
    hops[2].next_tunnel_id = 1;

    let infos: Vec<&RouterInfo> = routers.iter().map(|(_, i)| i).collect();
    let (mut records, slots) = build_records(
        &hops,
        &infos,
        true,
        Hash::digest(b"creator"),
        1,
        now_secs() as u32,
    )
    .unwrap();

    for (j, (keys, info)) in routers.iter().enumerate() {
        let found = find_our_record(&records, &info.hash(), keys).unwrap();
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
    assert!(process_reply(&mut records, &hops, &slots).is_err());
}

/// An outbound tunnel's gateway pre-transform must cancel exactly against
/// each hop's layer encryption, leaving parseable frames at the endpoint.
#[test]
fn outbound_frames_survive_the_full_path() {
    let hops: Vec<TunnelHop> = (0..3)
        .map(|i| TunnelHop::generate(Hash::digest(&[i as u8])))
        .collect();
    let mut tunnel = Tunnel::new(hops, false, 1);
    tunnel.state = garliccraft_tunnel::TunnelState::Established;

    let message = vec![0x5Au8; 2600];
    let delivery = Delivery::Router(Hash::digest(b"final"));
    let mut frames = build_frames(delivery, 42, &message);
    assert!(frames.len() > 1, "message should fragment");

    let mut reassembler = FragmentReassembler::new();
    let mut complete = None;
    for frame in frames.iter_mut() {
        // gateway side
        tunnel.apply_layers(frame);
        // each participating hop in path order
        for hop in &tunnel.hops {
            tunnel_encrypt(frame, &hop.layer_key, &hop.iv_key);
        }
        // endpoint parses the restored cleartext
        let fragments = open_frame(frame).expect("frame intact after full path");
        for fragment in fragments {
            if let Some(done) = reassembler.feed(fragment) {
                complete = Some(done);
            }
        }
    }
    let (got_delivery, got_payload) = complete.expect("message reassembled");
    assert_eq!(got_delivery, delivery);
    assert_eq!(got_payload, message);
}

/// A flipped bit anywhere in a relayed frame must be caught by the frame
/// checksum at the endpoint.
#[test]
fn corrupted_frame_is_detected_at_endpoint() {
    let frames = build_frames(Delivery::Local, 7, b"checksummed payload");
    let mut frame = frames[0];
    frame[700] ^= 0x01;
    assert!(open_frame(&frame).is_err());
}

#[test]
fn follow_on_fragments_reassemble_out_of_order() {
    let message: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    let frames = build_frames(Delivery::Local, 9, &message);
    let mut fragments: Vec<Fragment> = frames
        .iter()
        .flat_map(|f| open_frame(f).unwrap())
        .collect();
    fragments.rotate_left(1);

    let mut reassembler = FragmentReassembler::new();
    let mut complete = None;
    for fragment in fragments {
        if let Some(done) = reassembler.feed(fragment) {
            complete = Some(done);
        }
    }
    assert_eq!(complete.unwrap().1, message);
}
