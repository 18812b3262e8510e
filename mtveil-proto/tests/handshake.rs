//! Handshake codec round-trips, driven from the wire side: a test double
//! plays the Telegram client (or the datacenter) and the codec must agree
//! with it byte for byte.

use mtveil_crypto::{ObfuscatedCipher, mix_key};
use mtveil_proto::{ClientHandshake, HANDSHAKE_LEN, PeerHandshake, Secret, TransportTag};
use mtveil_proto::handshake::HandshakeError;

/// What a real client does: pick random bytes, stamp transport + DC into
/// the tail, derive both ciphers with the proxy secret, seal the tail.
fn client_build(
    secret: &Secret,
    transport: TransportTag,
    dc_id: i16,
) -> ([u8; HANDSHAKE_LEN], ObfuscatedCipher, ObfuscatedCipher) {
    let mut frame = [0u8; HANDSHAKE_LEN];
    loop {
        getrandom::getrandom(&mut frame).unwrap();
        if frame[0] != 0xef && frame[..8] != [0u8; 8] && frame[4..8] != [0u8; 4] {
            break;
        }
    }
    frame[56..60].copy_from_slice(&transport.to_wire());
    frame[60..62].copy_from_slice(&dc_id.to_le_bytes());

    let (mut enc, dec) = split_ciphers(&frame, Some(&secret.key));

    let mut sealed = frame;
    enc.apply(&mut sealed);
    frame[56..64].copy_from_slice(&sealed[56..64]);
    (frame, enc, dec)
}

/// Forward-span cipher and reversed-span cipher for a frame.
fn split_ciphers(
    frame: &[u8; HANDSHAKE_LEN],
    secret: Option<&[u8; 16]>,
) -> (ObfuscatedCipher, ObfuscatedCipher) {
    let mut fwd_key = [0u8; 32];
    let mut fwd_iv = [0u8; 16];
    fwd_key.copy_from_slice(&frame[8..40]);
    fwd_iv.copy_from_slice(&frame[40..56]);

    let mut rev = [0u8; 48];
    rev.copy_from_slice(&frame[8..56]);
    rev.reverse();
    let mut rev_key = [0u8; 32];
    let mut rev_iv = [0u8; 16];
    rev_key.copy_from_slice(&rev[..32]);
    rev_iv.copy_from_slice(&rev[32..]);

    (
        ObfuscatedCipher::new(&mix_key(&fwd_key, secret), &fwd_iv),
        ObfuscatedCipher::new(&mix_key(&rev_key, secret), &rev_iv),
    )
}

fn test_secret() -> Secret {
    Secret::parse(&"a1".repeat(16)).unwrap()
}

#[test]
fn parse_recovers_transport_and_dc() {
    let secret = test_secret();
    let (frame, _, _) = client_build(&secret, TransportTag::Intermediate, 5);

    let hs = ClientHandshake::parse(&frame, &secret).unwrap();
    assert_eq!(hs.transport, TransportTag::Intermediate);
    assert_eq!(hs.dc_id, 5);
}

#[test]
fn parse_keeps_the_sign_of_the_dc_id() {
    let secret = test_secret();
    let (frame, _, _) = client_build(&secret, TransportTag::Abridged, -3);
    let hs = ClientHandshake::parse(&frame, &secret).unwrap();
    assert_eq!(hs.dc_id, -3);
}

#[test]
fn payload_streams_stay_aligned_after_parse() {
    let secret = test_secret();
    let (frame, mut client_enc, mut client_dec) =
        client_build(&secret, TransportTag::PaddedIntermediate, 2);
    let mut hs = ClientHandshake::parse(&frame, &secret).unwrap();

    // client → proxy, first payload bytes after the 64-byte frame
    let mut wire = *b"first payload after the handshake frame";
    client_enc.apply(&mut wire);
    hs.decrypt.apply(&mut wire);
    assert_eq!(&wire, b"first payload after the handshake frame");

    // proxy → client, keystream starts at position zero
    let mut reply = *b"reply bytes from the proxy";
    hs.encrypt.apply(&mut reply);
    client_dec.apply(&mut reply);
    assert_eq!(&reply, b"reply bytes from the proxy");
}

#[test]
fn wrong_secret_scrambles_the_tail() {
    let secret = test_secret();
    let other = Secret::parse(&"b2".repeat(16)).unwrap();
    let (frame, _, _) = client_build(&secret, TransportTag::Intermediate, 1);

    // With the wrong key the decrypted tag is noise; the overwhelmingly
    // likely outcome is an unknown-transport rejection.
    match ClientHandshake::parse(&frame, &other) {
        Err(HandshakeError::UnknownTransport(_)) => {}
        Ok(hs) => panic!("parsed with wrong secret as {:?}", hs.transport),
        Err(e) => panic!("unexpected error {e}"),
    }
}

#[test]
fn obvious_marker_rejected_before_any_crypto() {
    let secret = test_secret();
    let mut frame = [0x55u8; HANDSHAKE_LEN];
    frame[..4].copy_from_slice(b"POST");
    assert!(matches!(
        ClientHandshake::parse(&frame, &secret),
        Err(HandshakeError::ObviousMarker)
    ));
}

#[test]
fn peer_handshake_reads_back_as_padded_intermediate() {
    for upstream_secret in [None, Some([0x77u8; 16])] {
        let hs = PeerHandshake::generate(4, upstream_secret.as_ref());

        // Play the datacenter: forward span keys its decrypt direction.
        let (mut dc_decrypt, mut dc_encrypt) =
            split_ciphers(&hs.frame, upstream_secret.as_ref());
        let mut plain = hs.frame;
        dc_decrypt.apply(&mut plain);
        assert_eq!(&plain[56..60], &[0xdd; 4], "upstream transport is padded-intermediate");
        assert_eq!(i16::from_le_bytes([plain[60], plain[61]]), 4);

        // And the byte streams line up in both directions.
        let mut hs = hs;
        let mut up = *b"proxy to datacenter bytes";
        hs.encrypt.apply(&mut up);
        dc_decrypt.apply(&mut up);
        assert_eq!(&up, b"proxy to datacenter bytes");

        let mut down = *b"datacenter to proxy bytes";
        dc_encrypt.apply(&mut down);
        hs.decrypt.apply(&mut down);
        assert_eq!(&down, b"datacenter to proxy bytes");
    }
}
