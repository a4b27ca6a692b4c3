//! Integration tests exercising `netframe_proto`'s public API end-to-end:
//! encode/decode, codec transforms, and the literal scenarios from the
//! packet protocol's wire-format description.

use netframe_proto::{
    CipherAlgo, CompressionAlgo, Flags, HeaderLayout, Opcode, Packet, PacketCodec, Priority, Transport,
};
use proptest::prelude::*;

fn arbitrary_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..1024)
}

proptest! {
    #[test]
    fn encode_then_decode_preserves_payload_and_header_fields(
        opcode in any::<u16>(),
        priority in 0u8..4,
        transport in 0u8..3,
        payload in arbitrary_payload(),
    ) {
        let packet = Packet::modern(
            Opcode::new(opcode),
            Flags::empty(),
            Priority::from_u8(priority),
            Transport::from_u8(transport),
            payload.clone(),
        )
        .expect("fits within wire limit");

        let bytes = packet.encode().expect("encodes");
        let decoded = Packet::decode(&bytes, HeaderLayout::Modern).expect("decodes");

        prop_assert_eq!(decoded.payload.as_ref(), payload.as_slice());
        prop_assert_eq!(decoded.header.opcode(), Opcode::new(opcode));
    }

    #[test]
    fn compress_then_decompress_round_trips(payload in prop::collection::vec(any::<u8>(), 300..2048)) {
        let codec = PacketCodec::new(CompressionAlgo::Lz4, 64);
        let packet = Packet::modern(Opcode::new(1), Flags::empty(), Priority::Normal, Transport::Tcp, payload.clone())
            .expect("fits");
        let compressed = codec.compress(packet).expect("compresses");
        let restored = codec.decompress(compressed).expect("decompresses");
        prop_assert_eq!(restored.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn chacha_encrypt_then_decrypt_round_trips(payload in arbitrary_payload()) {
        let key = [0x7Au8; 32];
        let packet = Packet::modern(Opcode::new(1), Flags::empty(), Priority::Normal, Transport::Tcp, payload.clone())
            .expect("fits");
        let encrypted = PacketCodec::encrypt(packet, &key, CipherAlgo::ChaCha20Poly1305).expect("encrypts");
        prop_assert!(encrypted.header.flags().contains(Flags::ENCRYPTED));
        let decrypted = PacketCodec::decrypt(encrypted, &key, CipherAlgo::ChaCha20Poly1305).expect("decrypts");
        prop_assert_eq!(decrypted.payload.as_ref(), payload.as_slice());
    }
}

#[test]
fn scenario_one_modern_header_and_length() {
    // magic=0x4E584C58, opcode=0x0101, flags=0, priority=1, transport=1,
    // payload=[0xDE, 0xAD, 0xBE, 0xEF] -> 15-byte buffer, length bytes at
    // offset 6 equal 0x0F, 0x00.
    let packet = Packet::modern(
        Opcode::new(0x0101),
        Flags::empty(),
        Priority::from_u8(1),
        Transport::from_u8(1),
        vec![0xDE, 0xAD, 0xBE, 0xEF],
    )
    .expect("fits");

    let bytes = packet.encode().expect("encodes");
    assert_eq!(bytes.len(), 15);
    assert_eq!(&bytes[6..8], &[0x0F, 0x00]);

    let decoded = Packet::decode(&bytes, HeaderLayout::Modern).expect("decodes");
    assert_eq!(decoded.payload.as_ref(), &[0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn scenario_three_handler_reply_is_utf8_pong() {
    // A handler for opcode 0x0101 returning the string "pong" serializes to
    // its UTF-8 bytes as the reply packet's payload.
    let reply = "pong".to_string();
    let packet = Packet::modern(
        Opcode::new(0x0101),
        Flags::empty(),
        Priority::Normal,
        Transport::Tcp,
        reply.into_bytes(),
    )
    .expect("fits");
    assert_eq!(packet.payload.as_ref(), &[0x70, 0x6F, 0x6E, 0x67]);
}

#[test]
fn scenario_five_aes_gcm_encrypts_hello() {
    let key = [0x5Au8; 32];
    let packet = Packet::modern(Opcode::new(1), Flags::empty(), Priority::Normal, Transport::Tcp, b"hello".to_vec())
        .expect("fits");
    let encrypted = PacketCodec::encrypt(packet, &key, CipherAlgo::Aes256Gcm).expect("encrypts");
    assert_ne!(encrypted.payload.as_ref(), b"hello");
    let decrypted = PacketCodec::decrypt(encrypted, &key, CipherAlgo::Aes256Gcm).expect("decrypts");
    assert_eq!(decrypted.payload.as_ref(), b"hello");
}

#[test]
fn legacy_layout_with_checksum_round_trips() {
    let payload = b"legacy payload".to_vec();
    let packet = Packet::legacy(Opcode::new(42), Flags::empty(), Priority::High, 3, None, payload.clone())
        .expect("fits");
    let crc = PacketCodec::checksum(&packet);
    let stamped = Packet::legacy(Opcode::new(42), Flags::empty(), Priority::High, 3, Some(crc), payload.clone())
        .expect("fits");

    let bytes = stamped.encode().expect("encodes");
    let decoded = Packet::decode(&bytes, HeaderLayout::Legacy { with_checksum: true }).expect("decodes");
    assert_eq!(decoded.payload.as_ref(), payload.as_slice());
    assert!(PacketCodec::verify_checksum(&decoded));
}

#[test]
fn sign_verify_and_strip_chain() {
    let packet = Packet::modern(Opcode::new(9), Flags::empty(), Priority::Normal, Transport::Tcp, b"body".to_vec())
        .expect("fits");
    let original_payload = packet.payload.clone();

    let signed = PacketCodec::sign(packet).expect("signs");
    assert!(PacketCodec::verify(&signed).expect("verifies"));

    let stripped = PacketCodec::strip_signature(signed).expect("strips");
    assert_eq!(stripped.payload, original_payload);
    assert!(!stripped.header.flags().contains(Flags::SIGNED));
}
