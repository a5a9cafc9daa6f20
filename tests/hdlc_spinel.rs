use silabs_flasher::spinel::{decode_frame, decode_packed_uint21, encode_packed_uint21, hdlc_serialize, SpinelFrame, CommandId};

#[test]
fn test_hdlc_roundtrip_through_decode_frame() {
    let payload = vec![0x01, 0x02, 0x03];
    let framed = hdlc_serialize(&payload);

    let (decoded, consumed) = decode_frame(&framed).unwrap().unwrap();
    assert_eq!(decoded, payload);
    assert_eq!(consumed, framed.len());
}

#[test]
fn test_hdlc_decode_finds_frame_after_leading_garbage() {
    let payload = vec![0xAA, 0xBB];
    let mut framed = vec![0x00, 0x01, 0x02];
    framed.extend(hdlc_serialize(&payload));

    let (decoded, consumed) = decode_frame(&framed).unwrap().unwrap();
    assert_eq!(decoded, payload);
    assert_eq!(consumed, framed.len());
}

#[test]
fn test_hdlc_decode_rejects_corrupted_crc() {
    let payload = vec![0x10, 0x20, 0x30];
    let mut framed = hdlc_serialize(&payload);

    // Flip a payload byte without touching the trailing CRC.
    let mutate_at = 1;
    framed[mutate_at] ^= 0xFF;

    assert!(decode_frame(&framed).unwrap_err().to_string().contains("CRC"));
}

#[test]
fn test_hdlc_decode_returns_none_on_incomplete_frame() {
    let payload = vec![0x01, 0x02];
    let framed = hdlc_serialize(&payload);

    assert!(decode_frame(&framed[..framed.len() - 1]).unwrap().is_none());
}

#[test]
fn test_packed_uint21_multi_byte_values() {
    for value in [200u32, 16_383, 16_384, 2_097_151] {
        let encoded = encode_packed_uint21(value);
        assert!(encoded.len() > 1);
        let (decoded, consumed) = decode_packed_uint21(&encoded).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, encoded.len());
    }
}

#[test]
fn test_spinel_frame_rejects_bad_header_flag_bits() {
    // Top two bits must be 0b10; 0b00 here is invalid.
    let raw = vec![0b0000_0011, 0x02];
    let err = SpinelFrame::parse(&raw).unwrap_err();
    assert!(err.to_string().contains("0b10"));
}

#[test]
fn test_spinel_frame_roundtrip_preserves_network_link_id() {
    let frame = SpinelFrame {
        transaction_id: 7,
        network_link_id: 2,
        command: CommandId::PropValueSet,
        payload: vec![0xDE, 0xAD],
    };

    let parsed = SpinelFrame::parse(&frame.serialize()).unwrap();
    assert_eq!(parsed.transaction_id, 7);
    assert_eq!(parsed.network_link_id, 2);
    assert_eq!(parsed.command, CommandId::PropValueSet);
    assert_eq!(parsed.payload, vec![0xDE, 0xAD]);
}
