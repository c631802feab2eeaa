use courier_tl::mtproto::{BadServerSalt, MsgsAck, ServerDhParams, ServerDhParamsOk};
use courier_tl::{Cursor, Deserializable, Serializable};

// ── bytes ────────────────────────────────────────────────────────────────────

#[test]
fn short_bytes_are_padded_to_four() {
    let bytes = vec![1u8, 2, 3, 4, 5].to_bytes();
    assert_eq!(bytes, [5, 1, 2, 3, 4, 5, 0, 0]);
}

#[test]
fn long_bytes_use_wide_header() {
    let data = vec![0xAAu8; 300];
    let bytes = data.to_bytes();
    assert_eq!(&bytes[..4], &[0xfe, 0x2c, 0x01, 0x00]);
    assert_eq!(bytes.len() % 4, 0);
    assert_eq!(Vec::<u8>::from_bytes(&bytes).unwrap(), data);
}

#[test]
fn truncated_bytes_report_eof() {
    // declares 10 bytes but carries 3
    let err = Vec::<u8>::from_bytes(&[10, 1, 2, 3]).unwrap_err();
    assert_eq!(err, courier_tl::deserialize::Error::UnexpectedEof);
}

// ── service constructors ─────────────────────────────────────────────────────

#[test]
fn msgs_ack_layout() {
    let bytes = MsgsAck { msg_ids: vec![7, 9] }.to_bytes();
    assert_eq!(&bytes[..4], &0x62d6b459u32.to_le_bytes());
    assert_eq!(&bytes[4..8], &0x1cb5c415u32.to_le_bytes());
    assert_eq!(&bytes[8..12], &2i32.to_le_bytes());
    assert_eq!(bytes.len(), 12 + 16);
}

#[test]
fn server_dh_params_picks_variant_by_id() {
    let ok = ServerDhParamsOk { nonce: [3; 16], server_nonce: [4; 16], encrypted_answer: vec![0; 32] };
    let parsed = ServerDhParams::from_bytes(&ok.to_bytes()).unwrap();
    assert_eq!(parsed, ServerDhParams::Ok(ok));
}

#[test]
fn cursor_stops_after_one_value() {
    let salt = BadServerSalt { bad_msg_id: 10, bad_msg_seqno: 1, error_code: 48, new_server_salt: -5 };
    let mut bytes = salt.to_bytes();
    bytes.extend(0xffu32.to_le_bytes());

    let mut cursor = Cursor::from_slice(&bytes);
    assert_eq!(BadServerSalt::deserialize(&mut cursor).unwrap(), salt);
    assert_eq!(cursor.remaining(), 4);
    assert_eq!(cursor.peek_u32().unwrap(), 0xff);
}
