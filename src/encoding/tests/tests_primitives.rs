//! Round-trip coverage for the primitive wire formats.

use crate::encoding::*;

fn round_trip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: T) {
    let bytes = encode_to_vec(&value).unwrap();
    let (decoded, consumed) = decode_from_slice::<T>(&bytes).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(consumed, bytes.len(), "decoder must consume exactly what was written");
}

#[test]
fn u8_round_trip() {
    round_trip(0u8);
    round_trip(0x7Fu8);
    round_trip(u8::MAX);
}

#[test]
fn u32_round_trip() {
    round_trip(0u32);
    round_trip(1u32);
    round_trip(u32::MAX);
}

#[test]
fn u64_round_trip() {
    round_trip(0u64);
    round_trip(u64::MAX);
    round_trip(0xDEAD_BEEF_CAFE_BABEu64);
}

#[test]
fn u64_is_little_endian() {
    let bytes = encode_to_vec(&0x0102_0304_0506_0708u64).unwrap();
    assert_eq!(bytes, vec![0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
}

#[test]
fn bool_round_trip() {
    round_trip(true);
    round_trip(false);
}

#[test]
fn bool_rejects_garbage() {
    assert!(matches!(
        bool::decode_from(&[0x02]),
        Err(EncodingError::InvalidBool(0x02))
    ));
}

#[test]
fn digest_round_trip() {
    let mut digest = [0u8; 32];
    for (i, byte) in digest.iter_mut().enumerate() {
        *byte = i as u8;
    }
    round_trip(digest);
}

#[test]
fn bytes_round_trip() {
    round_trip(Vec::<u8>::new());
    round_trip(b"hello".to_vec());
    round_trip(vec![0u8; 10_000]);
}

#[test]
fn string_round_trip() {
    round_trip(String::new());
    round_trip("sstable-000001".to_string());
    round_trip("zażółć gęślą jaźń".to_string());
}

#[test]
fn string_rejects_invalid_utf8() {
    // Length prefix 2, then an invalid UTF-8 sequence.
    let bytes = vec![0x02, 0x00, 0x00, 0x00, 0xFF, 0xFE];
    assert!(matches!(
        String::decode_from(&bytes),
        Err(EncodingError::InvalidUtf8(_))
    ));
}

#[test]
fn option_round_trip() {
    round_trip(Option::<u64>::None);
    round_trip(Some(42u64));
    round_trip(Some(b"value".to_vec()));
}

#[test]
fn option_rejects_unknown_tag() {
    assert!(matches!(
        Option::<u64>::decode_from(&[0x07]),
        Err(EncodingError::InvalidTag { .. })
    ));
}

#[test]
fn vec_helpers_round_trip() {
    let items: Vec<u64> = (0..100).collect();
    let mut buf = Vec::new();
    encode_vec(&items, &mut buf).unwrap();
    let (decoded, consumed) = decode_vec::<u64>(&buf).unwrap();
    assert_eq!(decoded, items);
    assert_eq!(consumed, buf.len());
}

#[test]
fn truncated_input_reports_eof() {
    let bytes = encode_to_vec(&0xAABBCCDDu32).unwrap();
    assert!(matches!(
        u32::decode_from(&bytes[..2]),
        Err(EncodingError::UnexpectedEof { .. })
    ));
}

#[test]
fn multiple_values_decode_sequentially() {
    let mut buf = Vec::new();
    7u64.encode_to(&mut buf).unwrap();
    b"key".to_vec().encode_to(&mut buf).unwrap();
    true.encode_to(&mut buf).unwrap();

    let mut offset = 0;
    let (a, n) = u64::decode_from(&buf[offset..]).unwrap();
    offset += n;
    let (b, n) = Vec::<u8>::decode_from(&buf[offset..]).unwrap();
    offset += n;
    let (c, n) = bool::decode_from(&buf[offset..]).unwrap();
    offset += n;

    assert_eq!(a, 7);
    assert_eq!(b, b"key");
    assert!(c);
    assert_eq!(offset, buf.len());
}
