use slice_recorder::codec::{decode_packed24, decode_values, encode_packed24, encode_values, ByteOrder, DType};
use slice_recorder::Error;

#[test]
fn test_packed24_clamps_and_reports() {
    let packed = encode_packed24(&[9_000_000, -9_000_000, 5], ByteOrder::Lsb, true);
    assert_eq!(packed.clamped, vec![0, 1]);
    let decoded = decode_packed24(&packed.bytes, ByteOrder::Lsb, true).unwrap();
    assert_eq!(decoded, vec![8_388_607, -8_388_608, 5]);

    let unsigned = encode_packed24(&[-1, 16_777_216], ByteOrder::Msb, false);
    assert_eq!(unsigned.clamped, vec![0, 1]);
    assert_eq!(decode_packed24(&unsigned.bytes, ByteOrder::Msb, false).unwrap(), vec![0, 16_777_215]);
}

#[test]
fn test_packed24_rejects_ragged_input() {
    assert!(matches!(decode_packed24(&[1, 2, 3, 4], ByteOrder::Lsb, true), Err(Error::Codec(_))));
}

#[test]
fn test_big_endian_24bit_dtype() {
    let encoded = encode_values(&[1.0, -1.0], DType::I24Be);
    assert_eq!(encoded.bytes, vec![0x00, 0x00, 0x01, 0xFF, 0xFF, 0xFF]);
    assert_eq!(decode_values(&encoded.bytes, DType::I24Be).unwrap(), vec![1.0, -1.0]);
}

#[test]
fn test_fixed_width_types() {
    let cases: [(DType, &[f64]); 6] = [
        (DType::U8, &[0.0, 255.0]),
        (DType::I8, &[-128.0, 127.0]),
        (DType::U16, &[65_535.0]),
        (DType::I32, &[-2_000_000_000.0, 7.0]),
        (DType::F32, &[0.25, -1.5]),
        (DType::F64, &[0.1, 1e300]),
    ];
    for (dtype, values) in cases {
        let encoded = encode_values(values, dtype);
        assert_eq!(encoded.clamped, 0, "{}", dtype);
        assert_eq!(encoded.bytes.len(), values.len() * dtype.size(), "{}", dtype);
        assert_eq!(decode_values(&encoded.bytes, dtype).unwrap(), values, "{}", dtype);
    }
}

#[test]
fn test_encode_clamps_integral_overflow() {
    let encoded = encode_values(&[-5.0, 70_000.0], DType::U16);
    assert_eq!(encoded.clamped, 2);
    assert_eq!(decode_values(&encoded.bytes, DType::U16).unwrap(), vec![0.0, 65_535.0]);
}

#[test]
fn test_decode_rejects_partial_sample() {
    assert!(matches!(decode_values(&[0, 0, 0], DType::U16), Err(Error::Codec(_))));
}

#[test]
fn test_dtype_names() {
    assert_eq!(serde_json::to_string(&DType::I24Be).unwrap(), "\"i24_be\"");
    assert_eq!(serde_json::from_str::<DType>("\"u24\"").unwrap(), DType::U24);
    assert_eq!(DType::U24Be.to_string(), "u24_be");
}
