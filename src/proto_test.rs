use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_frame_header() {
    let hdr = FrameHeader {
        cmd: 16,
        flags: FRAME_FFIRST | FRAME_FSTREAM,
        seqno: 42,
        frame_bsize: 128,
        msg_bsize: 4096,
        cmd_timestamp: 1_700_000_000_000,
    };
    let mut buf = vec![];
    hdr.encode(&mut buf);
    assert_eq!(buf.len(), FrameHeader::SIZE);
    assert_eq!(FrameHeader::decode(&buf).unwrap(), hdr);

    assert!(matches!(
        FrameHeader::decode(&buf[..10]),
        Err(crate::Error::OutOfBuffer(_, _))
    ));
}

#[test]
fn test_value_round_trip() {
    let values = vec![
        Value::Null,
        Value::Error { code: -7, message: Some("not found".to_string()) },
        Value::Error { code: -1, message: None },
        Value::Double(2.5),
        Value::LongLong(-9000),
        Value::str("hello"),
        Value::Array(vec![
            Value::LongLong(1),
            Value::Array(vec![Value::str("nested"), Value::Null]),
        ]),
        Value::End,
    ];
    let buf = encode_values(&values);
    assert_eq!(decode_values(&buf).unwrap(), values);
}

#[test]
fn test_truncated_payloads() {
    let buf = encode_values(&[Value::str("some string payload")]);
    for cut in 1..buf.len() {
        assert!(decode_values(&buf[..cut]).is_err(), "cut {}", cut);
    }
    assert!(decode_values(&[9_u8]).is_err());
}

#[test]
fn test_postponed_length_array() {
    // begin(postponed) 1 2 end
    let mut buf = vec![TAG_ARRAY];
    buf.extend_from_slice(&u32::MAX.to_le_bytes());
    Value::LongLong(1).encode(&mut buf);
    Value::LongLong(2).encode(&mut buf);
    buf.push(TAG_ARRAY_END);
    let values = decode_values(&buf).unwrap();
    assert_eq!(values, vec![Value::Array(vec![Value::LongLong(1), Value::LongLong(2)])]);

    // a stray end marker is rejected
    assert!(decode_values(&[TAG_ARRAY_END]).is_err());
}

#[test]
fn test_deflate_string() {
    let seed: u128 = random();
    println!("test_deflate_string seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed as u64);

    let data: Vec<u8> = (0..4096).map(|_| *b"abcd".get(rng.gen_range(0..4)).unwrap()).collect();
    let v = Value::deflated(&data).unwrap();
    match &v {
        Value::String { flags, data: z } => {
            assert!((flags & STRING_FDEFLATE) != 0);
            assert!(z.len() < data.len());
        }
        _ => panic!("expected a string value"),
    }
    assert_eq!(v.to_data().unwrap(), data);
    // deflated strings are not directly str-addressable
    assert!(v.as_str().is_err());

    let buf = encode_values(&[v.clone()]);
    assert_eq!(decode_values(&buf).unwrap(), vec![v]);
}

#[test]
fn test_value_conversions() {
    assert_eq!(Value::str("42").to_long_long().unwrap(), 42);
    assert_eq!(Value::LongLong(7).to_long_long().unwrap(), 7);
    assert_eq!(Value::str("1.5").to_double().unwrap(), 1.5);
    assert_eq!(Value::LongLong(2).to_double().unwrap(), 2.0);
    assert_eq!(Value::Double(0.5).to_double().unwrap(), 0.5);
    assert!(Value::Null.to_long_long().is_err());
    assert!(Value::str("x").to_long_long().is_err());

    let err = crate::Error::NotFound("here".to_string(), "gone".to_string());
    match Value::from_err(&err) {
        Value::Error { code, message } => {
            assert_eq!(code, -7);
            assert!(message.unwrap().contains("gone"));
        }
        _ => panic!("expected an error value"),
    }

    assert_eq!(HEARTBEAT, b"boum");
}
