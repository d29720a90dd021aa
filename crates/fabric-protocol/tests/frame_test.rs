// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Frame encoding/decoding tests for fabric-protocol.

use fabric_protocol::frame::{FrameError, HEADER_SIZE, MAX_FRAME_SIZE, ProtocolBuffer, read_message};
use fabric_protocol::messages::{IndexResponse, RequestHeader, ResponseHeader};
use proptest::prelude::*;

/// Opaque payload wrapper.
#[derive(Clone, PartialEq, prost::Message)]
struct Blob {
    #[prost(bytes = "vec", tag = "1")]
    data: Vec<u8>,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_serialize_then_parse_returns_payload(
        data in prop::collection::vec(any::<u8>(), 0..=1024 * 1024)
    ) {
        let blob = Blob { data };
        let mut buf = ProtocolBuffer::new(0);
        buf.serialize(&blob).unwrap();

        let len = buf.parse_length().unwrap();
        prop_assert_eq!(buf.size(), HEADER_SIZE + len);
        let parsed: Blob = buf.parse(len).unwrap();
        prop_assert_eq!(parsed, blob);
    }
}

#[test]
fn test_header_then_body_in_one_buffer() {
    let header = ResponseHeader { id: "abc".into() };
    let body = IndexResponse {
        data: b"1\t2\t3\n".to_vec(),
        ..Default::default()
    };
    let mut buf = ProtocolBuffer::new(64);
    buf.serialize(&header).unwrap();
    let after_header = buf.size();
    buf.serialize(&body).unwrap();
    assert!(buf.size() > after_header);

    // The first frame parses in place.
    let len = buf.parse_length().unwrap();
    assert_eq!(buf.parse::<ResponseHeader>(len).unwrap(), header);
}

#[tokio::test]
async fn test_read_message_rejects_oversized_frame() {
    let bytes = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
    let mut reader: &[u8] = &bytes;
    let mut buf = ProtocolBuffer::new(0);
    let result = read_message::<RequestHeader, _>(&mut reader, &mut buf).await;
    assert!(matches!(result, Err(FrameError::FrameTooLarge(_))));
}

#[tokio::test]
async fn test_read_message_truncated_payload_is_io_error() {
    let mut bytes = 10u32.to_be_bytes().to_vec();
    bytes.extend_from_slice(&[0u8; 3]);
    let mut reader: &[u8] = &bytes;
    let mut buf = ProtocolBuffer::new(0);
    let result = read_message::<RequestHeader, _>(&mut reader, &mut buf).await;
    assert!(matches!(result, Err(FrameError::Io(_))));
}

#[tokio::test]
async fn test_read_message_decode_error() {
    // Field 1 declared as a 5-byte string but only 1 byte follows.
    let payload = [0x0a, 0x05, b'a'];
    let mut bytes = (payload.len() as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(&payload);
    let mut reader: &[u8] = &bytes;
    let mut buf = ProtocolBuffer::new(0);
    let result = read_message::<RequestHeader, _>(&mut reader, &mut buf).await;
    assert!(matches!(result, Err(FrameError::Decode(_))));
}
