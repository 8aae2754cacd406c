//! Wire-level contract checks with a raw peer (no engine on the client
//! side): header shape on responses, notification silence, and
//! protocol-error close behavior on malformed bytes.

use tandem_protocol::{Header, Status, MAX_HEADER_LEN};
use tandem_test_utils::{install_test_tracing, start_stock_server, RawEvent, RawPeer};

/// WebSocket close code the engine uses for protocol violations.
const CLOSE_PROTOCOL: u16 = 1002;

async fn stock_raw_peer() -> RawPeer {
    let (_server, url, _log) = start_stock_server().await;
    RawPeer::connect(&url).await.expect("raw connect")
}

#[tokio::test]
async fn responses_echo_the_uid_and_never_carry_an_action_name() {
    install_test_tracing();
    let mut peer = stock_raw_peer().await;

    peer.send_request("Math/Sum", Some(7), &[2.into(), 3.into()])
        .await
        .unwrap();

    match peer.recv().await.unwrap() {
        RawEvent::Message { header, payload } => {
            assert_eq!(header.status, Status::Ok);
            assert_eq!(header.uid, Some(7));
            assert_eq!(header.action_name, None);
            assert_eq!(header.payload_length as usize, payload.len());
            let sum: i64 = serde_json::from_slice(&payload).unwrap();
            assert_eq!(sum, 5);
            // The serialized header stays inside the size cap.
            assert!(header.encode().unwrap().len() <= MAX_HEADER_LEN);
        }
        other => panic!("expected a response message, got {other:?}"),
    }
}

#[tokio::test]
async fn each_request_id_gets_exactly_one_response() {
    install_test_tracing();
    let mut peer = stock_raw_peer().await;

    peer.send_request("Math/Sum", Some(1), &[1.into(), 1.into()])
        .await
        .unwrap();
    peer.send_request("Math/Sum", Some(2), &[2.into(), 2.into()])
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        match peer.recv().await.unwrap() {
            RawEvent::Message { header, .. } => seen.push(header.uid),
            other => panic!("expected a response, got {other:?}"),
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![Some(1), Some(2)]);
}

#[tokio::test]
async fn notifications_produce_no_response_at_all() {
    install_test_tracing();
    let mut peer = stock_raw_peer().await;

    // No uid: the action runs but nothing comes back.
    peer.send_request("Home/VoidOneArg", None, &[123.into()])
        .await
        .unwrap();
    // A correlated request afterwards: the next response must belong to
    // it, proving the notification produced none.
    peer.send_request("Math/Sum", Some(9), &[4.into(), 5.into()])
        .await
        .unwrap();

    match peer.recv().await.unwrap() {
        RawEvent::Message { header, .. } => assert_eq!(header.uid, Some(9)),
        other => panic!("expected the Sum response, got {other:?}"),
    }
}

#[tokio::test]
async fn error_responses_carry_the_message_as_a_json_string() {
    install_test_tracing();
    let mut peer = stock_raw_peer().await;

    peer.send_request("Nope/Nope", Some(3), &[]).await.unwrap();

    match peer.recv().await.unwrap() {
        RawEvent::Message { header, payload } => {
            assert_eq!(header.status, Status::NotFound);
            assert_eq!(header.uid, Some(3));
            let message: String = serde_json::from_slice(&payload).unwrap();
            assert!(message.contains("Nope"), "message was {message:?}");
        }
        other => panic!("expected an error response, got {other:?}"),
    }
}

#[tokio::test]
async fn garbage_bytes_trigger_a_protocol_error_close() {
    install_test_tracing();
    let mut peer = stock_raw_peer().await;

    peer.send_bytes(vec![0xff, 0xff, 0xff, 0xff]).await.unwrap();

    let close = peer.recv_close().await.unwrap();
    let (code, _reason) = close.expect("close frame should carry a code");
    assert_eq!(code, CLOSE_PROTOCOL);
}

#[tokio::test]
async fn oversized_header_prefix_triggers_a_protocol_error_close() {
    install_test_tracing();
    let mut peer = stock_raw_peer().await;

    // varint(1000) as the header length, followed by padding.
    let mut bytes = vec![0xe8, 0x07];
    bytes.extend_from_slice(&[0u8; 64]);
    peer.send_bytes(bytes).await.unwrap();

    let close = peer.recv_close().await.unwrap();
    assert_eq!(close.expect("close frame").0, CLOSE_PROTOCOL);
}

#[tokio::test]
async fn payload_length_mismatch_triggers_a_protocol_error_close() {
    install_test_tracing();
    let mut peer = stock_raw_peer().await;

    let header = Header::request("Math/Sum".to_owned(), Some(1), 0);
    let mut message = tandem_protocol::encode_message(header, b"[]").unwrap();
    message.push(0xaa); // bytes the header does not account for
    peer.send_bytes(message).await.unwrap();

    let close = peer.recv_close().await.unwrap();
    assert_eq!(close.expect("close frame").0, CLOSE_PROTOCOL);
}

#[tokio::test]
async fn text_frames_are_rejected_as_protocol_errors() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let mut peer = RawPeer::connect(&url).await.unwrap();

    peer.send_text("{\"jsonrpc\":\"2.0\"}").await.unwrap();

    let close = peer.recv_close().await.unwrap();
    assert_eq!(close.expect("close frame").0, CLOSE_PROTOCOL);
}
