//! End-to-end call/response pipeline: dialer -> listener -> dialer.
//!
//! Covers the dispatch pipeline surface:
//! - typed round trip (`Math/Sum`)
//! - bare action names defaulting to the `Home` controller
//! - case-insensitive action matching
//! - `NotFound`, argument arity, argument type, and internal-error mapping
//! - notifications running without a response

use std::time::Duration;
use tandem_rpc::{
    ActionMarkers, ActionResult, ControllerRegistry, RpcClient, RpcError, SingletonScopes, Status,
};
use tandem_test_utils::{install_test_tracing, start_server_with, start_stock_server};

#[tokio::test]
async fn echo_sum_round_trips() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    let sum: i64 = client.call("Math/Sum", (2, 3)).await.unwrap();
    assert_eq!(sum, 5);

    client.shutdown(Duration::from_secs(1), "done").await;
}

#[tokio::test]
async fn bare_action_name_defaults_to_home_controller() {
    install_test_tracing();
    let (_server, url, log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    client.call_void("VoidOneArg", (123,)).await.unwrap();
    assert_eq!(log.entries(), vec!["VoidOneArg(123)".to_owned()]);
}

#[tokio::test]
async fn action_matching_is_case_insensitive() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    let sum: i64 = client.call("Math/sum", (10, 20)).await.unwrap();
    assert_eq!(sum, 30);
    let sum: i64 = client.call("Math/SUM", (1, 1)).await.unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn unknown_action_returns_not_found_naming_it() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    let err = client.call::<i64>("Nope/Nope", ()).await.unwrap_err();
    match err {
        RpcError::Application { status, message } => {
            assert_eq!(status, Status::NotFound);
            assert!(message.contains("Nope"), "message was {message:?}");
        }
        other => panic!("expected Application error, got {other:?}"),
    }
}

#[tokio::test]
async fn argument_count_mismatch_is_a_bad_request() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    let err = client.call::<i64>("Math/Sum", (2,)).await.unwrap_err();
    assert_eq!(
        err,
        RpcError::Application {
            status: Status::BadRequest,
            message: "Argument count mismatch.".to_owned(),
        }
    );
}

#[tokio::test]
async fn argument_type_mismatch_is_a_bad_request() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    let err = client
        .call::<i64>("Math/Sum", ("two", "three"))
        .await
        .unwrap_err();
    match err {
        RpcError::Application { status, message } => {
            assert_eq!(status, Status::BadRequest);
            assert!(message.contains("argument 1"), "message was {message:?}");
        }
        other => panic!("expected Application error, got {other:?}"),
    }
}

#[tokio::test]
async fn controller_failures_are_masked_as_internal_server_error() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    let err = client.call::<i64>("Home/Fail", ()).await.unwrap_err();
    assert_eq!(
        err,
        RpcError::Application {
            status: Status::InternalError,
            message: "Internal Server Error".to_owned(),
        }
    );
}

#[tokio::test]
async fn bad_request_failures_keep_their_message() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    let err = client
        .call::<i64>("Home/Reject", ("quota exceeded",))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RpcError::Application {
            status: Status::BadRequest,
            message: "quota exceeded".to_owned(),
        }
    );
}

#[tokio::test]
async fn notifications_run_without_a_response() {
    install_test_tracing();
    let (_server, url, log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    client.notify("Home/Log", ("first",)).await.unwrap();
    client.notify("Home/Log", ("second",)).await.unwrap();
    assert!(
        log.wait_for(2, Duration::from_secs(2)).await,
        "notifications never reached the controller"
    );
    assert_eq!(
        log.entries(),
        vec!["Log(first)".to_owned(), "Log(second)".to_owned()]
    );

    // The connection still serves ordinary calls afterwards.
    let sum: i64 = client.call("Math/Sum", (4, 4)).await.unwrap();
    assert_eq!(sum, 8);
}

#[tokio::test]
async fn binary_result_actions_set_the_protobuf_encoding() {
    install_test_tracing();

    struct BlobController;
    let mut registry = ControllerRegistry::new();
    registry
        .controller::<BlobController>("Blob")
        .allow_anonymous()
        .action_raw("Fetch", 0, ActionMarkers::default(), |_c, _ctx, _args| async move {
            Ok(ActionResult::protobuf(vec![0x08, 0x96, 0x01]))
        });
    let (_server, url) = start_server_with(
        registry,
        SingletonScopes::new().insert("Blob", BlobController),
    )
    .await;

    let client = RpcClient::new(&url);
    let conn = client.connect().await.unwrap();

    let envelope = conn.call_raw("Blob/Fetch", Vec::new()).await.unwrap();
    assert_eq!(envelope.status, Status::Ok);
    assert_eq!(envelope.encoding.as_deref(), Some("protobuf"));
    assert_eq!(envelope.payload, vec![0x08, 0x96, 0x01]);

    // The typed surface refuses to decode a binary payload as JSON.
    let err = conn.call::<i64>("Blob/Fetch", ()).await.unwrap_err();
    assert!(matches!(err, RpcError::Protocol(_)));
}

#[tokio::test]
async fn concurrent_calls_all_correlate() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);
    let conn = client.connect().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..50i64 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move {
            let sum: i64 = conn.call("Math/Sum", (i, 1)).await.unwrap();
            (i, sum)
        }));
    }
    for handle in handles {
        let (i, sum) = handle.await.unwrap();
        assert_eq!(sum, i + 1);
    }
}
