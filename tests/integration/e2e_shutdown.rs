//! Graceful-shutdown state machine: drain of in-flight calls, rejection
//! of late calls, forced drain on timeout, idempotent repeat shutdowns,
//! and disconnect-event delivery (including late subscription).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_rpc::{RpcClient, RpcError, ShutdownSummary};
use tandem_test_utils::{install_test_tracing, start_stock_server};

#[tokio::test]
async fn graceful_drain_resolves_every_in_flight_call() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);
    let conn = client.connect().await.unwrap();

    // Put a burst of slow calls in flight before requesting shutdown.
    let mut handles = Vec::new();
    for i in 0..20i64 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move {
            conn.call::<i64>("Home/SlowEcho", (150u64, i)).await
        }));
    }
    // Let every call reach the outbound queue.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let reason = conn.shutdown(Duration::from_secs(5), "bye").await;
    assert!(reason.graceful, "close reason was {reason:?}");
    assert_eq!(reason.reason.as_deref(), Some("bye"));

    for (i, handle) in handles.into_iter().enumerate() {
        let value = handle
            .await
            .unwrap()
            .unwrap_or_else(|e| panic!("call {i} failed during graceful drain: {e}"));
        assert_eq!(value, i as i64);
    }
}

#[tokio::test]
async fn calls_after_shutdown_fail_with_the_reason() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);
    let conn = client.connect().await.unwrap();

    client.shutdown(Duration::from_secs(2), "bye").await;

    // Both the drained connection and the parked client reject new calls
    // with the recorded reason.
    let err = conn.call::<i64>("Math/Sum", (1, 2)).await.unwrap_err();
    assert_eq!(
        err,
        RpcError::WasShutdown {
            reason: "bye".to_owned()
        }
    );
    let err = client.call::<i64>("Math/Sum", (1, 2)).await.unwrap_err();
    assert_eq!(
        err,
        RpcError::WasShutdown {
            reason: "bye".to_owned()
        }
    );
}

#[tokio::test]
async fn connection_shutdown_alone_lets_the_client_redial() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);
    let conn = client.connect().await.unwrap();
    let first_id = conn.id().to_owned();

    conn.shutdown(Duration::from_secs(2), "bye").await;

    // Each reconnect is a fresh session.
    let sum: i64 = client.call("Math/Sum", (2, 2)).await.unwrap();
    assert_eq!(sum, 4);
    let fresh = client.current_connection().expect("redialed connection");
    assert_ne!(fresh.id(), first_id);
}

#[tokio::test]
async fn forced_drain_fails_stragglers_with_was_shutdown() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);
    let conn = client.connect().await.unwrap();

    // This call cannot finish inside the drain window.
    let straggler = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.call::<i64>("Home/SlowEcho", (30_000u64, 1)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let reason = conn.shutdown(Duration::from_millis(200), "deadline").await;
    assert_eq!(reason.reason.as_deref(), Some("deadline"));

    let err = straggler.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        RpcError::WasShutdown {
            reason: "deadline".to_owned()
        }
    );
}

#[tokio::test]
async fn disconnect_event_fires_exactly_once_and_late_subscribers_see_it() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);
    let conn = client.connect().await.unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    conn.on_disconnected(move |reason| {
        assert!(reason.graceful);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    conn.shutdown(Duration::from_secs(2), "bye").await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Late subscription after closure fires synchronously, exactly once.
    let late = Arc::new(AtomicUsize::new(0));
    let counter = late.clone();
    conn.on_disconnected(move |reason| {
        assert_eq!(reason.reason.as_deref(), Some("bye"));
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(late.load(Ordering::SeqCst), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeat_connection_shutdowns_share_the_first_reason() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);
    let conn = client.connect().await.unwrap();

    let first = conn.shutdown(Duration::from_secs(2), "first").await;
    let second = conn.shutdown(Duration::from_secs(2), "second").await;
    assert_eq!(first.reason.as_deref(), Some("first"));
    assert_eq!(second.reason.as_deref(), Some("first"));
}

#[tokio::test]
async fn client_shutdown_without_a_connection_reports_no_connection() {
    install_test_tracing();
    let client = RpcClient::new("ws://127.0.0.1:1");
    let summary = client.shutdown(Duration::from_secs(1), "bye").await;
    assert!(matches!(summary, ShutdownSummary::NoConnectionGracefully));
}

#[tokio::test]
async fn client_shutdown_drains_the_live_connection() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);
    client.connect().await.unwrap();

    let summary = client.shutdown(Duration::from_secs(2), "bye").await;
    match summary {
        ShutdownSummary::Connection(reason) => {
            assert!(reason.graceful);
            assert_eq!(reason.reason.as_deref(), Some("bye"));
        }
        other => panic!("expected a drained connection, got {other:?}"),
    }
    assert!(client.current_connection().is_none());
}

#[tokio::test]
async fn server_shutdown_drains_every_client() {
    install_test_tracing();
    let (server, url, _log) = start_stock_server().await;
    let first = RpcClient::new(&url);
    let second = RpcClient::new(&url);
    let conn_a = first.connect().await.unwrap();
    let conn_b = second.connect().await.unwrap();

    server.shutdown(Duration::from_secs(2), "maintenance").await;

    let reason_a = conn_a.closed().await;
    let reason_b = conn_b.closed().await;
    assert!(reason_a.graceful);
    assert!(reason_b.graceful);
    assert!(first.current_connection().is_none());
    assert!(second.current_connection().is_none());
}
