//! Authentication flow: the reserved `SignIn`/`SignOut` actions, the
//! permission policy, token expiry, and automatic sign-in on connect.

use chrono::Duration as Validity;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tandem_rpc::{
    Principal, RpcClient, RpcError, SignedTokenVault, Status, TokenVault,
};
use tandem_test_utils::{install_test_tracing, start_stock_server, TEST_VAULT_KEY};

fn test_vault() -> SignedTokenVault {
    SignedTokenVault::new(TEST_VAULT_KEY.to_vec())
}

fn valid_token() -> Vec<u8> {
    test_vault()
        .issue(&Principal::named("alice"), Validity::minutes(5))
        .expect("token issue")
}

fn expired_token() -> Vec<u8> {
    test_vault()
        .issue(&Principal::named("alice"), Validity::seconds(-30))
        .expect("token issue")
}

fn assert_unauthorized(err: &RpcError) {
    match err {
        RpcError::Application { status, message } => {
            assert_eq!(*status, Status::Unauthorized);
            assert!(
                message.contains("Secret/Ping"),
                "message should name the action, was {message:?}"
            );
        }
        other => panic!("expected Unauthorized, got {other:?}"),
    }
}

#[tokio::test]
async fn guarded_action_requires_sign_in() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    let err = client.call::<String>("Secret/Ping", ()).await.unwrap_err();
    assert_unauthorized(&err);
    assert!(!client.is_authenticated());

    client.sign_in(&valid_token()).await.unwrap();
    assert!(client.is_authenticated());
    let pong: String = client.call("Secret/Ping", ()).await.unwrap();
    assert_eq!(pong, "pong");
}

#[tokio::test]
async fn expired_token_is_rejected_and_principal_stays_anonymous() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    let err = client.sign_in(&expired_token()).await.unwrap_err();
    assert_eq!(
        err,
        RpcError::Application {
            status: Status::BadRequest,
            message: "token expired".to_owned(),
        }
    );
    assert!(!client.is_authenticated());
    let err = client.call::<String>("Secret/Ping", ()).await.unwrap_err();
    assert_unauthorized(&err);
}

#[tokio::test]
async fn garbage_token_is_rejected_as_invalid() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    let err = client.sign_in(b"not a real token").await.unwrap_err();
    assert_eq!(
        err,
        RpcError::Application {
            status: Status::BadRequest,
            message: "token invalid".to_owned(),
        }
    );
}

#[tokio::test]
async fn sign_out_restores_the_anonymous_principal() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    client.sign_in(&valid_token()).await.unwrap();
    let pong: String = client.call("Secret/Ping", ()).await.unwrap();
    assert_eq!(pong, "pong");

    client.sign_out().await.unwrap();
    assert!(!client.is_authenticated());
    let err = client.call::<String>("Secret/Ping", ()).await.unwrap_err();
    assert_unauthorized(&err);
}

#[tokio::test]
async fn anonymous_actions_stay_callable_while_signed_out() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;
    let client = RpcClient::new(&url);

    let sum: i64 = client.call("Math/Sum", (1, 2)).await.unwrap();
    assert_eq!(sum, 3);
}

#[tokio::test]
async fn listener_fires_on_authenticated_with_the_new_principal() {
    install_test_tracing();
    let (server, url, _log) = start_stock_server().await;

    let hits = Arc::new(AtomicUsize::new(0));
    let observed = hits.clone();
    server.on_connected(move |conn| {
        let observed = observed.clone();
        conn.on_authenticated(move |principal| {
            assert_eq!(principal.name.as_deref(), Some("alice"));
            observed.fetch_add(1, Ordering::SeqCst);
        });
    });

    let client = RpcClient::new(&url);
    client.sign_in(&valid_token()).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // The listener-side connection now reports the authenticated principal.
    let listener_conn = server.connections().pop().expect("one live connection");
    assert!(listener_conn.is_authenticated());
    assert_eq!(listener_conn.principal().name.as_deref(), Some("alice"));
}

#[tokio::test]
async fn token_producer_signs_in_automatically_on_connect() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;

    let invocations = Arc::new(AtomicUsize::new(0));
    let counted = invocations.clone();
    let client = RpcClient::builder(&url)
        .token_producer(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Some(valid_token())
        })
        .build();

    // No explicit sign_in: the guarded action works right away.
    let pong: String = client.call("Secret/Ping", ()).await.unwrap();
    assert_eq!(pong, "pong");
    assert!(client.is_authenticated());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_producer_token_skips_the_automatic_sign_in() {
    install_test_tracing();
    let (_server, url, _log) = start_stock_server().await;

    let client = RpcClient::builder(&url)
        .token_producer(|| None)
        .build();

    client.connect().await.unwrap();
    assert!(!client.is_authenticated());
    let err = client.call::<String>("Secret/Ping", ()).await.unwrap_err();
    assert_unauthorized(&err);
}
