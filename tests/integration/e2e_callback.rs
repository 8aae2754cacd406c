//! Bidirectional symmetry: the listener calls actions the dialer
//! registered, over the same socket, with no permission check on the
//! dialer side.

use std::sync::Arc;
use std::time::Duration;
use tandem_rpc::{
    ActionError, ControllerRegistry, RpcClient, SingletonScopes,
};
use tandem_test_utils::{install_test_tracing, start_server_with, CallLog};

/// Listener-side controller that turns around and calls the dialer back
/// on the same connection.
struct RelayController;

/// Dialer-side controllers the listener calls into.
struct EchoController {
    log: CallLog,
}

struct ClientSecretController;

fn server_registry() -> ControllerRegistry {
    let mut registry = ControllerRegistry::new();
    registry
        .controller::<RelayController>("Relay")
        .allow_anonymous()
        .action2(
            "AskPeerToDouble",
            |_c, ctx, value: i64, times: i64| async move {
                // Call back over the connection the request arrived on.
                let mut total = value;
                for _ in 0..times {
                    total = ctx
                        .connection
                        .call::<i64>("Echo/Double", (total,))
                        .await
                        .map_err(ActionError::from)?;
                }
                Ok(total)
            },
        )
        .action0("ProbePeerSecret", |_c, ctx| async move {
            ctx.connection
                .call::<String>("ClientSecret/Reveal", ())
                .await
                .map_err(ActionError::from)
        });
    registry
}

fn client_registry() -> ControllerRegistry {
    let mut registry = ControllerRegistry::new();
    registry
        .controller::<EchoController>("Echo")
        .action1("Double", |c: Arc<EchoController>, _ctx, value: i64| async move {
            c.log.record(format!("Double({value})"));
            Ok(value * 2)
        });
    // No allow-anonymous markers anywhere: the dialer side must still
    // serve this, because only the listener enforces the policy.
    registry
        .controller::<ClientSecretController>("ClientSecret")
        .action0("Reveal", |_c, _ctx| async move { Ok("client-data".to_owned()) });
    registry
}

fn client_scopes(log: CallLog) -> SingletonScopes {
    SingletonScopes::new()
        .insert("Echo", EchoController { log })
        .insert("ClientSecret", ClientSecretController)
}

#[tokio::test]
async fn listener_calls_back_into_dialer_controllers() {
    install_test_tracing();
    let (_server, url) = start_server_with(server_registry(), SingletonScopes::new()
        .insert("Relay", RelayController))
    .await;

    let log = CallLog::new();
    let client = RpcClient::builder(&url)
        .controllers(client_registry())
        .scope_factory(client_scopes(log.clone()))
        .build();

    // 3 -> 6 -> 12 -> 24 through three round trips on one socket.
    let result: i64 = client.call("Relay/AskPeerToDouble", (3, 3)).await.unwrap();
    assert_eq!(result, 24);
    assert_eq!(
        log.entries(),
        vec![
            "Double(3)".to_owned(),
            "Double(6)".to_owned(),
            "Double(12)".to_owned(),
        ]
    );
}

#[tokio::test]
async fn dialer_side_has_no_permission_check() {
    install_test_tracing();
    let (_server, url) = start_server_with(server_registry(), SingletonScopes::new()
        .insert("Relay", RelayController))
    .await;

    let client = RpcClient::builder(&url)
        .controllers(client_registry())
        .scope_factory(client_scopes(CallLog::new()))
        .build();

    // The dialer never signed in, yet its un-marked controller serves the
    // listener-initiated call.
    let secret: String = client.call("Relay/ProbePeerSecret", ()).await.unwrap();
    assert_eq!(secret, "client-data");
}

#[tokio::test]
async fn callback_connection_survives_interleaved_traffic() {
    install_test_tracing();
    let (_server, url) = start_server_with(server_registry(), SingletonScopes::new()
        .insert("Relay", RelayController))
    .await;

    let log = CallLog::new();
    let client = RpcClient::builder(&url)
        .controllers(client_registry())
        .scope_factory(client_scopes(log.clone()))
        .build();
    let conn = client.connect().await.unwrap();

    let mut handles = Vec::new();
    for i in 1..=10i64 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move {
            conn.call::<i64>("Relay/AskPeerToDouble", (i, 1)).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let doubled = handle.await.unwrap().unwrap();
        assert_eq!(doubled, (i as i64 + 1) * 2);
    }
    assert!(log.wait_for(10, Duration::from_secs(2)).await);
}
