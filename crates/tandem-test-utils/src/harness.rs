//! In-process server harness for the end-to-end suites.

use crate::controllers::{stock_registry, stock_scopes, CallLog};
use std::net::SocketAddr;
use std::time::Duration;
use tandem_rpc::{ControllerRegistry, RpcServer, ScopeFactory, SignedTokenVault};

/// Vault key every suite shares; tokens minted with it verify on the
/// stock server.
pub const TEST_VAULT_KEY: &[u8] = b"tandem-test-vault-key";

/// Bind a random loopback port and serve `server` on a background task.
/// Returns the bound address and the `ws://` URL.
pub async fn spawn_server(server: RpcServer) -> (SocketAddr, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind server");
    let addr = listener.local_addr().expect("local_addr after bind");
    tokio::spawn(async move {
        server.serve(listener).await.expect("server error");
    });
    // Give the accept loop a moment to start.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, format!("ws://{addr}"))
}

/// A server exposing the stock controllers and the shared test vault.
/// Returns the serving handle (for shutdown calls), the URL, and the call
/// log backing the stock controllers.
pub async fn start_stock_server() -> (RpcServer, String, CallLog) {
    let log = CallLog::new();
    let server = RpcServer::builder()
        .controllers(stock_registry())
        .scope_factory(stock_scopes(log.clone()))
        .token_vault(SignedTokenVault::new(TEST_VAULT_KEY.to_vec()))
        .build();
    let (_addr, url) = spawn_server(server.clone()).await;
    (server, url, log)
}

/// A server with a caller-supplied registry and scope factory, stock vault.
pub async fn start_server_with(
    registry: ControllerRegistry,
    scopes: impl ScopeFactory + 'static,
) -> (RpcServer, String) {
    let server = RpcServer::builder()
        .controllers(registry)
        .scope_factory(scopes)
        .token_vault(SignedTokenVault::new(TEST_VAULT_KEY.to_vec()))
        .build();
    let (_addr, url) = spawn_server(server.clone()).await;
    (server, url)
}
