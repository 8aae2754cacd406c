//! The listener: accepts WebSocket upgrades and runs one connection
//! engine per peer.
//!
//! Inbound requests on accepted connections go through the full
//! permission policy; the reserved `SignIn`/`SignOut` actions bind a
//! principal per connection through the configured token vault.

use crate::auth::TokenVault;
use crate::config::ServerConfig;
use crate::connection::{Connection, DispatchState};
use crate::events::Bus;
use crate::registry::{ControllerRegistry, ScopeFactory, SingletonScopes};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::accept_async_with_config;
use tracing::{debug, error, info, warn};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct ServerShared {
    config: ServerConfig,
    registry: Arc<ControllerRegistry>,
    scopes: Arc<dyn ScopeFactory>,
    vault: Option<Arc<dyn TokenVault>>,
    connections: Mutex<HashMap<String, Connection>>,
    connected: Bus<Connection>,
    stop: watch::Sender<bool>,
}

/// Builder for [`RpcServer`].
pub struct RpcServerBuilder {
    config: ServerConfig,
    registry: ControllerRegistry,
    scopes: Option<Arc<dyn ScopeFactory>>,
    vault: Option<Arc<dyn TokenVault>>,
}

impl RpcServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn controllers(mut self, registry: ControllerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn scope_factory(mut self, scopes: impl ScopeFactory + 'static) -> Self {
        self.scopes = Some(Arc::new(scopes));
        self
    }

    /// Token vault backing the reserved `SignIn` action.  Without one,
    /// every `SignIn` is rejected and only anonymous-marked actions are
    /// callable.
    pub fn token_vault(mut self, vault: impl TokenVault + 'static) -> Self {
        self.vault = Some(Arc::new(vault));
        self
    }

    pub fn build(self) -> RpcServer {
        RpcServer {
            shared: Arc::new(ServerShared {
                config: self.config,
                registry: Arc::new(self.registry),
                scopes: self
                    .scopes
                    .unwrap_or_else(|| Arc::new(SingletonScopes::new())),
                vault: self.vault,
                connections: Mutex::new(HashMap::new()),
                connected: Bus::new(),
                stop: watch::channel(false).0,
            }),
        }
    }
}

/// The listener-side entry point.
#[derive(Clone)]
pub struct RpcServer {
    shared: Arc<ServerShared>,
}

impl RpcServer {
    pub fn builder() -> RpcServerBuilder {
        RpcServerBuilder {
            config: ServerConfig::default(),
            registry: ControllerRegistry::new(),
            scopes: None,
            vault: None,
        }
    }

    /// Accept connections on `listener` until [`RpcServer::shutdown`] is
    /// called.  Each accepted socket gets its own connection engine.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "listening");
        }
        let mut stop = self.shared.stop.subscribe();
        while !*stop.borrow_and_update() {
            tokio::select! {
                biased;

                _ = stop.changed() => break,

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(err = %e, "accept error");
                            continue;
                        }
                    };
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_socket(shared, stream, peer).await {
                            warn!(peer = %peer, err = %e, "connection setup failed");
                        }
                    });
                }
            }
        }
        info!("listener stopped");
        Ok(())
    }

    /// Stop accepting and gracefully drain every live connection, each
    /// bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration, reason: &str) {
        if self.shared.stop.send_replace(true) {
            return;
        }
        info!(reason, "server shutdown requested");
        let connections: Vec<Connection> =
            lock(&self.shared.connections).values().cloned().collect();
        let drains = connections
            .iter()
            .map(|conn| conn.shutdown(timeout, reason));
        futures_util::future::join_all(drains).await;
    }

    /// Fires for each accepted connection.
    pub fn on_connected(&self, cb: impl Fn(&Connection) + Send + Sync + 'static) {
        self.shared.connected.subscribe(cb);
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Connection> {
        lock(&self.shared.connections).values().cloned().collect()
    }
}

async fn handle_socket(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    if *shared.stop.borrow() {
        // Raced the shutdown; drop the socket before the upgrade.
        return Ok(());
    }
    if shared.registry.wants_tcp_no_delay() {
        // Best-effort hint; a socket that rejects it still works.
        let _ = stream.set_nodelay(true);
    }
    let ws = accept_async_with_config(
        stream,
        Some(shared.config.transport.websocket_config()),
    )
    .await?;

    let dispatch = DispatchState {
        registry: shared.registry.clone(),
        scopes: shared.scopes.clone(),
        vault: shared.vault.clone(),
        enforce_auth: true,
    };
    let conn = Connection::spawn(ws, Some(dispatch), &shared.config.transport);
    debug!(peer = %peer, conn_id = %conn.id(), "peer connected");

    lock(&shared.connections).insert(conn.id().to_owned(), conn.clone());
    let weak = Arc::downgrade(&shared);
    let conn_id = conn.id().to_owned();
    conn.on_disconnected(move |reason| {
        if let Some(server) = weak.upgrade() {
            lock(&server.connections).remove(&conn_id);
            debug!(conn_id = %conn_id, %reason, "peer disconnected");
        }
    });

    shared.connected.emit(&conn);
    Ok(())
}
