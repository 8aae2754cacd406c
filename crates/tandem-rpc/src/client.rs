//! The dialer: a connection manager owning at most one live connection.
//!
//! Many tasks may call [`RpcClient::connect`] concurrently; a fair async
//! mutex serializes the actual dial while the double-checked slot read
//! keeps the hot path lock-free.  A shutdown request parks the client for
//! good: it aborts an in-flight handshake, drains the live connection, and
//! makes every later call fail with the recorded reason.

use crate::config::ClientConfig;
use crate::connection::{Connection, DispatchState};
use crate::error::{CloseReason, RpcError};
use crate::events::{Bus, OnceEvent};
use crate::registry::{ControllerRegistry, ScopeFactory, SingletonScopes};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_tungstenite::connect_async_with_config;
use tracing::{debug, info};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Produces the token used for automatic authentication after connect.
/// Returning `None` (or an empty token) skips the sign-in.
pub type TokenProducer = Arc<dyn Fn() -> Option<Vec<u8>> + Send + Sync>;

/// How a client shutdown concluded.
#[derive(Debug, Clone)]
pub enum ShutdownSummary {
    /// No connection was open; nothing needed draining.
    NoConnectionGracefully,
    /// The live connection ran its close handshake.
    Connection(CloseReason),
}

struct ClientShutdown {
    reason: String,
    timeout: Duration,
    done: OnceEvent<ShutdownSummary>,
}

struct ClientState {
    connection: Option<Connection>,
    shutdown: Option<Arc<ClientShutdown>>,
    /// Wakes an in-flight handshake so shutdown can abort it.
    connect_cancel: Option<Arc<Notify>>,
}

struct ClientShared {
    uri: String,
    config: ClientConfig,
    registry: Arc<ControllerRegistry>,
    scopes: Arc<dyn ScopeFactory>,
    token_producer: Option<TokenProducer>,
    connect_gate: tokio::sync::Mutex<()>,
    state: Mutex<ClientState>,
    connected: Bus<Connection>,
    disconnected: Bus<CloseReason>,
}

/// Builder for [`RpcClient`].
pub struct RpcClientBuilder {
    uri: String,
    config: ClientConfig,
    registry: ControllerRegistry,
    scopes: Option<Arc<dyn ScopeFactory>>,
    token_producer: Option<TokenProducer>,
}

impl RpcClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Controllers the server may call back on this client.
    pub fn controllers(mut self, registry: ControllerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn scope_factory(mut self, scopes: impl ScopeFactory + 'static) -> Self {
        self.scopes = Some(Arc::new(scopes));
        self
    }

    /// Install a token producer; when it yields a non-empty token the
    /// client signs in automatically right after each connect.
    pub fn token_producer(
        mut self,
        producer: impl Fn() -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.token_producer = Some(Arc::new(producer));
        self
    }

    pub fn build(self) -> RpcClient {
        RpcClient {
            shared: Arc::new(ClientShared {
                uri: self.uri,
                config: self.config,
                registry: Arc::new(self.registry),
                scopes: self
                    .scopes
                    .unwrap_or_else(|| Arc::new(SingletonScopes::new())),
                token_producer: self.token_producer,
                connect_gate: tokio::sync::Mutex::new(()),
                state: Mutex::new(ClientState {
                    connection: None,
                    shutdown: None,
                    connect_cancel: None,
                }),
                connected: Bus::new(),
                disconnected: Bus::new(),
            }),
        }
    }
}

/// The dialer-side entry point.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<ClientShared>,
}

impl RpcClient {
    /// Start building a client for `uri` (`ws://host:port` or
    /// `wss://host:port`).
    pub fn builder(uri: impl Into<String>) -> RpcClientBuilder {
        RpcClientBuilder {
            uri: uri.into(),
            config: ClientConfig::default(),
            registry: ControllerRegistry::new(),
            scopes: None,
            token_producer: None,
        }
    }

    /// A client with default configuration and no callback controllers.
    pub fn new(uri: impl Into<String>) -> RpcClient {
        Self::builder(uri).build()
    }

    /// The currently open connection, if any.
    pub fn current_connection(&self) -> Option<Connection> {
        lock(&self.shared.state)
            .connection
            .clone()
            .filter(|c| c.close_reason().is_none())
    }

    /// True once `shutdown` has been requested.
    pub fn is_shut_down(&self) -> bool {
        lock(&self.shared.state).shutdown.is_some()
    }

    /// Fires for each newly established connection.
    pub fn on_connected(&self, cb: impl Fn(&Connection) + Send + Sync + 'static) {
        self.shared.connected.subscribe(cb);
    }

    /// Fires once per connection when it closes.
    pub fn on_disconnected(&self, cb: impl Fn(&CloseReason) + Send + Sync + 'static) {
        self.shared.disconnected.subscribe(cb);
    }

    /// Get the open connection or establish one.  Concurrent callers share
    /// a single dial; the winner installs the connection for everyone.
    pub async fn connect(&self) -> Result<Connection, RpcError> {
        if let Some(conn) = self.current_connection() {
            return Ok(conn);
        }
        let _gate = self.shared.connect_gate.lock().await;
        // Another waiter may have connected while we queued on the gate.
        if let Some(conn) = self.current_connection() {
            return Ok(conn);
        }
        if let Some(shutdown) = lock(&self.shared.state).shutdown.clone() {
            return Err(RpcError::WasShutdown {
                reason: shutdown.reason.clone(),
            });
        }

        let cancel = Arc::new(Notify::new());
        lock(&self.shared.state).connect_cancel = Some(cancel.clone());
        let ws_config = self.shared.config.transport.websocket_config();
        let disable_nagle = self.shared.registry.wants_tcp_no_delay();
        debug!(uri = %self.shared.uri, "dialing");
        let handshake = tokio::select! {
            result = connect_async_with_config(self.shared.uri.as_str(), Some(ws_config), disable_nagle) => Some(result),
            () = cancel.notified() => None,
        };
        lock(&self.shared.state).connect_cancel = None;

        let Some(handshake) = handshake else {
            // The cancel handle fired: shutdown or dispose won the race.
            return Err(self.guard_error());
        };
        let (ws, _response) = handshake.map_err(|e| RpcError::Connect(e.to_string()))?;

        let dispatch = DispatchState {
            registry: self.shared.registry.clone(),
            scopes: self.shared.scopes.clone(),
            vault: None,
            enforce_auth: false,
        };
        let conn = Connection::spawn(ws, Some(dispatch), &self.shared.config.transport);

        // Install under the state lock unless a shutdown slipped in during
        // the handshake; then the new connection is drained immediately.
        let raced_shutdown = {
            let mut st = lock(&self.shared.state);
            match st.shutdown.clone() {
                Some(shutdown) => Some(shutdown),
                None => {
                    st.connection = Some(conn.clone());
                    None
                }
            }
        };
        if let Some(shutdown) = raced_shutdown {
            conn.shutdown(shutdown.timeout, &shutdown.reason).await;
            return Err(RpcError::WasShutdown {
                reason: shutdown.reason.clone(),
            });
        }

        // Clear the slot and fan the event out when this connection dies.
        let weak = Arc::downgrade(&self.shared);
        let conn_id = conn.id().to_owned();
        conn.on_disconnected(move |reason| {
            if let Some(client) = weak.upgrade() {
                {
                    let mut st = lock(&client.state);
                    if st.connection.as_ref().is_some_and(|c| c.id() == conn_id) {
                        st.connection = None;
                    }
                }
                client.disconnected.emit(reason);
            }
        });

        info!(conn_id = %conn.id(), uri = %self.shared.uri, "connected");
        self.shared.connected.emit(&conn);

        if let Some(producer) = &self.shared.token_producer {
            if let Some(token) = producer() {
                if !token.is_empty() {
                    conn.sign_in(&token).await?;
                }
            }
        }

        Ok(conn)
    }

    /// Call a remote action, dialing first when auto-connect is enabled.
    pub async fn call<R: DeserializeOwned>(
        &self,
        action: &str,
        args: impl Serialize,
    ) -> Result<R, RpcError> {
        self.connection_for_call().await?.call(action, args).await
    }

    /// Call a remote action that returns nothing.
    pub async fn call_void(&self, action: &str, args: impl Serialize) -> Result<(), RpcError> {
        self.connection_for_call()
            .await?
            .call_void(action, args)
            .await
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, action: &str, args: impl Serialize) -> Result<(), RpcError> {
        self.connection_for_call().await?.notify(action, args).await
    }

    /// Sign the current connection in with an opaque token.
    pub async fn sign_in(&self, token: &[u8]) -> Result<(), RpcError> {
        self.connection_for_call().await?.sign_in(token).await
    }

    /// Reset the current connection to the unauthenticated principal.
    pub async fn sign_out(&self) -> Result<(), RpcError> {
        self.connection_for_call().await?.sign_out().await
    }

    /// True after a completed `sign_in` on the current connection.
    pub fn is_authenticated(&self) -> bool {
        self.current_connection()
            .is_some_and(|c| c.is_authenticated())
    }

    /// Request a graceful shutdown.  The first call drives the drain; every
    /// later call awaits the same outcome.
    pub async fn shutdown(&self, timeout: Duration, reason: &str) -> ShutdownSummary {
        let (record, first) = {
            let mut st = lock(&self.shared.state);
            match st.shutdown.clone() {
                Some(existing) => (existing, false),
                None => {
                    let record = Arc::new(ClientShutdown {
                        reason: reason.to_owned(),
                        timeout,
                        done: OnceEvent::new(),
                    });
                    st.shutdown = Some(record.clone());
                    (record, true)
                }
            }
        };
        if !first {
            return record
                .done
                .wait()
                .await
                .unwrap_or(ShutdownSummary::NoConnectionGracefully);
        }

        info!(uri = %self.shared.uri, reason, "client shutdown requested");
        let (cancel, connection) = {
            let mut st = lock(&self.shared.state);
            (st.connect_cancel.take(), st.connection.clone())
        };
        if let Some(cancel) = cancel {
            cancel.notify_waiters();
        }
        let summary = match connection {
            Some(conn) => ShutdownSummary::Connection(conn.shutdown(timeout, reason).await),
            None => ShutdownSummary::NoConnectionGracefully,
        };
        record.done.fire(summary.clone());
        summary
    }

    /// Abrupt teardown: aborts any in-flight handshake and disposes the
    /// live connection without draining.
    pub fn dispose(&self) {
        let (record, first) = {
            let mut st = lock(&self.shared.state);
            match st.shutdown.clone() {
                Some(existing) => (existing, false),
                None => {
                    let record = Arc::new(ClientShutdown {
                        reason: "disposed".to_owned(),
                        timeout: Duration::ZERO,
                        done: OnceEvent::new(),
                    });
                    st.shutdown = Some(record.clone());
                    (record, true)
                }
            }
        };
        let (cancel, connection) = {
            let mut st = lock(&self.shared.state);
            (st.connect_cancel.take(), st.connection.take())
        };
        if let Some(cancel) = cancel {
            cancel.notify_waiters();
        }
        let summary = match connection {
            Some(conn) => {
                conn.dispose();
                ShutdownSummary::Connection(
                    conn.close_reason()
                        .unwrap_or(CloseReason::failed(RpcError::Disposed)),
                )
            }
            None => ShutdownSummary::NoConnectionGracefully,
        };
        if first {
            record.done.fire(summary);
        }
    }

    async fn connection_for_call(&self) -> Result<Connection, RpcError> {
        if self.shared.config.auto_connect {
            self.connect().await
        } else {
            self.current_connection()
                .ok_or(RpcError::ConnectionNotOpen)
        }
    }

    /// Error for operations that lost a race against shutdown or dispose.
    fn guard_error(&self) -> RpcError {
        match lock(&self.shared.state).shutdown.clone() {
            Some(shutdown) => RpcError::WasShutdown {
                reason: shutdown.reason.clone(),
            },
            None => RpcError::Disposed,
        }
    }
}
