//! A live RPC connection: socket ownership, lifecycle, and the
//! Open → Draining → Closed state machine.
//!
//! Each connection owns two long-lived tasks (receiver, sender), the
//! pending-request table, the outbound queue, and the in-flight counter.
//! The counter drives draining: shutdown contributes one decrement, every
//! completed response another, and whichever operation lands on the
//! drained sentinel starts the close handshake.  Disposal runs exactly
//! once regardless of which path (handshake, protocol error, transport
//! loss, explicit dispose) gets there first.

use crate::auth::{AuthGate, Principal, TokenVault};
use crate::config::{TransportConfig, PROTOCOL_ERROR_CLOSE_BOUND};
use crate::error::{CloseReason, RpcError};
use crate::events::{Bus, OnceEvent};
use crate::inflight::InflightCounter;
use crate::outbound::Outbound;
use crate::pending::PendingTable;
use crate::registry::{ControllerRegistry, ScopeFactory};
use crate::{receiver, sender};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};
use uuid::Uuid;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Everything the dispatch pipeline needs to serve inbound requests.
pub(crate) struct DispatchState {
    pub registry: Arc<ControllerRegistry>,
    pub scopes: Arc<dyn ScopeFactory>,
    pub vault: Option<Arc<dyn TokenVault>>,
    /// Listener side checks the permission policy; the dialer side trusts
    /// the server to call anything it registered.
    pub enforce_auth: bool,
}

#[derive(Clone)]
pub(crate) struct ShutdownRecord {
    pub reason: String,
    pub timeout: Duration,
}

struct ConnState {
    shutdown: Option<ShutdownRecord>,
    /// Reason to publish once the peer's reciprocal close frame arrives.
    closing: Option<CloseReason>,
}

pub(crate) struct ConnectionShared {
    pub id: String,
    pub receive_timeout: Duration,
    keepalive_interval: Duration,
    pub pending: PendingTable,
    pub inflight: InflightCounter,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    state: Mutex<ConnState>,
    close_started: AtomicBool,
    disposed: AtomicBool,
    pub closed: OnceEvent<CloseReason>,
    pub dispatch: Option<DispatchState>,
    pub principal: Mutex<Principal>,
    pub authenticated: Bus<Principal>,
    pub auth_gate: AuthGate,
    receiver_abort: Mutex<Option<AbortHandle>>,
}

impl ConnectionShared {
    fn new(
        dispatch: Option<DispatchState>,
        transport: &TransportConfig,
        outbound: Option<mpsc::UnboundedSender<Outbound>>,
    ) -> Self {
        ConnectionShared {
            id: Uuid::new_v4().to_string(),
            receive_timeout: transport.receive_timeout,
            keepalive_interval: transport.keepalive_interval,
            pending: PendingTable::new(),
            inflight: InflightCounter::new(),
            outbound: Mutex::new(outbound),
            state: Mutex::new(ConnState {
                shutdown: None,
                closing: None,
            }),
            close_started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            closed: OnceEvent::new(),
            dispatch,
            principal: Mutex::new(Principal::anonymous()),
            authenticated: Bus::new(),
            auth_gate: AuthGate::new(),
            receiver_abort: Mutex::new(None),
        }
    }

    /// Push an item onto the outbound queue.  False once the queue closed.
    pub fn enqueue(&self, item: Outbound) -> bool {
        match &*lock(&self.outbound) {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// The reason text recorded by `shutdown`, if any.
    pub fn shutdown_reason(&self) -> Option<String> {
        lock(&self.state).shutdown.as_ref().map(|r| r.reason.clone())
    }

    /// Error handed to callers whose operation raced the close.
    pub fn close_error(&self) -> RpcError {
        match self.closed.get() {
            Some(reason) => reason.to_error(),
            None => match self.shutdown_reason() {
                Some(reason) => RpcError::WasShutdown { reason },
                None => RpcError::Disposed,
            },
        }
    }

    /// Take the reason recorded for an in-progress close handshake.
    pub fn take_closing_reason(&self) -> Option<CloseReason> {
        lock(&self.state).closing.take()
    }

    /// Start the close handshake once: queue the close frame and bound the
    /// wait for the peer's reciprocal close.
    pub fn initiate_close(self: &Arc<Self>, reason: CloseReason, bound: Duration) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(conn_id = %self.id, %reason, "starting close handshake");
        lock(&self.state).closing = Some(reason.clone());
        let code = if reason.graceful {
            CloseCode::Normal
        } else {
            CloseCode::Protocol
        };
        let text = match (&reason.reason, &reason.error) {
            (Some(text), _) => text.clone(),
            (None, Some(err)) => err.to_string(),
            (None, None) => String::new(),
        };
        if !self.enqueue(Outbound::Close { code, reason: text }) {
            self.atomic_dispose(reason);
            return;
        }
        let shared = self.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(bound, shared.closed.wait()).await.is_err() {
                debug!(conn_id = %shared.id, "peer never reciprocated the close; disposing");
                shared.atomic_dispose(reason);
            }
        });
    }

    /// Drained while shutting down: run the handshake with the recorded
    /// shutdown reason.
    pub fn close_after_drain(self: &Arc<Self>) {
        let record = lock(&self.state).shutdown.clone();
        let (reason, bound) = match record {
            Some(r) => (CloseReason::shutdown(r.reason), r.timeout),
            // The counter only reaches the sentinel after a shutdown was
            // recorded; an empty record still closes cleanly.
            None => (CloseReason::shutdown(""), PROTOCOL_ERROR_CLOSE_BOUND),
        };
        self.initiate_close(reason, bound);
    }

    /// The single teardown path.  Runs exactly once: closes the outbound
    /// queue, poisons the pending table, stops the receiver, and fires the
    /// disconnected event with the final [`CloseReason`].
    pub fn atomic_dispose(&self, reason: CloseReason) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(conn_id = %self.id, %reason, "connection closed");
        lock(&self.outbound).take();
        self.pending.fail_all(reason.to_error());
        if let Some(handle) = lock(&self.receiver_abort).take() {
            handle.abort();
        }
        self.closed.fire(reason);
    }
}

/// A live connection to the peer.  Cheap to clone; all clones share the
/// same underlying socket and state.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<ConnectionShared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap an accepted or dialed WebSocket stream and start its receiver,
    /// sender, and keep-alive tasks.
    pub(crate) fn spawn<S>(
        ws: WebSocketStream<S>,
        dispatch: Option<DispatchState>,
        transport: &TransportConfig,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnectionShared::new(dispatch, transport, Some(tx)));

        tokio::spawn(sender::run(sink, rx, shared.clone()));
        let receiver_task = tokio::spawn(receiver::run(stream, shared.clone()));
        *lock(&shared.receiver_abort) = Some(receiver_task.abort_handle());

        if !shared.keepalive_interval.is_zero() {
            tokio::spawn(run_keepalive(shared.clone()));
        }

        Connection { shared }
    }

    /// Stable identifier for logs and connection tracking.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Graceful shutdown: stop accepting new calls, drain in-flight work
    /// for up to `timeout`, then close.  Safe to call more than once; the
    /// first reason wins.  Resolves with the final close reason.
    pub async fn shutdown(&self, timeout: Duration, reason: &str) -> CloseReason {
        let first = {
            let mut st = lock(&self.shared.state);
            if st.shutdown.is_none() {
                st.shutdown = Some(ShutdownRecord {
                    reason: reason.to_owned(),
                    timeout,
                });
                true
            } else {
                false
            }
        };
        if first {
            info!(conn_id = %self.shared.id, reason, "shutdown requested");
            if self.shared.inflight.begin_shutdown() {
                self.shared
                    .initiate_close(CloseReason::shutdown(reason), timeout);
            }
        }
        if let Ok(Some(close_reason)) =
            tokio::time::timeout(timeout, self.shared.closed.wait()).await
        {
            return close_reason;
        }
        // Drain window elapsed with work still in flight: force the close.
        let forced = CloseReason::shutdown(self.shared.shutdown_reason().unwrap_or_default());
        self.shared
            .initiate_close(forced.clone(), PROTOCOL_ERROR_CLOSE_BOUND);
        match tokio::time::timeout(PROTOCOL_ERROR_CLOSE_BOUND, self.shared.closed.wait()).await {
            Ok(Some(close_reason)) => close_reason,
            _ => {
                self.shared.atomic_dispose(forced);
                self.shared
                    .closed
                    .get()
                    .unwrap_or(CloseReason::failed(RpcError::Disposed))
            }
        }
    }

    /// Abrupt teardown: no drain, no close handshake.
    pub fn dispose(&self) {
        self.shared
            .atomic_dispose(CloseReason::failed(RpcError::Disposed));
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) -> CloseReason {
        self.shared
            .closed
            .wait()
            .await
            .unwrap_or(CloseReason::failed(RpcError::Disposed))
    }

    /// The published close reason, if the connection already closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.closed.get()
    }

    /// Register a disconnect callback.  Fires exactly once; registering
    /// after closure invokes the callback synchronously.
    pub fn on_disconnected(&self, cb: impl FnOnce(&CloseReason) + Send + 'static) {
        self.shared.closed.subscribe(cb);
    }

    /// Listener side: fires after each successful `SignIn`.
    pub fn on_authenticated(&self, cb: impl Fn(&Principal) + Send + Sync + 'static) {
        self.shared.authenticated.subscribe(cb);
    }

    /// The identity currently bound to this connection (listener side).
    pub fn principal(&self) -> Principal {
        lock(&self.shared.principal).clone()
    }

    /// True after a completed `SignIn` (dialer view) or while an
    /// authenticated principal is bound (listener view).
    pub fn is_authenticated(&self) -> bool {
        self.shared.auth_gate.is_authenticated()
            || lock(&self.shared.principal).is_authenticated()
    }
}

/// Queue a WebSocket ping every keep-alive interval until the connection
/// closes.  The peer's receive timeout is what actually detects silence.
async fn run_keepalive(shared: Arc<ConnectionShared>) {
    let interval = shared.keepalive_interval;
    let closed = shared.closed.wait();
    tokio::pin!(closed);
    loop {
        tokio::select! {
            _ = &mut closed => return,
            () = tokio::time::sleep(interval) => {
                if !shared.enqueue(Outbound::Ping) {
                    return;
                }
            }
        }
    }
}
