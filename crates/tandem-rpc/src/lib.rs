// tandem-rpc: Symmetric bidirectional RPC over a single WebSocket.
//
// Either peer may call the other; the peer that accepted the socket is the
// listener, the peer that dialed is the dialer, and the per-connection
// engine is identical in both directions.  Actions live in controllers,
// are resolved per request through a scope-factory seam, and are gated by
// the listener-side authentication policy.
//
// Layering, leaves first: `pending` (correlation table), `outbound` +
// `sender` (serialization queue and socket writer), `receiver` (demux),
// `dispatch` + `registry` (inbound pipeline), `connection` (lifecycle
// state machine), `client` (dialer connection manager), `server`
// (listener accept loop).

mod auth;
mod client;
mod config;
mod connection;
mod dispatch;
mod error;
mod events;
mod inflight;
mod outbound;
mod pending;
mod proxy;
mod receiver;
mod registry;
mod sender;
mod server;

pub use auth::{Principal, SignedTokenVault, TokenError, TokenVault};
pub use client::{RpcClient, RpcClientBuilder, ShutdownSummary, TokenProducer};
pub use config::{ClientConfig, ServerConfig, TransportConfig};
pub use connection::Connection;
pub use error::{CloseReason, RpcError};
pub use pending::ResponseEnvelope;
pub use registry::{
    ActionBinding, ActionError, ActionMarkers, ActionResult, CallContext, ControllerBuilder,
    ControllerEntry, ControllerInstance, ControllerRegistry, ControllerScope, ScopeFactory,
    SingletonScopes,
};
pub use server::{RpcServer, RpcServerBuilder};

pub use tandem_protocol::{ActionName, Status};
