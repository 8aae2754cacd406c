//! Symmetric bidirectional RPC over a single WebSocket connection.
//!
//! Either peer can expose controllers and call the other's actions over
//! the same socket.  The dialer side is [`RpcClient`], the listener side
//! [`RpcServer`]; both hand out [`Connection`] values with an identical
//! call surface.
//!
//! ```rust,no_run
//! use tandem::{ControllerRegistry, RpcServer, SingletonScopes};
//!
//! struct Math;
//!
//! # async fn example() -> std::io::Result<()> {
//! let mut registry = ControllerRegistry::new();
//! registry
//!     .controller::<Math>("Math")
//!     .allow_anonymous()
//!     .action2("Sum", |_math, _ctx, a: i64, b: i64| async move { Ok(a + b) });
//!
//! let server = RpcServer::builder()
//!     .controllers(registry)
//!     .scope_factory(SingletonScopes::new().insert("Math", Math))
//!     .build();
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:4850").await?;
//! server.serve(listener).await
//! # }
//! ```

pub use tandem_protocol as protocol;
pub use tandem_rpc::*;
