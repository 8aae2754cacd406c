//! Error taxonomy for the connection engine.
//!
//! Every variant is cloneable so one failure can fan out to all pending
//! awaiters on a connection.  Underlying library errors are captured as
//! strings at the point of failure.

use tandem_protocol::Status;

/// Errors surfaced to callers of the RPC engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// Socket read/write failure or abnormal closure.  Recoverable by the
    /// dialer via a fresh connect.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed header, length mismatch, or undecodable payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection (or the dialer) was gracefully shut down.
    #[error("connection was shut down: {reason}")]
    WasShutdown { reason: String },

    /// The WebSocket handshake could not complete.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Error status returned by the remote side.  Never retried.
    #[error("remote {status}: {message}")]
    Application { status: Status, message: String },

    /// Auto-connect is disabled and no connection is open.
    #[error("connection is not open")]
    ConnectionNotOpen,

    /// The instance was disposed abruptly.
    #[error("instance was disposed")]
    Disposed,

    /// All correlation ids are in use; transient.
    #[error("request id space exhausted")]
    IdSpaceExhausted,
}

impl RpcError {
    /// True for the application-level error statuses produced by the peer's
    /// dispatch pipeline.
    pub fn is_application(&self) -> bool {
        matches!(self, RpcError::Application { .. })
    }
}

/// Why a connection closed.  Published exactly once per connection.
#[derive(Debug, Clone)]
pub struct CloseReason {
    /// True when the close was a deliberate shutdown (either side) rather
    /// than a transport or protocol failure.
    pub graceful: bool,
    /// Free-form text supplied to `shutdown` or carried in the peer's close
    /// frame.
    pub reason: Option<String>,
    /// Underlying cause for non-graceful closes.
    pub error: Option<RpcError>,
    /// True when the peer initiated the close.
    pub by_remote: bool,
}

impl CloseReason {
    /// A local graceful shutdown with the given reason text.
    pub fn shutdown(reason: impl Into<String>) -> Self {
        CloseReason {
            graceful: true,
            reason: Some(reason.into()),
            error: None,
            by_remote: false,
        }
    }

    /// The peer sent a close frame first.
    pub fn remote_close(reason: Option<String>) -> Self {
        CloseReason {
            graceful: true,
            reason,
            error: None,
            by_remote: true,
        }
    }

    /// A failure-driven close.
    pub fn failed(error: RpcError) -> Self {
        CloseReason {
            graceful: false,
            reason: None,
            error: Some(error),
            by_remote: false,
        }
    }

    /// The error used to poison the pending-request table when this close
    /// reason takes effect.
    pub fn to_error(&self) -> RpcError {
        if let Some(err) = &self.error {
            return err.clone();
        }
        RpcError::WasShutdown {
            reason: self.reason.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.error, &self.reason) {
            (Some(err), _) => write!(f, "closed on error: {err}"),
            (None, Some(reason)) if !reason.is_empty() => {
                write!(f, "closed gracefully: {reason}")
            }
            _ => f.write_str("closed gracefully"),
        }
    }
}
