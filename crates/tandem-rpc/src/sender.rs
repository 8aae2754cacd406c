//! The sender loop: sole writer to the socket.
//!
//! Drains the outbound queue in FIFO order and emits each item as one
//! WebSocket message.  All cross-producer ordering derives from the queue.
//! The loop ends when the queue closes (disposal), when a send fails, or
//! right after a close frame goes out.

use crate::connection::ConnectionShared;
use crate::error::{CloseReason, RpcError};
use crate::outbound::Outbound;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

pub(crate) async fn run<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<ConnectionShared>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(item) = queue.recv().await {
        let result = match item {
            Outbound::Call { uid, message } => {
                trace!(conn_id = %shared.id, uid, bytes = message.len(), "sending request");
                sink.send(Message::Binary(message.into())).await
            }
            Outbound::Notification { message } => {
                trace!(conn_id = %shared.id, bytes = message.len(), "sending notification");
                sink.send(Message::Binary(message.into())).await
            }
            Outbound::Response { message } => {
                trace!(conn_id = %shared.id, bytes = message.len(), "sending response");
                let sent = sink.send(Message::Binary(message.into())).await;
                if sent.is_ok() && shared.inflight.complete_response() {
                    shared.close_after_drain();
                }
                sent
            }
            Outbound::Ping => sink.send(Message::Ping(Vec::new().into())).await,
            Outbound::Pong(data) => sink.send(Message::Pong(data.into())).await,
            Outbound::Close { code, reason } => {
                debug!(conn_id = %shared.id, code = ?code, reason = %reason, "sending close frame");
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                // Best effort: the handshake watchdog bounds the wait for
                // the peer's reciprocal close either way.
                let _ = sink.send(Message::Close(Some(frame))).await;
                return;
            }
        };
        if let Err(e) = result {
            shared.atomic_dispose(CloseReason::failed(RpcError::Transport(e.to_string())));
            return;
        }
    }
    trace!(conn_id = %shared.id, "outbound queue closed; sender exiting");
}
