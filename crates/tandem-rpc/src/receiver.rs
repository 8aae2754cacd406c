//! The receive loop: reads logical messages, routes responses to the
//! pending table, hands requests to the dispatch pipeline, and funnels
//! every failure and close path through the connection's single disposal
//! routine.

use crate::config::{MALFORMED_HEADER_CLOSE_BOUND, PROTOCOL_ERROR_CLOSE_BOUND};
use crate::connection::ConnectionShared;
use crate::dispatch;
use crate::error::{CloseReason, RpcError};
use crate::outbound::Outbound;
use crate::pending::ResponseEnvelope;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tandem_protocol::{decode_message, error_message_from_payload, Header, HeaderError, Status};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

pub(crate) async fn run<S>(mut stream: SplitStream<WebSocketStream<S>>, shared: Arc<ConnectionShared>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        if shared.is_disposed() {
            return;
        }
        let received = tokio::time::timeout(shared.receive_timeout, stream.next()).await;
        let message = match received {
            Err(_) => {
                let err = RpcError::Transport(format!(
                    "no frame from peer within {:?}",
                    shared.receive_timeout
                ));
                warn!(conn_id = %shared.id, "receive timeout");
                shared.atomic_dispose(CloseReason::failed(err));
                return;
            }
            Ok(None) => {
                shared.atomic_dispose(CloseReason::failed(RpcError::Transport(
                    "connection closed without a close frame".to_owned(),
                )));
                return;
            }
            Ok(Some(Err(e))) => {
                shared.atomic_dispose(CloseReason::failed(RpcError::Transport(e.to_string())));
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Binary(bytes) => {
                if !handle_frame(&shared, &bytes) {
                    await_reciprocal_close(&mut stream, &shared).await;
                    return;
                }
            }
            Message::Ping(data) => {
                let _ = shared.enqueue(Outbound::Pong(data.to_vec()));
            }
            Message::Pong(_) => {}
            Message::Close(frame) => {
                handle_peer_close(&shared, frame);
                return;
            }
            Message::Text(_) => {
                protocol_error(
                    &shared,
                    "text frames are not part of the protocol",
                    PROTOCOL_ERROR_CLOSE_BOUND,
                );
                await_reciprocal_close(&mut stream, &shared).await;
                return;
            }
            Message::Frame(_) => {}
        }
    }
}

/// Decode and route one logical message.  Returns false when the receiver
/// should stop reading.
fn handle_frame(shared: &Arc<ConnectionShared>, bytes: &[u8]) -> bool {
    let (header, payload) = match decode_message(bytes) {
        Ok(decoded) => decoded,
        Err(e) => {
            let bound = close_bound_for(&e);
            protocol_error(shared, &e.to_string(), bound);
            return false;
        }
    };

    if header.status.is_request() {
        trace!(
            conn_id = %shared.id,
            action = header.action_name.as_deref().unwrap_or_default(),
            uid = ?header.uid,
            "request received"
        );
        // Dispatch on its own task: the receive loop never waits on user
        // code.
        tokio::spawn(dispatch::handle_request(
            shared.clone(),
            header,
            payload.to_vec(),
        ));
        return true;
    }

    handle_response(shared, &header, payload)
}

fn handle_response(shared: &Arc<ConnectionShared>, header: &Header, payload: &[u8]) -> bool {
    // The codec rejects responses without a uid before we get here.
    let Some(uid) = header.uid else {
        return true;
    };
    let result = if header.status == Status::Ok {
        Ok(ResponseEnvelope {
            status: header.status,
            encoding: header.payload_encoding.clone(),
            payload: payload.to_vec(),
        })
    } else {
        Err(RpcError::Application {
            status: header.status,
            message: error_message_from_payload(payload),
        })
    };
    if !shared.pending.complete(uid, result) {
        // A response we never asked for must not touch the counter.
        debug!(conn_id = %shared.id, uid, "response had no pending awaiter");
        return true;
    }
    if shared.inflight.complete_response() {
        // Last in-flight response while draining: start the handshake and
        // keep reading so the peer's reciprocal close resolves it.
        shared.close_after_drain();
    }
    true
}

/// After a protocol error the connection is already condemned; keep
/// draining frames until the peer's close arrives so the handshake
/// completes faster than the watchdog bound.  Disposal aborts this task if
/// the peer stays silent.
async fn await_reciprocal_close<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
    shared: &Arc<ConnectionShared>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match stream.next().await {
            None | Some(Err(_)) => {
                if let Some(reason) = shared.take_closing_reason() {
                    shared.atomic_dispose(reason);
                }
                return;
            }
            Some(Ok(Message::Close(frame))) => {
                handle_peer_close(shared, frame);
                return;
            }
            Some(Ok(_)) => {}
        }
    }
}

fn handle_peer_close(
    shared: &Arc<ConnectionShared>,
    frame: Option<CloseFrame>,
) {
    match shared.take_closing_reason() {
        // Reciprocal close for a handshake we started.
        Some(reason) => {
            debug!(conn_id = %shared.id, "peer reciprocated close");
            shared.atomic_dispose(reason);
        }
        // Peer-initiated close: reciprocate, then tear down.
        None => {
            let text = frame
                .as_ref()
                .map(|f| f.reason.to_string())
                .filter(|s| !s.is_empty());
            debug!(conn_id = %shared.id, reason = text.as_deref().unwrap_or_default(), "peer closed");
            let _ = shared.enqueue(Outbound::Close {
                code: CloseCode::Normal,
                reason: String::new(),
            });
            shared.atomic_dispose(CloseReason::remote_close(text));
        }
    }
}

fn protocol_error(shared: &Arc<ConnectionShared>, message: &str, bound: Duration) {
    let err = RpcError::Protocol(message.to_owned());
    warn!(conn_id = %shared.id, %err, "protocol violation");
    // Pending awaiters fail immediately; the close frame and disposal
    // follow within the bound.
    shared.pending.fail_all(err.clone());
    shared.initiate_close(CloseReason::failed(err), bound);
}

fn close_bound_for(e: &HeaderError) -> Duration {
    match e {
        HeaderError::LengthMismatch { .. } => PROTOCOL_ERROR_CLOSE_BOUND,
        _ => MALFORMED_HEADER_CLOSE_BOUND,
    }
}
