//! The proxy surface: turning a typed method call into a protocol request
//! and awaiting the correlated response.
//!
//! Arguments are any `Serialize` value that maps to a JSON array; pass a
//! tuple: `conn.call("Math/Sum", (2, 3))`.  A lone non-array value is
//! wrapped as a single positional argument; `()` means no arguments.

use crate::auth::token_to_wire;
use crate::connection::Connection;
use crate::error::RpcError;
use crate::outbound::Outbound;
use crate::pending::ResponseEnvelope;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tandem_protocol::{encode_message, encoding, ActionName, Header, RequestBody};

fn positional_args<A: Serialize>(args: A) -> Result<Vec<Value>, RpcError> {
    let value = serde_json::to_value(args)
        .map_err(|e| RpcError::Protocol(format!("argument serialization: {e}")))?;
    Ok(match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

fn decode_result<R: DeserializeOwned>(envelope: &ResponseEnvelope) -> Result<R, RpcError> {
    match envelope.encoding.as_deref() {
        None | Some(encoding::JSON) => {}
        Some(other) => {
            return Err(RpcError::Protocol(format!(
                "cannot decode a {other} response into a typed value; use call_raw"
            )));
        }
    }
    let payload: &[u8] = if envelope.payload.is_empty() {
        b"null"
    } else {
        &envelope.payload
    };
    serde_json::from_slice(payload)
        .map_err(|e| RpcError::Protocol(format!("response deserialization: {e}")))
}

impl Connection {
    /// Call a remote action and decode the JSON result into `R`.
    pub async fn call<R: DeserializeOwned>(
        &self,
        action: &str,
        args: impl Serialize,
    ) -> Result<R, RpcError> {
        let envelope = self.call_raw(action, positional_args(args)?).await?;
        decode_result(&envelope)
    }

    /// Call a remote action that returns nothing.
    pub async fn call_void(&self, action: &str, args: impl Serialize) -> Result<(), RpcError> {
        let _ = self.call_raw(action, positional_args(args)?).await?;
        Ok(())
    }

    /// Call a remote action and return the raw response envelope (used for
    /// non-JSON response codecs).
    pub async fn call_raw(
        &self,
        action: &str,
        args: Vec<Value>,
    ) -> Result<ResponseEnvelope, RpcError> {
        validate_action(action)?;
        if let Some(reason) = self.shared.shutdown_reason() {
            return Err(RpcError::WasShutdown { reason });
        }
        // The id is allocated and registered before the request is
        // enqueued, so the response can never race the registration.
        let (uid, awaiter) = self.shared.pending.register()?;
        if !self.shared.inflight.try_begin_request() {
            self.shared.pending.discard(uid);
            return Err(self.shared.close_error());
        }
        let message = match frame_request(action, &args, Some(uid)) {
            Ok(message) => message,
            Err(e) => {
                self.shared.pending.discard(uid);
                if self.shared.inflight.complete_response() {
                    self.shared.close_after_drain();
                }
                return Err(e);
            }
        };
        if !self.shared.enqueue(Outbound::Call { uid, message }) {
            self.shared.pending.discard(uid);
            if self.shared.inflight.complete_response() {
                self.shared.close_after_drain();
            }
            return Err(self.shared.close_error());
        }
        match awaiter.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.close_error()),
        }
    }

    /// Fire-and-forget: no uid is allocated, no pending entry registered,
    /// and nothing is awaited beyond enqueueing.
    pub async fn notify(&self, action: &str, args: impl Serialize) -> Result<(), RpcError> {
        validate_action(action)?;
        if let Some(reason) = self.shared.shutdown_reason() {
            return Err(RpcError::WasShutdown { reason });
        }
        let args = positional_args(args)?;
        let message = frame_request(action, &args, None)?;
        if !self.shared.enqueue(Outbound::Notification { message }) {
            return Err(self.shared.close_error());
        }
        Ok(())
    }

    /// Authenticate this connection with an opaque token.  Serialized
    /// against `sign_out` so the authenticated flag tracks completed
    /// operations only.
    pub async fn sign_in(&self, token: &[u8]) -> Result<(), RpcError> {
        let _gate = self.shared.auth_gate.gate.lock().await;
        self.call_void("/SignIn", (token_to_wire(token),)).await?;
        self.shared.auth_gate.set_authenticated(true);
        Ok(())
    }

    /// Drop this connection's authenticated identity.
    pub async fn sign_out(&self) -> Result<(), RpcError> {
        let _gate = self.shared.auth_gate.gate.lock().await;
        self.call_void("/SignOut", ()).await?;
        self.shared.auth_gate.set_authenticated(false);
        Ok(())
    }
}

fn validate_action(action: &str) -> Result<(), RpcError> {
    ActionName::parse(action)
        .map(|_| ())
        .ok_or_else(|| RpcError::Protocol(format!("invalid action name {action:?}")))
}

fn frame_request(action: &str, args: &[Value], uid: Option<i32>) -> Result<Vec<u8>, RpcError> {
    let payload = serde_json::to_vec(&RequestBody {
        action_name: action,
        args,
    })
    .map_err(|e| RpcError::Protocol(format!("request serialization: {e}")))?;
    let header = Header::request(action.to_owned(), uid, 0);
    encode_message(header, &payload).map_err(|e| RpcError::Protocol(e.to_string()))
}
