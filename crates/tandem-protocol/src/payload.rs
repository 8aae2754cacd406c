//! Payload envelopes for the default JSON codec.
//!
//! Requests carry `{"action_name": "...", "args": [v0, v1, ...]}` with
//! positional arguments.  Error responses carry the human-readable message
//! as a single JSON string.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::borrow::Cow;

/// Payload codec names carried in the header's `payload_encoding` field.
pub mod encoding {
    /// Default codec, assumed when the field is absent.
    pub const JSON: &str = "json";
    /// Binary codec for actions that produce pre-encoded responses.
    pub const PROTOBUF: &str = "protobuf";
}

/// Owned request body, used on the sending side.
#[derive(Debug, Serialize)]
pub struct RequestBody<'a> {
    pub action_name: &'a str,
    pub args: &'a [serde_json::Value],
}

/// Borrowed request body, used on the receiving side.
///
/// Arguments stay as raw JSON slices so each one deserializes directly into
/// the bound parameter type, positionally.
#[derive(Debug, Deserialize)]
pub struct RequestBodyRef<'a> {
    #[serde(borrow)]
    pub action_name: Cow<'a, str>,
    #[serde(borrow, default)]
    pub args: Vec<&'a RawValue>,
}

/// Extract the error message from an error-response payload.
///
/// The wire form is a JSON string; anything else (older peers, partial
/// writes) falls back to lossy UTF-8 so the caller still sees something
/// readable.
pub fn error_message_from_payload(payload: &[u8]) -> String {
    match serde_json::from_slice::<String>(payload) {
        Ok(message) => message,
        Err(_) => String::from_utf8_lossy(payload).into_owned(),
    }
}
