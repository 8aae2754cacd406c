// tandem-protocol: Wire model for the tandem RPC framing.
//
// A logical message is one WebSocket binary message laid out as
// `varint(header_len) || header || payload`.  The header is a compact
// tag/varint structure (schema frozen, see `header`); the payload bytes are
// opaque to this crate and interpreted by the codec named in the header.

pub mod action;
pub mod header;
pub mod payload;
pub mod wire;

pub use action::ActionName;
pub use header::{decode_message, encode_message, Header, HeaderError, Status, MAX_HEADER_LEN};
pub use payload::{encoding, error_message_from_payload, RequestBody, RequestBodyRef};
