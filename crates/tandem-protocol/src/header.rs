//! Message header codec.
//!
//! The header is a compact tag/varint structure.  Field keys are
//! `tag << 3 | wire_type` with wire type 0 (varint) or 2 (length-delimited).
//! Schema (frozen, tags must never be renumbered):
//!
//! | Field              | Tag | Type           | Presence                       |
//! |--------------------|-----|----------------|--------------------------------|
//! | `status`           | 1   | varint enum    | always                         |
//! | `uid`              | 2   | varint i32     | optional                       |
//! | `payload_length`   | 3   | varint i32     | optional (default 0)           |
//! | `payload_encoding` | 4   | length-prefix  | optional                       |
//! | `action_name`      | 5   | length-prefix  | required iff `status=Request`  |
//!
//! A logical message frames the header first:
//! `varint(header_len) || header || payload`.  Header-first framing keeps
//! the receive path single-pass; the `payload_length` field is still
//! authoritative and must match the trailing byte count exactly.
//!
//! Unknown tags are skipped on decode (wire-type aware) so peers can add
//! fields without breaking older builds.

use crate::wire::{put_uvarint, Reader, WireError};

/// Hard cap on the serialized header, enforced on both encode and decode.
pub const MAX_HEADER_LEN: usize = 256;

/// Longest accepted `action_name`, in bytes.  Chosen so a header carrying
/// every field stays within [`MAX_HEADER_LEN`].
pub const MAX_ACTION_NAME_LEN: usize = 220;

/// Longest accepted `payload_encoding` name, in bytes.
pub const MAX_ENCODING_LEN: usize = 16;

const TAG_STATUS: u64 = 1;
const TAG_UID: u64 = 2;
const TAG_PAYLOAD_LENGTH: u64 = 3;
const TAG_PAYLOAD_ENCODING: u64 = 4;
const TAG_ACTION_NAME: u64 = 5;

const WIRE_VARINT: u64 = 0;
const WIRE_LEN: u64 = 2;

/// Message status.  `Request` identifies a request; every other value is a
/// response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Request = 0,
    Ok = 1,
    BadRequest = 2,
    InvalidRequest = 3,
    NotFound = 4,
    Unauthorized = 5,
    InternalError = 6,
}

impl Status {
    pub fn is_request(self) -> bool {
        matches!(self, Status::Request)
    }

    /// True for every response status other than `Ok`.
    pub fn is_error(self) -> bool {
        !matches!(self, Status::Request | Status::Ok)
    }
}

impl TryFrom<u64> for Status {
    type Error = HeaderError;

    fn try_from(value: u64) -> Result<Self, HeaderError> {
        match value {
            0 => Ok(Status::Request),
            1 => Ok(Status::Ok),
            2 => Ok(Status::BadRequest),
            3 => Ok(Status::InvalidRequest),
            4 => Ok(Status::NotFound),
            5 => Ok(Status::Unauthorized),
            6 => Ok(Status::InternalError),
            other => Err(HeaderError::UnknownStatus(other)),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Request => "Request",
            Status::Ok => "Ok",
            Status::BadRequest => "BadRequest",
            Status::InvalidRequest => "InvalidRequest",
            Status::NotFound => "NotFound",
            Status::Unauthorized => "Unauthorized",
            Status::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

/// Errors produced by the header codec.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("truncated header")]
    Truncated,
    #[error("header length {0} exceeds the {MAX_HEADER_LEN}-byte limit")]
    HeaderTooLarge(usize),
    #[error("payload length field says {expected} bytes, message carries {actual}")]
    LengthMismatch { expected: u32, actual: usize },
    #[error("unknown status code {0}")]
    UnknownStatus(u64),
    #[error("header field is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid header: {0}")]
    Invalid(&'static str),
}

impl From<WireError> for HeaderError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Truncated => HeaderError::Truncated,
            WireError::VarintOverflow => HeaderError::Invalid("varint overflow"),
        }
    }
}

/// The decoded message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub status: Status,
    /// Correlation id.  Absent on a request means notification (no response
    /// expected).  Required on responses.
    pub uid: Option<i32>,
    pub payload_length: u32,
    /// Payload codec name; absent means the default (`json`).
    pub payload_encoding: Option<String>,
    /// Present iff `status == Request`.
    pub action_name: Option<String>,
}

impl Header {
    /// A request header addressed at `action_name`.
    pub fn request(action_name: String, uid: Option<i32>, payload_length: u32) -> Self {
        Header {
            status: Status::Request,
            uid,
            payload_length,
            payload_encoding: None,
            action_name: Some(action_name),
        }
    }

    /// A response header correlated to `uid`.
    pub fn response(status: Status, uid: i32, payload_length: u32) -> Self {
        Header {
            status,
            uid: Some(uid),
            payload_length,
            payload_encoding: None,
            action_name: None,
        }
    }

    /// Structural validation, applied before encode.
    ///
    /// A request must carry an action name; a response must not, and must
    /// carry a uid.
    fn validate(&self) -> Result<(), HeaderError> {
        match (self.status, &self.action_name) {
            (Status::Request, None) => {
                return Err(HeaderError::Invalid("request header without action_name"));
            }
            (Status::Request, Some(name)) => {
                if name.is_empty() {
                    return Err(HeaderError::Invalid("empty action_name"));
                }
                if name.len() > MAX_ACTION_NAME_LEN {
                    return Err(HeaderError::Invalid("action_name too long"));
                }
            }
            (_, Some(_)) => {
                return Err(HeaderError::Invalid("response header with action_name"));
            }
            (_, None) => {
                if self.uid.is_none() {
                    return Err(HeaderError::Invalid("response header without uid"));
                }
            }
        }
        if let Some(enc) = &self.payload_encoding {
            if enc.is_empty() || enc.len() > MAX_ENCODING_LEN {
                return Err(HeaderError::Invalid("bad payload_encoding length"));
            }
        }
        Ok(())
    }

    /// Serialize just the header structure (no length prefix).
    pub fn encode(&self) -> Result<Vec<u8>, HeaderError> {
        self.validate()?;
        let mut buf = Vec::with_capacity(32);
        put_uvarint(&mut buf, TAG_STATUS << 3 | WIRE_VARINT);
        put_uvarint(&mut buf, self.status as u64);
        if let Some(uid) = self.uid {
            put_uvarint(&mut buf, TAG_UID << 3 | WIRE_VARINT);
            // i32 on the wire as its two's-complement u32 image.
            put_uvarint(&mut buf, u64::from(uid as u32));
        }
        if self.payload_length > 0 {
            put_uvarint(&mut buf, TAG_PAYLOAD_LENGTH << 3 | WIRE_VARINT);
            put_uvarint(&mut buf, u64::from(self.payload_length));
        }
        if let Some(enc) = &self.payload_encoding {
            put_uvarint(&mut buf, TAG_PAYLOAD_ENCODING << 3 | WIRE_LEN);
            put_uvarint(&mut buf, enc.len() as u64);
            buf.extend_from_slice(enc.as_bytes());
        }
        if let Some(name) = &self.action_name {
            put_uvarint(&mut buf, TAG_ACTION_NAME << 3 | WIRE_LEN);
            put_uvarint(&mut buf, name.len() as u64);
            buf.extend_from_slice(name.as_bytes());
        }
        debug_assert!(buf.len() <= MAX_HEADER_LEN);
        Ok(buf)
    }

    /// Parse a header from exactly `bytes` (the length-prefixed slice of a
    /// framed message, already extracted).
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() > MAX_HEADER_LEN {
            return Err(HeaderError::HeaderTooLarge(bytes.len()));
        }
        let mut r = Reader::new(bytes);
        let mut status: Option<Status> = None;
        let mut uid: Option<i32> = None;
        let mut payload_length: u32 = 0;
        let mut payload_encoding: Option<String> = None;
        let mut action_name: Option<String> = None;

        while r.remaining() > 0 {
            let key = r.take_uvarint()?;
            let tag = key >> 3;
            let wire_type = key & 0x7;
            match (tag, wire_type) {
                (TAG_STATUS, WIRE_VARINT) => {
                    status = Some(Status::try_from(r.take_uvarint()?)?);
                }
                (TAG_UID, WIRE_VARINT) => {
                    let raw = r.take_uvarint()?;
                    if raw > u64::from(u32::MAX) {
                        return Err(HeaderError::Invalid("uid out of i32 range"));
                    }
                    uid = Some(raw as u32 as i32);
                }
                (TAG_PAYLOAD_LENGTH, WIRE_VARINT) => {
                    let raw = r.take_uvarint()?;
                    if raw > u64::from(u32::MAX) {
                        return Err(HeaderError::Invalid("payload_length out of range"));
                    }
                    payload_length = raw as u32;
                }
                (TAG_PAYLOAD_ENCODING, WIRE_LEN) => {
                    payload_encoding = Some(take_string(&mut r, MAX_ENCODING_LEN)?);
                }
                (TAG_ACTION_NAME, WIRE_LEN) => {
                    action_name = Some(take_string(&mut r, MAX_ACTION_NAME_LEN)?);
                }
                // Unknown field: skip, honoring the wire type.
                (_, WIRE_VARINT) => {
                    let _ = r.take_uvarint()?;
                }
                (_, WIRE_LEN) => {
                    let len = r.take_uvarint()?;
                    if len > MAX_HEADER_LEN as u64 {
                        return Err(HeaderError::Invalid("unknown field too long"));
                    }
                    let _ = r.take_bytes(len as usize)?;
                }
                _ => return Err(HeaderError::Invalid("unsupported wire type")),
            }
        }

        let status = status.ok_or(HeaderError::Invalid("missing status field"))?;
        let header = Header {
            status,
            uid,
            payload_length,
            payload_encoding,
            action_name,
        };
        header.validate()?;
        Ok(header)
    }
}

fn take_string(r: &mut Reader<'_>, max: usize) -> Result<String, HeaderError> {
    let len = r.take_uvarint()?;
    if len == 0 || len > max as u64 {
        return Err(HeaderError::Invalid("bad string field length"));
    }
    let bytes = r.take_bytes(len as usize)?;
    let s = std::str::from_utf8(bytes).map_err(|_| HeaderError::InvalidUtf8)?;
    Ok(s.to_owned())
}

// ---------------------------------------------------------------------------
// Message framing: varint(header_len) || header || payload
// ---------------------------------------------------------------------------

/// Frame `header` + `payload` into one logical message.
///
/// `header.payload_length` is overwritten with `payload.len()` so callers
/// cannot produce a mismatched frame.
pub fn encode_message(mut header: Header, payload: &[u8]) -> Result<Vec<u8>, HeaderError> {
    let payload_length =
        u32::try_from(payload.len()).map_err(|_| HeaderError::Invalid("payload too large"))?;
    header.payload_length = payload_length;
    let header_bytes = header.encode()?;
    let mut out = Vec::with_capacity(2 + header_bytes.len() + payload.len());
    put_uvarint(&mut out, header_bytes.len() as u64);
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split one logical message into its header and payload slice.
///
/// Enforces the header size cap and the `payload_length` agreement; either
/// violation is a protocol error for the connection.
pub fn decode_message(bytes: &[u8]) -> Result<(Header, &[u8]), HeaderError> {
    let mut r = Reader::new(bytes);
    let header_len = r.take_uvarint()?;
    if header_len > MAX_HEADER_LEN as u64 {
        return Err(HeaderError::HeaderTooLarge(header_len as usize));
    }
    let header_bytes = r.take_bytes(header_len as usize)?;
    let header = Header::decode(header_bytes)?;
    let payload = r.rest();
    if payload.len() != header.payload_length as usize {
        return Err(HeaderError::LengthMismatch {
            expected: header.payload_length,
            actual: payload.len(),
        });
    }
    Ok((header, payload))
}
