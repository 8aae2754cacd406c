//! Items carried by the outbound serialization queue.
//!
//! The queue is unbounded, multi-producer, single-consumer (the sender
//! task), FIFO.  Messages are framed before they are enqueued so the
//! sender only moves bytes.

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

#[derive(Debug)]
pub(crate) enum Outbound {
    /// A request that expects a response; the in-flight counter was
    /// incremented by the producer before enqueueing.
    Call { uid: i32, message: Vec<u8> },
    /// A request with no uid; fire-and-forget.
    Notification { message: Vec<u8> },
    /// A response to an inbound request; completing its send decrements
    /// the in-flight counter.
    Response { message: Vec<u8> },
    /// Keep-alive ping.
    Ping,
    /// Reply to a peer ping.
    Pong(Vec<u8>),
    /// Close frame; the sender emits it and stops consuming the queue.
    Close { code: CloseCode, reason: String },
}
