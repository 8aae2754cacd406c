//! A wire-level WebSocket peer that speaks raw protocol bytes.
//!
//! Bypasses the connection engine entirely so tests can send malformed
//! headers, duplicate uids, and hand-assembled frames, and observe exactly
//! what comes back.

use futures_util::{SinkExt, StreamExt};
use tandem_protocol::{decode_message, encode_message, Header, RequestBody};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct RawPeer {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

/// What the peer read from the socket.
#[derive(Debug)]
pub enum RawEvent {
    /// A decoded logical message.
    Message { header: Header, payload: Vec<u8> },
    /// The remote sent a close frame (code, reason).
    Closed(Option<(u16, String)>),
}

impl RawPeer {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Send arbitrary bytes as one binary WebSocket message.
    pub async fn send_bytes(&mut self, bytes: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Binary(bytes.into())).await?;
        Ok(())
    }

    /// Send a text frame (not part of the protocol; used to provoke
    /// protocol errors).
    pub async fn send_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Frame and send a header + payload pair.
    pub async fn send_message(
        &mut self,
        header: Header,
        payload: &[u8],
    ) -> Result<(), Box<dyn std::error::Error>> {
        let bytes = encode_message(header, payload)?;
        self.send_bytes(bytes).await
    }

    /// Frame and send a JSON request for `action` with positional `args`.
    pub async fn send_request(
        &mut self,
        action: &str,
        uid: Option<i32>,
        args: &[serde_json::Value],
    ) -> Result<(), Box<dyn std::error::Error>> {
        let payload = serde_json::to_vec(&RequestBody {
            action_name: action,
            args,
        })?;
        let header = Header::request(action.to_owned(), uid, 0);
        self.send_message(header, &payload).await
    }

    /// Read the next logical message or close frame, answering pings along
    /// the way.
    pub async fn recv(&mut self) -> Result<RawEvent, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    let (header, payload) = decode_message(&bytes)?;
                    return Ok(RawEvent::Message {
                        header,
                        payload: payload.to_vec(),
                    });
                }
                Some(Ok(Message::Ping(data))) => {
                    self.write.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let detail = frame.map(|f| (u16::from(f.code), f.reason.to_string()));
                    return Ok(RawEvent::Closed(detail));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Read messages until a close frame arrives.
    pub async fn recv_close(&mut self) -> Result<Option<(u16, String)>, Box<dyn std::error::Error>> {
        loop {
            if let RawEvent::Closed(detail) = self.recv().await? {
                return Ok(detail);
            }
        }
    }

    /// Send a close frame.
    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
