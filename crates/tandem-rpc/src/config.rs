//! Transport tuning for listeners and dialers.
//!
//! Plain structs with documented defaults; the embedding application owns
//! whatever file format it loads them from.

use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Keep-alive ping cadence.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Silence bound: no frame from the peer within this window closes the
/// connection with a transport error.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(90);
/// Largest accepted logical message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
/// Largest accepted single WebSocket frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;
/// Close-handshake bound after a protocol error.
pub const PROTOCOL_ERROR_CLOSE_BOUND: Duration = Duration::from_secs(2);
/// Close-handshake bound after a malformed header.
pub const MALFORMED_HEADER_CLOSE_BOUND: Duration = Duration::from_secs(1);

/// Settings shared by both connection roles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
    #[serde(with = "duration_secs")]
    pub receive_timeout: Duration,
    pub max_message_size: usize,
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    pub(crate) fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_frame_size);
        config
    }
}

/// Listener-side settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: TransportConfig,
}

/// Dialer-side settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    /// When false, proxy calls fail with `ConnectionNotOpen` instead of
    /// dialing on demand.
    pub auto_connect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            transport: TransportConfig::default(),
            auto_connect: true,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
