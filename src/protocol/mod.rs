//! Server transport — one persistent connection carrying JSON control
//! messages (text) and Opus packets (binary).
//!
//! [`Protocol`] is the seam the conversation controller talks to; the
//! production implementation is [`WebSocketProtocol`].  Incoming traffic is
//! delivered in arrival order over an mpsc channel as [`ProtocolEvent`]s,
//! each event exactly once.

pub mod messages;
pub mod websocket;

pub use messages::{
    AbortReason, ClientHello, ListenMessage, ListeningMode, ServerMessage, TtsState,
};
pub use websocket::WebSocketProtocol;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("no server hello within {0} seconds")]
    HandshakeTimeout(u64),

    #[error("audio channel is not open")]
    ChannelClosed,

    #[error("send failed: {0}")]
    Send(String),

    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Transport-side events, delivered exactly once and in arrival order.
#[derive(Debug)]
pub enum ProtocolEvent {
    ChannelOpened,
    /// Fires exactly once per open channel, whoever initiated the close.
    ChannelClosed,
    /// One encoded audio packet.
    IncomingAudio(Vec<u8>),
    IncomingMessage(ServerMessage),
    NetworkError(String),
}

/// Bidirectional control/audio channel to the conversational server.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Connect and complete the hello handshake.  Fails after the configured
    /// handshake timeout if the server never answers.
    async fn open_audio_channel(&self) -> Result<(), ProtocolError>;

    /// Idempotent close.
    async fn close_audio_channel(&self);

    fn is_audio_channel_open(&self) -> bool;

    /// Send one encoded packet as a binary message.
    async fn send_audio(&self, payload: Vec<u8>) -> Result<(), ProtocolError>;

    async fn send_start_listening(&self, mode: ListeningMode) -> Result<(), ProtocolError>;

    async fn send_stop_listening(&self) -> Result<(), ProtocolError>;

    async fn send_abort(&self, reason: Option<AbortReason>) -> Result<(), ProtocolError>;

    /// Report a locally detected wake word.
    async fn send_wake_word_detected(&self, keyword: &str) -> Result<(), ProtocolError>;

    async fn send_iot_descriptors(
        &self,
        descriptors: serde_json::Value,
    ) -> Result<(), ProtocolError>;

    async fn send_iot_states(&self, states: serde_json::Value) -> Result<(), ProtocolError>;

    /// Decode target rate announced by the server hello.
    fn server_sample_rate(&self) -> u32;

    /// Session identifier assigned on handshake, if any.
    fn session_id(&self) -> Option<String>;
}
