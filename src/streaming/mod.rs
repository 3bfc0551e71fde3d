//! Duplex streaming session with the Gemini Live API
//!
//! This module owns the WebSocket conversation: framing outbound setup/audio
//! messages, dispatching inbound frames, and tearing the session down.
//!
//! # Architecture
//!
//! ```text
//! cpal callback ──try_send──▶ bounded queue ──▶ LiveSession::stream_audio()
//!                                                        │ (sink mutex)
//!                                                        ▼
//!                                                    WebSocket
//!                                                        │
//!                                                        ▼
//!                         presenter ◀──channel── receive_loop() (own task)
//! ```
//!
//! # Teardown
//!
//! - Recording stops: the queue closes and `stream_audio` returns
//! - `signal_end` sends `audioStreamEnd` exactly once
//! - The session token is cancelled; the receive loop keeps reading for the
//!   grace window so trailing responses still reach the console
//! - `close` sends a normal-closure frame once, no matter how often it is called

mod protocol;
mod receiver;
mod session;
mod transport;

pub use protocol::{
    Blob, Content, GenerationConfig, ModelTurn, OutboundMessage, Part, ServerContent,
    ServerMessage, SetupConfig, Transcription, DEFAULT_ENDPOINT, DEFAULT_MODEL,
};
pub use receiver::{receive_loop, InboundMessage, ReceiveOutcome};
pub use session::{LiveSession, StreamStats};
pub use transport::{
    endpoint_url, open_websocket, Frame, FrameSink, FrameStream, WsSink, WsStream,
    NORMAL_CLOSURE,
};

/// Errors that can occur during a streaming session
#[derive(Debug, Clone, PartialEq)]
pub enum StreamingError {
    /// No API key could be resolved
    MissingApiKey,
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// A control payload was malformed, rejected, or sent out of order
    ProtocolError(String),
    /// A frame could not be sent or received
    TransportError(String),
    /// The channel was observed closed
    Disconnected(String),
    /// The session was cancelled (normal teardown)
    Cancelled,
}

impl StreamingError {
    /// Whether this error means the channel can no longer carry frames
    pub fn is_disconnect(&self) -> bool {
        matches!(self, StreamingError::Disconnected(_))
    }
}

impl std::fmt::Display for StreamingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingError::MissingApiKey => {
                write!(
                    f,
                    "Gemini API key not configured. Set GEMINI_API_KEY or store it in the system keyring."
                )
            }
            StreamingError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to Gemini Live API: {}", e)
            }
            StreamingError::ProtocolError(e) => write!(f, "Protocol error: {}", e),
            StreamingError::TransportError(e) => write!(f, "Transport error: {}", e),
            StreamingError::Disconnected(e) => write!(f, "WebSocket disconnected: {}", e),
            StreamingError::Cancelled => write!(f, "Session cancelled"),
        }
    }
}

impl std::error::Error for StreamingError {}
