//! Gemini Live API protocol types
//!
//! JSON payloads exchanged with the `BidiGenerateContent` WebSocket endpoint.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://generativelanguage.googleapis.com/ws/...BidiGenerateContent?key=...`
//! 2. Send `setup` (model, response modalities, system instruction)
//! 3. Stream audio via `realtimeInput.audio`
//! 4. Receive `serverContent` (model turn parts, transcriptions, `turnComplete`)
//! 5. Send `realtimeInput.audioStreamEnd` once recording stops

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use super::transport::Frame;
use super::StreamingError;
use crate::audio::AudioChunk;

/// Gemini Live API endpoint (the key is appended as a query parameter)
pub const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Model used when no other is configured
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";

/// Session setup sent as the first message on every connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    /// Fully qualified model name (`models/...`)
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

impl SetupConfig {
    pub fn new(model: &str, modalities: &[String], system_instruction: &str) -> Self {
        Self {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: modalities.to_vec(),
            },
            system_instruction: Content {
                parts: vec![Part {
                    text: system_instruction.to_string(),
                }],
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Output modalities, e.g. `["TEXT"]`
    pub response_modalities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub text: String,
}

/// Base64 audio payload with its MIME type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_stream_end: Option<bool>,
}

/// Shape on the wire: `{"setup": ...}` or `{"realtimeInput": ...}`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum WireMessage<'a> {
    Setup(&'a SetupConfig),
    RealtimeInput(RealtimeInput),
}

// ============================================================================
// Client Messages (sent TO Gemini)
// ============================================================================

/// Messages sent from the client over the session
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Session configuration, always first
    Setup(SetupConfig),
    /// One captured chunk of PCM audio
    Audio(AudioChunk),
    /// End of the audio stream, always last before close
    StreamEnd,
}

impl OutboundMessage {
    /// Serialize to the JSON payload the service expects
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let wire = match self {
            OutboundMessage::Setup(config) => WireMessage::Setup(config),
            OutboundMessage::Audio(chunk) => WireMessage::RealtimeInput(RealtimeInput {
                audio: Some(Blob {
                    mime_type: chunk.format.mime_type(),
                    data: STANDARD.encode(&chunk.data),
                }),
                audio_stream_end: None,
            }),
            OutboundMessage::StreamEnd => WireMessage::RealtimeInput(RealtimeInput {
                audio: None,
                audio_stream_end: Some(true),
            }),
        };
        serde_json::to_string(&wire)
    }

    /// Frame this message as a single text frame
    pub fn to_frame(&self) -> Result<Frame, StreamingError> {
        self.to_json()
            .map(Frame::Text)
            .map_err(|e| StreamingError::ProtocolError(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Setup(_) => "setup",
            OutboundMessage::Audio(_) => "audio",
            OutboundMessage::StreamEnd => "audioStreamEnd",
        }
    }
}

// ============================================================================
// Server Messages (received FROM Gemini)
// ============================================================================

/// A server message; every field is optional since one message carries one
/// of several mutually exclusive payloads
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// Present (as `{}`) once the setup was accepted
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    /// The server is about to disconnect
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ModelPart>,
}

/// A part of a model turn; non-text parts (inline audio) are ignored
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelPart {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Concatenated text parts of the model turn, if any
    pub fn model_text(&self) -> Option<String> {
        let turn = self.server_content.as_ref()?.model_turn.as_ref()?;
        let text: String = turn.parts.iter().filter_map(|p| p.text.as_deref()).collect();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .map_or(false, |c| c.turn_complete)
    }

    /// The model stopped its turn early (the user started speaking)
    pub fn interrupted(&self) -> bool {
        self.server_content.as_ref().map_or(false, |c| c.interrupted)
    }

    pub fn input_transcript(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .input_transcription
            .as_ref()
            .map(|t| t.text.as_str())
            .filter(|t| !t.is_empty())
    }

    pub fn output_transcript(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .output_transcription
            .as_ref()
            .map(|t| t.text.as_str())
            .filter(|t| !t.is_empty())
    }
}
