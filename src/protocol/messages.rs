//! JSON control messages exchanged on the text channel.
//!
//! Client→server messages are plain structs with a fixed `type` field;
//! server→client messages deserialize into [`ServerMessage`], tagged by the
//! same field.  Binary WebSocket messages carry one Opus packet each and
//! never pass through this module.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Shared enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

/// How a listening turn ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListeningMode {
    /// Server decides when the utterance is over.
    AutoStop,
    /// Client sends an explicit stop.
    ManualStop,
    /// Continuous listening.
    AlwaysOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    WakeWordDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
}

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AudioParams {
    pub format: &'static str,
    pub sample_rate: u32,
    pub channels: u16,
    /// Packet duration in milliseconds.
    pub frame_duration: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientHello {
    #[serde(rename = "type")]
    kind: &'static str,
    pub version: u32,
    pub transport: &'static str,
    pub audio_params: AudioParams,
}

impl ClientHello {
    pub fn new(sample_rate: u32, channels: u16, frame_duration: u32) -> Self {
        Self {
            kind: "hello",
            version: PROTOCOL_VERSION,
            transport: "websocket",
            audio_params: AudioParams {
                format: "opus",
                sample_rate,
                channels,
                frame_duration,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "type")]
    kind: &'static str,
    pub state: ListenState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ListeningMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ListenMessage {
    pub fn start(session_id: Option<String>, mode: ListeningMode) -> Self {
        Self {
            session_id,
            kind: "listen",
            state: ListenState::Start,
            mode: Some(mode),
            text: None,
        }
    }

    pub fn stop(session_id: Option<String>) -> Self {
        Self {
            session_id,
            kind: "listen",
            state: ListenState::Stop,
            mode: None,
            text: None,
        }
    }

    /// Reports a locally detected wake word to the server.
    pub fn detect(session_id: Option<String>, keyword: &str) -> Self {
        Self {
            session_id,
            kind: "listen",
            state: ListenState::Detect,
            mode: None,
            text: Some(keyword.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AbortMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<AbortReason>,
}

impl AbortMessage {
    pub fn new(session_id: Option<String>, reason: Option<AbortReason>) -> Self {
        Self {
            session_id,
            kind: "abort",
            reason,
        }
    }
}

/// Device capability descriptors or current states for the `iot` channel.
/// The payload shape is owned by the device integration, not the transport.
#[derive(Debug, Clone, Serialize)]
pub struct IotMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptors: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub states: Option<serde_json::Value>,
}

impl IotMessage {
    pub fn descriptors(session_id: Option<String>, descriptors: serde_json::Value) -> Self {
        Self {
            session_id,
            kind: "iot",
            descriptors: Some(descriptors),
            states: None,
        }
    }

    pub fn states(session_id: Option<String>, states: serde_json::Value) -> Self {
        Self {
            session_id,
            kind: "iot",
            descriptors: None,
            states: Some(states),
        }
    }
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HelloAudioParams {
    pub sample_rate: Option<u32>,
}

/// Control messages the server sends on the text channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        transport: Option<String>,
        session_id: Option<String>,
        audio_params: Option<HelloAudioParams>,
    },
    Tts {
        state: TtsState,
        text: Option<String>,
    },
    Stt {
        text: Option<String>,
    },
    Llm {
        text: Option<String>,
        emotion: Option<String>,
    },
    Iot {
        commands: Option<serde_json::Value>,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
