//! Voice-assistant device client.
//!
//! Captures microphone audio, cancels loudspeaker echo, transcodes to Opus
//! and streams it to a conversational server over a persistent WebSocket,
//! playing back synthesized speech while a wake-word detector and a
//! finite-state controller sequence the whole exchange.
//!
//! # Architecture
//!
//! ```text
//! mic ─ cpal thread ─ capture ring ─┐
//!                                   ├─ AudioIoEngine ── Resampler ── AEC ── Opus ── WebSocket
//! speaker ─ cpal thread ─ playback ring ─┘                    ▲                        │
//!                                                             │                        ▼
//!              WakeWordDetector ── ConversationController ── TaskLanes ◄── decode ◄── server
//! ```
//!
//! The `controller` module owns all session state on a single 30 ms control
//! loop; audio device threads communicate with it exclusively through
//! single-producer/single-consumer ring buffers.

pub mod activation;
pub mod audio;
pub mod config;
pub mod controller;
pub mod display;
pub mod protocol;
pub mod wake;

pub use activation::{ActivationService, ActivationStatus, PreActivated};
pub use audio::{AudioIoEngine, CpalBackend};
pub use config::AppConfig;
pub use controller::{ConversationController, DeviceState, UserCommand};
pub use display::{LogDisplay, StatusDisplay};
pub use protocol::{Protocol, ProtocolEvent, WebSocketProtocol};
pub use wake::{WakeEvent, WakeWordDetector};
