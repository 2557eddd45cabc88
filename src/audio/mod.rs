//! Duplex audio pipeline — ring buffers, resampling, Opus framing, echo
//! cancellation and the device engine that ties them together.
//!
//! # Pipeline
//!
//! ```text
//! mic → cpal thread → capture ring → AudioIoEngine::try_read
//!     → Resampler (device → wire) → EchoCanceller → FrameEncoder → wire
//!
//! wire → FrameDecoder → AudioIoEngine::write → Resampler (source → device)
//!      → playback ring → cpal thread → speaker
//! ```
//!
//! The rings are the only cross-thread state; `FarEndSync` pairs their
//! cursors each tick so the echo canceller sees time-aligned far-end and
//! near-end frames.

pub mod aec;
pub mod buffer;
pub mod codec;
pub mod cpal_backend;
pub mod engine;
pub mod resample;

pub use aec::{EchoCanceller, FarEndSync};
pub use buffer::OverflowPolicy;
pub use codec::{CodecError, EncodedPacket, FrameDecoder, FrameEncoder};
pub use cpal_backend::CpalBackend;
pub use engine::{AudioBackend, AudioError, AudioIoEngine, PlaybackControl};
pub use resample::Resampler;
