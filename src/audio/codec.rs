//! Opus packet framing on top of the `opus` codec.
//!
//! [`FrameEncoder`] accumulates PCM in a carry-over buffer and emits exactly
//! one packet per full Opus frame through a callback — it never blocks
//! waiting for more input and never encodes a partial frame.  With DTX
//! enabled, all-silent frames are skipped instead of encoded so the link
//! carries nothing during transmit silence.
//!
//! [`FrameDecoder`] turns one packet back into one PCM frame.  Both sides
//! expose `reset_state` so the controller can drop codec prediction history
//! at every listening/speaking turn boundary.

use log::warn;
use opus::{Application, Channels};
use thiserror::Error;

/// Largest packet libopus can produce for one frame.
const MAX_PACKET_BYTES: usize = 4_000;

/// Encoder complexity (0-10), fixed at construction.
const COMPLEXITY: i32 = 5;

/// Peak amplitude at or below which a frame counts as silence for DTX.
const DTX_PEAK: i16 = 32;

// ---------------------------------------------------------------------------
// CodecError
// ---------------------------------------------------------------------------

/// All errors that can arise from the codec subsystem.
#[derive(Debug, Error)]
pub enum CodecError {
    /// libopus rejected the configuration or the data.
    #[error("opus: {0}")]
    Opus(#[from] opus::Error),

    /// Only mono and stereo streams are representable.
    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u16),
}

fn channels_of(count: u16) -> Result<Channels, CodecError> {
    match count {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        other => Err(CodecError::UnsupportedChannels(other)),
    }
}

// ---------------------------------------------------------------------------
// EncodedPacket
// ---------------------------------------------------------------------------

/// One encoded Opus frame ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    /// Opaque codec payload, sent as one binary message.
    pub payload: Vec<u8>,
    /// Frame duration tag in milliseconds.
    pub duration_ms: u32,
}

// ---------------------------------------------------------------------------
// FrameEncoder
// ---------------------------------------------------------------------------

/// Accumulating Opus encoder (VoIP application).
pub struct FrameEncoder {
    encoder: opus::Encoder,
    /// Samples per frame across all channels.
    frame_samples: usize,
    frame_ms: u32,
    pending: Vec<i16>,
    dtx: bool,
}

impl FrameEncoder {
    /// Create an encoder for `sample_rate` Hz / `channels` with `frame_ms`
    /// packets.  `frame_ms` must be a duration Opus accepts (10/20/40/60).
    pub fn new(sample_rate: u32, channels: u16, frame_ms: u32, dtx: bool) -> Result<Self, CodecError> {
        let mut encoder = opus::Encoder::new(sample_rate, channels_of(channels)?, Application::Voip)?;
        encoder.set_complexity(COMPLEXITY)?;
        let frame_samples = (sample_rate / 1_000) as usize * frame_ms as usize * channels as usize;
        Ok(Self {
            encoder,
            frame_samples,
            frame_ms,
            pending: Vec::with_capacity(frame_samples * 2),
            dtx,
        })
    }

    /// Samples per full frame (all channels interleaved).
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Number of samples currently carried over, waiting for a full frame.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    /// Feed PCM and emit one packet per completed frame.
    ///
    /// A frame that fails to encode is dropped with a warning; the session
    /// continues — codec errors are per-packet, never fatal.
    pub fn push(&mut self, pcm: &[i16], mut on_packet: impl FnMut(EncodedPacket)) {
        self.pending.extend_from_slice(pcm);

        let mut consumed = 0;
        while self.pending.len() - consumed >= self.frame_samples {
            let frame = &self.pending[consumed..consumed + self.frame_samples];
            consumed += self.frame_samples;

            if self.dtx && frame.iter().all(|&s| s.unsigned_abs() <= DTX_PEAK as u16) {
                continue;
            }

            let mut payload = vec![0u8; MAX_PACKET_BYTES];
            match self.encoder.encode(frame, &mut payload) {
                Ok(written) => {
                    payload.truncate(written);
                    on_packet(EncodedPacket {
                        payload,
                        duration_ms: self.frame_ms,
                    });
                }
                Err(e) => warn!("opus encode failed, dropping frame: {e}"),
            }
        }
        self.pending.drain(..consumed);
    }

    /// Clear the Opus prediction state and the carry-over buffer so no codec
    /// history leaks across a turn boundary.
    pub fn reset_state(&mut self) {
        self.pending.clear();
        if let Err(e) = self.encoder.reset_state() {
            warn!("opus encoder reset failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// FrameDecoder
// ---------------------------------------------------------------------------

/// One-packet-in, one-frame-out Opus decoder.
pub struct FrameDecoder {
    decoder: opus::Decoder,
    channels: usize,
    /// Samples per channel per frame.
    frame_per_channel: usize,
}

impl FrameDecoder {
    /// Create a decoder for `sample_rate` Hz / `channels` expecting
    /// `frame_ms` packets.
    pub fn new(sample_rate: u32, channels: u16, frame_ms: u32) -> Result<Self, CodecError> {
        let decoder = opus::Decoder::new(sample_rate, channels_of(channels)?)?;
        Ok(Self {
            decoder,
            channels: channels as usize,
            frame_per_channel: (sample_rate / 1_000) as usize * frame_ms as usize,
        })
    }

    /// Decode one packet into one interleaved PCM frame.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
        let mut pcm = vec![0i16; self.frame_per_channel * self.channels];
        let per_channel = self.decoder.decode(packet, &mut pcm, false)?;
        pcm.truncate(per_channel * self.channels);
        Ok(pcm)
    }

    /// Drop decoder prediction state at a turn boundary.
    pub fn reset_state(&mut self) {
        if let Err(e) = self.decoder.reset_state() {
            warn!("opus decoder reset failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;
    const FRAME_MS: u32 = 60;
    const FRAME: usize = 960; // 60 ms mono at 16 kHz

    fn encoder(dtx: bool) -> FrameEncoder {
        FrameEncoder::new(RATE, 1, FRAME_MS, dtx).expect("encoder")
    }

    /// 440 Hz tone at moderate amplitude, `len` samples.
    fn tone(len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f32 / RATE as f32;
                ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8_000.0) as i16
            })
            .collect()
    }

    // ---- Framing ---------------------------------------------------------------

    #[test]
    fn one_sample_short_produces_no_packet() {
        let mut enc = encoder(false);
        let mut packets = 0;
        enc.push(&tone(FRAME - 1), |_| packets += 1);
        assert_eq!(packets, 0);
        assert_eq!(enc.pending_samples(), FRAME - 1);
    }

    #[test]
    fn exactly_one_frame_produces_one_packet() {
        let mut enc = encoder(false);
        let mut packets = Vec::new();
        enc.push(&tone(FRAME), |p| packets.push(p));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].duration_ms, FRAME_MS);
        assert!(!packets[0].payload.is_empty());
        assert_eq!(enc.pending_samples(), 0);
    }

    #[test]
    fn three_frames_plus_remainder() {
        let mut enc = encoder(false);
        let mut packets = 0;
        enc.push(&tone(3 * FRAME + 5), |_| packets += 1);
        assert_eq!(packets, 3);
        assert_eq!(enc.pending_samples(), 5);
    }

    #[test]
    fn carry_over_completes_across_calls() {
        let mut enc = encoder(false);
        let signal = tone(FRAME);
        let mut packets = 0;

        enc.push(&signal[..600], |_| packets += 1);
        assert_eq!(packets, 0);
        enc.push(&signal[600..], |_| packets += 1);
        assert_eq!(packets, 1);
    }

    // ---- DTX ----------------------------------------------------------------------

    #[test]
    fn dtx_skips_silent_frames() {
        let mut enc = encoder(true);
        let mut packets = 0;
        enc.push(&vec![0i16; 2 * FRAME], |_| packets += 1);
        assert_eq!(packets, 0);
        assert_eq!(enc.pending_samples(), 0);
    }

    #[test]
    fn dtx_passes_voiced_frames() {
        let mut enc = encoder(true);
        let mut packets = 0;
        enc.push(&tone(FRAME), |_| packets += 1);
        assert_eq!(packets, 1);
    }

    #[test]
    fn dtx_disabled_encodes_silence() {
        let mut enc = encoder(false);
        let mut packets = 0;
        enc.push(&vec![0i16; FRAME], |_| packets += 1);
        assert_eq!(packets, 1);
    }

    // ---- reset_state -----------------------------------------------------------------

    #[test]
    fn reset_clears_carry_over() {
        let mut enc = encoder(false);
        enc.push(&tone(100), |_| {});
        assert_eq!(enc.pending_samples(), 100);

        enc.reset_state();
        assert_eq!(enc.pending_samples(), 0);
    }

    // ---- Round trip -------------------------------------------------------------------

    #[test]
    fn round_trip_preserves_frame_length() {
        let mut enc = encoder(false);
        let mut dec = FrameDecoder::new(RATE, 1, FRAME_MS).expect("decoder");

        let mut payloads = Vec::new();
        enc.push(&tone(2 * FRAME), |p| payloads.push(p.payload));
        assert_eq!(payloads.len(), 2);

        for payload in &payloads {
            let pcm = dec.decode(payload).expect("decode");
            assert_eq!(pcm.len(), FRAME);
        }
    }

    #[test]
    fn round_trip_tone_is_lossy_but_bounded() {
        let mut enc = encoder(false);
        let mut dec = FrameDecoder::new(RATE, 1, FRAME_MS).expect("decoder");

        let signal = tone(2 * FRAME);
        let mut decoded = Vec::new();
        enc.push(&signal, |p| {
            decoded.extend(dec.decode(&p.payload).expect("decode"));
        });

        // The codec is lossy and has algorithmic delay; require only that a
        // clearly audible tone comes out the other side, not bit equality.
        let energy: f64 = decoded[FRAME..]
            .iter()
            .map(|&s| (s as f64) * (s as f64))
            .sum::<f64>()
            / FRAME as f64;
        assert!(energy.sqrt() > 1_000.0, "decoded tone too quiet: {energy}");
    }

    // ---- Construction errors -------------------------------------------------------------

    #[test]
    fn three_channels_rejected() {
        let result = FrameEncoder::new(RATE, 3, FRAME_MS, false);
        assert!(matches!(result, Err(CodecError::UnsupportedChannels(3))));
    }
}
