//! Keyword spotter seam and the default energy/segment implementation.
//!
//! [`KeywordSpotter`] mirrors the streaming decode loop of model-based
//! spotters: audio is queued with `accept`, `is_ready` signals that a decode
//! step can run, and `decode` returns a keyword when one was recognised.
//! The production model is pluggable behind this trait; [`EnergySpotter`] is
//! the built-in implementation that recognises a configured keyword on any
//! speech segment of plausible keyword duration.

use log::{debug, trace};

/// Speech shorter than this cannot be a keyword.
const MIN_SPEECH_MS: u32 = 300;
/// Speech longer than this is a sentence, not a keyword.
const MAX_SPEECH_MS: u32 = 2_000;
/// Silence that ends an utterance.
const SILENCE_MS: u32 = 500;

// ---------------------------------------------------------------------------
// KeywordSpotter trait
// ---------------------------------------------------------------------------

/// Streaming keyword spotter interface.
///
/// Implementations must be `Send` so the detection task can own them.
pub trait KeywordSpotter: Send {
    /// Queue one raw capture frame.
    fn accept(&mut self, frame: &[i16]);
    /// Returns `true` when enough audio is queued for a decode step.
    fn is_ready(&self) -> bool;
    /// Run one decode step; `Some(keyword)` on a recognition.
    fn decode(&mut self) -> Option<String>;
    /// Drop all queued audio and decode state.
    fn reset(&mut self);
}

// ---------------------------------------------------------------------------
// EnergySpotter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    /// Waiting for speech.
    Idle,
    /// Inside a potential keyword utterance.
    Tracking,
    /// Inside an over-long utterance; re-arms only after a full silence gap,
    /// so the tail of a sentence cannot register as a keyword.
    Discarding,
}

/// Energy/segment spotter: a speech burst of keyword-like duration followed
/// by silence is reported as the first configured keyword.
pub struct EnergySpotter {
    keywords: Vec<String>,
    energy_threshold: f32,
    state: SegmentState,
    speech_samples: usize,
    silence_samples: usize,
    min_speech: usize,
    max_speech: usize,
    end_silence: usize,
    pending: Option<String>,
}

impl EnergySpotter {
    pub fn new(keywords: Vec<String>, sample_rate: u32, energy_threshold: f32) -> Self {
        let keywords: Vec<String> = keywords
            .into_iter()
            .map(|k| k.to_lowercase().trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        debug!("energy spotter initialised, keywords: {keywords:?}");

        let per_ms = sample_rate as usize / 1_000;
        Self {
            keywords,
            energy_threshold,
            state: SegmentState::Idle,
            speech_samples: 0,
            silence_samples: 0,
            min_speech: per_ms * MIN_SPEECH_MS as usize,
            max_speech: per_ms * MAX_SPEECH_MS as usize,
            end_silence: per_ms * SILENCE_MS as usize,
            pending: None,
        }
    }

    fn energy(frame: &[i16]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = frame
            .iter()
            .map(|&s| {
                let x = s as f32 / 32_768.0;
                x * x
            })
            .sum();
        (sum_sq / frame.len() as f32).sqrt()
    }
}

impl KeywordSpotter for EnergySpotter {
    fn accept(&mut self, frame: &[i16]) {
        if self.keywords.is_empty() || self.pending.is_some() {
            return;
        }

        let is_speech = Self::energy(frame) > self.energy_threshold;
        match self.state {
            SegmentState::Idle => {
                if is_speech {
                    self.state = SegmentState::Tracking;
                    self.speech_samples = frame.len();
                    self.silence_samples = 0;
                    trace!("speech onset");
                }
            }
            SegmentState::Tracking => {
                if is_speech {
                    self.speech_samples += frame.len();
                    self.silence_samples = 0;
                    // A burst longer than any keyword is ordinary speech.
                    if self.speech_samples > self.max_speech {
                        trace!("segment too long, discarding until silence");
                        self.state = SegmentState::Discarding;
                        self.silence_samples = 0;
                    }
                } else {
                    self.silence_samples += frame.len();
                    if self.silence_samples >= self.end_silence {
                        if self.speech_samples >= self.min_speech {
                            debug!(
                                "keyword-like segment complete ({} samples)",
                                self.speech_samples
                            );
                            self.pending = Some(self.keywords[0].clone());
                        }
                        self.state = SegmentState::Idle;
                    }
                }
            }
            SegmentState::Discarding => {
                if is_speech {
                    self.silence_samples = 0;
                } else {
                    self.silence_samples += frame.len();
                    if self.silence_samples >= self.end_silence {
                        self.state = SegmentState::Idle;
                    }
                }
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.pending.is_some()
    }

    fn decode(&mut self) -> Option<String> {
        self.pending.take()
    }

    fn reset(&mut self) {
        self.state = SegmentState::Idle;
        self.speech_samples = 0;
        self.silence_samples = 0;
        self.pending = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;
    const FRAME: usize = 480; // 30 ms

    fn spotter() -> EnergySpotter {
        EnergySpotter::new(vec!["Hey Assistant".into()], RATE, 0.01)
    }

    fn feed(s: &mut EnergySpotter, loud_ms: u32, silent_ms: u32) {
        for _ in 0..(loud_ms / 30) {
            s.accept(&[8_000i16; FRAME]);
        }
        for _ in 0..(silent_ms / 30) {
            s.accept(&[0i16; FRAME]);
        }
    }

    #[test]
    fn keyword_length_segment_is_recognised() {
        let mut s = spotter();
        feed(&mut s, 600, 600);
        assert!(s.is_ready());
        assert_eq!(s.decode().as_deref(), Some("hey assistant"));
        assert!(!s.is_ready(), "decode must consume the result");
    }

    #[test]
    fn too_short_segment_is_ignored() {
        let mut s = spotter();
        feed(&mut s, 90, 600); // below MIN_SPEECH_MS
        assert!(!s.is_ready());
        assert!(s.decode().is_none());
    }

    #[test]
    fn over_long_segment_is_ignored() {
        let mut s = spotter();
        feed(&mut s, 3_000, 600); // beyond MAX_SPEECH_MS
        assert!(!s.is_ready());
    }

    #[test]
    fn long_utterance_tail_does_not_retrigger() {
        let mut s = spotter();
        // A sentence overshoots the keyword window mid-way; the remaining
        // speech and the closing silence must not register.
        feed(&mut s, 3_000, 600);
        assert!(!s.is_ready());

        // After the silence gap a genuine keyword is recognised again.
        feed(&mut s, 600, 600);
        assert!(s.is_ready());
    }

    #[test]
    fn brief_pause_does_not_end_the_segment() {
        let mut s = spotter();
        feed(&mut s, 300, 90); // pause shorter than SILENCE_MS
        feed(&mut s, 300, 600);
        assert!(s.is_ready());
    }

    #[test]
    fn reset_discards_tracking_state() {
        let mut s = spotter();
        feed(&mut s, 600, 0);
        s.reset();
        feed(&mut s, 0, 600);
        assert!(!s.is_ready(), "segment survived reset");
    }

    #[test]
    fn no_keywords_never_detects() {
        let mut s = EnergySpotter::new(vec![], RATE, 0.01);
        feed(&mut s, 600, 600);
        assert!(!s.is_ready());
    }

    #[test]
    fn keywords_are_normalised() {
        let mut s = EnergySpotter::new(vec!["  HEY Assistant  ".into()], RATE, 0.01);
        feed(&mut s, 600, 600);
        assert_eq!(s.decode().as_deref(), Some("hey assistant"));
    }
}
