//! Streaming energy-based Voice Activity Detection (VAD).
//!
//! Classifies each incoming frame by RMS amplitude and holds the "speaking"
//! state through short pauses (hangover), so a breath between words does not
//! flap the state.  The detector's output is surfaced for UI/telemetry; it
//! never gates the keyword spotter.

/// Streaming speech/non-speech classifier.
///
/// # Example
///
/// ```rust
/// use voice_client::wake::VadDetector;
///
/// let mut vad = VadDetector::new(0.01);
/// vad.update(&vec![8_000i16; 480]); // loud frame
/// assert!(vad.is_speaking());
/// ```
pub struct VadDetector {
    /// RMS amplitude threshold on normalized samples; frames below this are
    /// considered silence.
    rms_threshold: f32,
    /// Consecutive silent frames tolerated before `speaking` drops.
    hangover_frames: u32,
    speaking: bool,
    silent_run: u32,
}

impl VadDetector {
    /// Create a detector with the given RMS threshold and the default
    /// hangover (10 frames ≈ 300 ms at the 30 ms quantum).
    ///
    /// `rms_threshold` should be in `[0.0, 1.0]`.  A typical value is
    /// `0.01` for quiet microphones; use `0.02`–`0.05` in noisy rooms.
    pub fn new(rms_threshold: f32) -> Self {
        Self::with_hangover(rms_threshold, 10)
    }

    /// Create a detector with an explicit hangover frame count.
    pub fn with_hangover(rms_threshold: f32, hangover_frames: u32) -> Self {
        Self {
            rms_threshold,
            hangover_frames,
            speaking: false,
            silent_run: 0,
        }
    }

    /// Feed one frame and return the updated speaking state.
    pub fn update(&mut self, frame: &[i16]) -> bool {
        if Self::rms(frame) > self.rms_threshold {
            self.speaking = true;
            self.silent_run = 0;
        } else if self.speaking {
            self.silent_run += 1;
            if self.silent_run >= self.hangover_frames {
                self.speaking = false;
            }
        }
        self.speaking
    }

    /// Current speaking state without feeding audio.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Return to the initial (not speaking) state.
    pub fn reset(&mut self) {
        self.speaking = false;
        self.silent_run = 0;
    }

    fn rms(frame: &[i16]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let mean_sq: f32 = frame
            .iter()
            .map(|&s| {
                let x = s as f32 / 32_768.0;
                x * x
            })
            .sum::<f32>()
            / frame.len() as f32;
        mean_sq.sqrt()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
