//! Stateful linear-interpolation sample-rate converter.
//!
//! The capture path bridges the device rate down to the wire rate and the
//! playback path bridges the server's decode rate up to the device rate.
//! Both directions use the same [`Resampler`].
//!
//! The length contract is exact and integer:
//! `process(input).len() == input.len() * out_rate / in_rate`, matching
//! [`Resampler::output_len`] so downstream framing can pre-size buffers.
//! The fractional phase and the last input sample carry over between calls,
//! so feeding a long signal in chunks produces no seams at chunk borders.

// ---------------------------------------------------------------------------
// Resampler
// ---------------------------------------------------------------------------

/// Linear-interpolation rate converter with per-stream state.
///
/// # Example
///
/// ```rust
/// use voice_client::audio::Resampler;
///
/// let mut rs = Resampler::new(48_000, 16_000);
/// let out = rs.process(&vec![100i16; 1440]); // 30 ms at 48 kHz
/// assert_eq!(out.len(), 480);                // 30 ms at 16 kHz
/// ```
pub struct Resampler {
    in_rate: u32,
    out_rate: u32,
    /// Position of the next output sample in input-sample units, relative to
    /// the start of the next input chunk.  Negative values interpolate
    /// against the carried history sample.
    pos: f64,
    /// Last sample of the previous chunk.
    last: i16,
}

impl Resampler {
    /// Create a converter from `in_rate` Hz to `out_rate` Hz.
    ///
    /// # Panics
    ///
    /// Panics if either rate is zero.
    pub fn new(in_rate: u32, out_rate: u32) -> Self {
        assert!(in_rate > 0 && out_rate > 0, "sample rates must be > 0");
        Self {
            in_rate,
            out_rate,
            pos: 0.0,
            last: 0,
        }
    }

    /// Number of output samples `process` will produce for `input_len`
    /// input samples.
    pub fn output_len(&self, input_len: usize) -> usize {
        (input_len as u64 * self.out_rate as u64 / self.in_rate as u64) as usize
    }

    /// Convert one chunk.  Identity (and state-free) when the rates match.
    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        if self.in_rate == self.out_rate {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let n_out = self.output_len(input.len());
        let step = self.in_rate as f64 / self.out_rate as f64;
        let mut out = Vec::with_capacity(n_out);

        for _ in 0..n_out {
            let idx = self.pos.floor() as isize;
            let frac = self.pos - idx as f64;

            let a = self.sample_at(input, idx);
            let b = self.sample_at(input, idx + 1);
            out.push((a + (b - a) * frac).round() as i16);

            self.pos += step;
        }

        self.pos -= input.len() as f64;
        // Chunk lengths that do not divide the rate ratio leave a fractional
        // lag; cap it at one history sample so indexing stays in range.
        if self.pos < -1.0 {
            self.pos = -1.0;
        }
        self.last = input[input.len() - 1];
        out
    }

    /// Drop the carried phase and history sample (rate reconfiguration or a
    /// turn boundary).
    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.last = 0;
    }

    /// Configured input rate in Hz.
    pub fn in_rate(&self) -> u32 {
        self.in_rate
    }

    /// Configured output rate in Hz.
    pub fn out_rate(&self) -> u32 {
        self.out_rate
    }

    fn sample_at(&self, input: &[i16], idx: isize) -> f64 {
        if idx < 0 {
            self.last as f64
        } else if (idx as usize) < input.len() {
            input[idx as usize] as f64
        } else {
            input[input.len() - 1] as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
