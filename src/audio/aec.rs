//! Acoustic echo cancellation: adaptive filter plus far-end/near-end
//! synchronization.
//!
//! [`EchoCanceller`] is a black box with two entry points: `buffer_farend`
//! primes the internal echo model with what the loudspeaker is about to
//! play, and `process` subtracts the modeled echo from a microphone frame.
//! Internally it runs an NLMS adaptive filter over a far-end delay line; the
//! filter is replaceable without touching any caller.
//!
//! [`FarEndSync`] owns the hard part — keeping the two streams aligned.
//! Each control tick it samples the playback ring's write cursor and the
//! capture ring's read cursor, works out how many new frames appeared on
//! each side since the previous tick, and tells the caller to feed exactly
//! `min(far, near)` matched pairs.  The residual clock offset between the
//! two buffers is tracked with an exponentially smoothed estimate rather
//! than a fixed constant, because device buffering latency drifts.

use std::collections::VecDeque;

use log::warn;

/// Filter length in samples.  At 16 kHz this models up to 16 ms of
/// room/device echo tail beyond the synchronizer's alignment.
const FILTER_TAPS: usize = 256;

/// NLMS adaptation step size.
const STEP_SIZE: f32 = 0.05;

/// Regularization added to the reference energy to keep the update stable
/// on near-silent frames.
const EPSILON: f32 = 1e-3;

/// Upper bound for the smoothed latency estimate.
const MAX_LATENCY_MS: u16 = 500;

// ---------------------------------------------------------------------------
// EchoCanceller
// ---------------------------------------------------------------------------

/// NLMS echo canceller.  When disabled it is an exact passthrough.
pub struct EchoCanceller {
    enabled: bool,
    sample_rate: u32,
    weights: Vec<f32>,
    /// Most recent far-end samples, newest first, bounded to `FILTER_TAPS`.
    line: VecDeque<f32>,
    /// Far-end samples queued but not yet consumed by `process`.
    farend: VecDeque<f32>,
    starved_logged: bool,
}

impl EchoCanceller {
    pub fn new(sample_rate: u32, enabled: bool) -> Self {
        Self {
            enabled,
            sample_rate,
            weights: vec![0.0; FILTER_TAPS],
            line: VecDeque::with_capacity(FILTER_TAPS),
            farend: VecDeque::new(),
            starved_logged: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Prime the echo model with samples queued for playback.
    ///
    /// The queue is consumed in lockstep by `process`; anything beyond one
    /// latency window of backlog is discarded so a stalled capture path
    /// cannot grow it without bound.
    pub fn buffer_farend(&mut self, samples: &[i16]) {
        if !self.enabled {
            return;
        }
        self.farend
            .extend(samples.iter().map(|&s| s as f32 / 32_768.0));

        let max_backlog =
            (self.sample_rate as usize / 1_000) * MAX_LATENCY_MS as usize + FILTER_TAPS;
        while self.farend.len() > max_backlog {
            self.farend.pop_front();
        }
    }

    /// Subtract modeled echo from one near-end frame.
    ///
    /// `latency_ms` is the synchronizer's current clock-offset estimate; it
    /// bounds how much queued far-end reference is considered current.  A
    /// frame with no far-end reference available is forwarded uncancelled
    /// (logged once) — dropping microphone audio is never acceptable.
    pub fn process(&mut self, near: &[i16], latency_ms: u16) -> Vec<i16> {
        if !self.enabled {
            return near.to_vec();
        }

        // Keep the reference queue from running further ahead than the
        // estimated latency plus one frame; excess is stale audio that was
        // already played out.
        let latency_samples = (self.sample_rate as usize / 1_000) * latency_ms as usize;
        while self.farend.len() > latency_samples + near.len() {
            let stale = self.farend.pop_front();
            if let Some(s) = stale {
                self.line.push_front(s);
                self.line.truncate(FILTER_TAPS);
            }
        }

        if self.farend.is_empty() && !self.starved_logged {
            warn!("echo canceller has no far-end reference; passing frame through");
            self.starved_logged = true;
        }

        let mut out = Vec::with_capacity(near.len());
        for &n in near {
            let x = self.farend.pop_front().unwrap_or(0.0);
            self.line.push_front(x);
            self.line.truncate(FILTER_TAPS);

            let d = n as f32 / 32_768.0;
            let mut y = 0.0f32;
            let mut energy = EPSILON;
            for (w, &s) in self.weights.iter().zip(self.line.iter()) {
                y += w * s;
                energy += s * s;
            }

            let e = d - y;
            let gain = STEP_SIZE * e / energy;
            for (w, &s) in self.weights.iter_mut().zip(self.line.iter()) {
                *w += gain * s;
            }

            out.push((e * 32_768.0).clamp(-32_768.0, 32_767.0) as i16);
        }
        out
    }

    /// Drop the adaptive filter and all queued reference audio.
    pub fn reset(&mut self) {
        self.weights.iter_mut().for_each(|w| *w = 0.0);
        self.line.clear();
        self.farend.clear();
        self.starved_logged = false;
    }
}

// ---------------------------------------------------------------------------
// FarEndSync
// ---------------------------------------------------------------------------

/// Per-tick cursor bookkeeping that pairs far-end and near-end frames.
pub struct FarEndSync {
    far_frame_samples: usize,
    near_frame_samples: usize,
    last_far_cursor: usize,
    last_near_cursor: usize,
    /// Whole frames seen but not yet paired, per side.
    far_pending: usize,
    near_pending: usize,
    /// Exponentially smoothed far-lead estimate in milliseconds.
    offset_ms: f64,
    smoothing: f64,
    frame_ms: u32,
    primed: bool,
}

impl FarEndSync {
    /// `far_frame_samples` / `near_frame_samples` convert ring cursors (which
    /// count samples at their own rates) into frames of the shared quantum.
    pub fn new(far_frame_samples: usize, near_frame_samples: usize, frame_ms: u32) -> Self {
        assert!(far_frame_samples > 0 && near_frame_samples > 0);
        Self {
            far_frame_samples,
            near_frame_samples,
            last_far_cursor: 0,
            last_near_cursor: 0,
            far_pending: 0,
            near_pending: 0,
            offset_ms: 0.0,
            smoothing: 0.1,
            frame_ms,
            primed: false,
        }
    }

    /// Record the current cursors and return how many matched frame pairs to
    /// feed this tick.
    ///
    /// The first observation only establishes the baseline and returns zero.
    pub fn tick(&mut self, far_cursor: usize, near_cursor: usize) -> usize {
        if !self.primed {
            self.last_far_cursor = far_cursor;
            self.last_near_cursor = near_cursor;
            self.primed = true;
            return 0;
        }

        // Advance the stored cursors only by whole frames, so samples short
        // of a frame stay banked and complete on a later tick.
        let far_new = far_cursor.saturating_sub(self.last_far_cursor);
        let near_new = near_cursor.saturating_sub(self.last_near_cursor);
        let far_frames = far_new / self.far_frame_samples;
        let near_frames = near_new / self.near_frame_samples;
        self.last_far_cursor += far_frames * self.far_frame_samples;
        self.last_near_cursor += near_frames * self.near_frame_samples;

        self.far_pending += far_frames;
        self.near_pending += near_frames;

        // Smooth the instantaneous far-lead; clamp anything negative or
        // implausible instead of propagating it into the filter.
        let lead_frames = self.far_pending as f64 - self.near_pending as f64;
        let lead_ms = lead_frames * self.frame_ms as f64;
        self.offset_ms += self.smoothing * (lead_ms - self.offset_ms);
        self.offset_ms = self.offset_ms.clamp(0.0, MAX_LATENCY_MS as f64);

        let matched = self.far_pending.min(self.near_pending);
        self.far_pending -= matched;
        self.near_pending -= matched;
        matched
    }

    /// Current clock-offset estimate, clamped to `0..=500` ms.
    pub fn latency_ms(&self) -> u16 {
        self.offset_ms.round() as u16
    }

    /// Forget all cursor history (device switch or rate change).
    pub fn reset(&mut self) {
        self.far_pending = 0;
        self.near_pending = 0;
        self.offset_ms = 0.0;
        self.primed = false;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
