//! Frame-oriented duplex audio engine.
//!
//! [`AudioIoEngine`] owns the capture and playback ring buffers and exposes
//! the frame API the controller works with: `try_read` hands out exactly one
//! wire-rate frame or nothing (backpressure, never a short frame), `write`
//! accepts decoded PCM of arbitrary length and wraps it into the playback
//! ring.  Device I/O itself lives behind the [`AudioBackend`] trait — one
//! implementation per platform backend, selected at startup — and backend
//! callback threads touch nothing but the SPSC rings and the shared
//! [`PlaybackControl`] flags.
//!
//! ```text
//! mic thread → capture ring → try_read → Resampler → frame (wire rate)
//! write → gain → Resampler → playback ring → speaker thread
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};
use thiserror::Error;

use crate::audio::buffer::{self, Consumer, OverflowPolicy, Producer};
use crate::audio::resample::Resampler;
use crate::config::{AudioConfig, SettingsStore};

/// Capture ring capacity in samples (~0.7 s at 48 kHz).
const CAPTURE_RING: usize = 1 << 15;
/// Playback ring capacity in samples (~1.4 s at 48 kHz).
const PLAYBACK_RING: usize = 1 << 16;
/// Upper bound on buffered raw-tap audio before oldest samples are dropped.
const RAW_TAP_LIMIT: usize = 1 << 15;

// ---------------------------------------------------------------------------
// AudioError
// ---------------------------------------------------------------------------

/// All errors that can arise from the audio device layer.
#[derive(Debug, Error)]
pub enum AudioError {
    /// No usable input device was found.
    #[error("no input device available")]
    NoInputDevice,

    /// No usable output device was found.
    #[error("no output device available")]
    NoOutputDevice,

    /// The requested device index is out of range.
    #[error("no input device at index {0}")]
    InvalidDeviceIndex(usize),

    /// The platform backend failed to build or start a stream.
    #[error("audio backend: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// PlaybackControl
// ---------------------------------------------------------------------------

/// Flags shared between the engine and the output callback thread.
///
/// The callback is the only party allowed to move the playback ring's read
/// cursor, so the engine requests a flush by setting `clear` and lets the
/// callback act on it at the next quantum.
#[derive(Debug, Default)]
pub struct PlaybackControl {
    /// Output emits silence while set; the stream stays allocated.
    pub muted: AtomicBool,
    /// One-shot request to discard everything queued in the playback ring.
    pub clear: AtomicBool,
}

// ---------------------------------------------------------------------------
// AudioBackend
// ---------------------------------------------------------------------------

/// Platform audio backend seam.
///
/// `start_input` pushes mono device-rate samples into the given producer
/// from a backend-owned thread and returns the device sample rate;
/// `start_output` drains the consumer from its own thread, honouring the
/// [`PlaybackControl`] flags, and returns the output device rate.
pub trait AudioBackend {
    fn start_input(&mut self, producer: Producer) -> Result<u32, AudioError>;
    fn stop_input(&mut self);
    fn start_output(
        &mut self,
        consumer: Consumer,
        control: Arc<PlaybackControl>,
    ) -> Result<u32, AudioError>;
    fn stop_output(&mut self);
    /// Names of the available input devices, in stable index order.
    fn input_devices(&self) -> Result<Vec<String>, AudioError>;
    /// Pick the input device used by the next `start_input`.
    fn select_input(&mut self, index: usize) -> Result<(), AudioError>;
}

// ---------------------------------------------------------------------------
// AudioIoEngine
// ---------------------------------------------------------------------------

/// Duplex engine over an [`AudioBackend`].
pub struct AudioIoEngine {
    backend: Box<dyn AudioBackend>,
    config: AudioConfig,
    store: SettingsStore,

    input_enabled: bool,
    capture_rx: Option<Consumer>,
    capture_rate: u32,
    capture_resampler: Option<Resampler>,
    /// Wire-rate samples awaiting a full frame.
    pending: Vec<i16>,
    /// Raw device-rate samples consumed since the last `take_raw_tap`.
    raw_tap: Vec<i16>,
    tap_enabled: bool,

    output_enabled: bool,
    playback_tx: Option<Producer>,
    playback_rate: u32,
    playback_control: Arc<PlaybackControl>,
    output_resampler: Option<Resampler>,
    source_rate: u32,
    volume: u8,
    last_write: Option<Instant>,
}

impl AudioIoEngine {
    pub fn new(backend: Box<dyn AudioBackend>, config: AudioConfig, store: SettingsStore) -> Self {
        let volume = store.output_volume();
        let source_rate = config.sample_rate;
        Self {
            backend,
            config,
            store,
            input_enabled: false,
            capture_rx: None,
            capture_rate: 0,
            capture_resampler: None,
            pending: Vec::new(),
            raw_tap: Vec::new(),
            tap_enabled: false,
            output_enabled: false,
            playback_tx: None,
            playback_rate: 0,
            playback_control: Arc::new(PlaybackControl::default()),
            output_resampler: None,
            source_rate,
            volume,
            last_write: None,
        }
    }

    /// Bring up the output stream; input starts on demand via
    /// [`enable_input`](Self::enable_input).
    ///
    /// Output-device absence at startup is fatal — the device cannot speak.
    pub fn start(&mut self) -> Result<(), AudioError> {
        let (producer, consumer) = buffer::channel(PLAYBACK_RING, OverflowPolicy::OverwriteOldest);
        self.playback_control.muted.store(true, Ordering::Relaxed);
        let rate = self
            .backend
            .start_output(consumer, Arc::clone(&self.playback_control))?;
        self.playback_tx = Some(producer);
        self.playback_rate = rate;
        self.output_resampler = Some(Resampler::new(self.source_rate, rate));
        self.output_enabled = true;

        if let Some(index) = self.store.input_device() {
            if let Err(e) = self.backend.select_input(index) {
                warn!("persisted input device {index} unavailable: {e}");
            }
        }

        info!("audio output started at {rate} Hz");
        Ok(())
    }

    // ----- Capture -----

    /// Enable or disable the capture path.
    ///
    /// Failure to open the input device is reported and input stays
    /// disabled — non-fatal by design contract.
    pub fn enable_input(&mut self, enabled: bool) {
        if enabled == self.input_enabled {
            return;
        }
        if enabled {
            match self.open_input() {
                Ok(()) => self.input_enabled = true,
                Err(e) => warn!("input unavailable, staying disabled: {e}"),
            }
        } else {
            self.backend.stop_input();
            self.capture_rx = None;
            self.capture_resampler = None;
            self.pending.clear();
            self.input_enabled = false;
        }
    }

    fn open_input(&mut self) -> Result<(), AudioError> {
        let (producer, consumer) = buffer::channel(CAPTURE_RING, OverflowPolicy::OverwriteOldest);
        let rate = self.backend.start_input(producer)?;
        self.capture_rx = Some(consumer);
        self.capture_rate = rate;
        self.capture_resampler = Some(Resampler::new(rate, self.config.sample_rate));
        self.pending.clear();
        info!("audio input started at {rate} Hz");
        Ok(())
    }

    pub fn is_input_enabled(&self) -> bool {
        self.input_enabled
    }

    /// Read exactly one wire-rate frame, or `None` when less than a frame is
    /// queued.  Absence of data is backpressure, not an error.
    pub fn try_read(&mut self) -> Option<Vec<i16>> {
        let frame_samples = self.config.frame_samples();
        let consumer = self.capture_rx.as_mut()?;

        let mut scratch = [0i16; 1024];
        loop {
            let n = consumer.pop(&mut scratch);
            if n == 0 {
                break;
            }
            let chunk = &scratch[..n];
            if self.tap_enabled {
                self.raw_tap.extend_from_slice(chunk);
                if self.raw_tap.len() > RAW_TAP_LIMIT {
                    let excess = self.raw_tap.len() - RAW_TAP_LIMIT;
                    self.raw_tap.drain(..excess);
                }
            }
            if let Some(rs) = self.capture_resampler.as_mut() {
                self.pending.extend(rs.process(chunk));
            }
        }

        if self.pending.len() < frame_samples {
            return None;
        }
        Some(self.pending.drain(..frame_samples).collect())
    }

    /// Discard everything captured but not yet handed out — the ring, the
    /// accumulated wire-rate samples and the resampler carry — so the next
    /// `try_read` frame starts from live audio.
    pub fn flush_capture(&mut self) {
        if let Some(consumer) = self.capture_rx.as_mut() {
            consumer.clear();
        }
        self.pending.clear();
        if let Some(rs) = self.capture_resampler.as_mut() {
            rs.reset();
        }
    }

    /// Turn the raw (pre-resample) capture tap on or off.  The wake-word
    /// detector consumes this stream.
    pub fn set_raw_tap(&mut self, enabled: bool) {
        self.tap_enabled = enabled;
        if !enabled {
            self.raw_tap.clear();
        }
    }

    /// Take all raw device-rate samples consumed since the last call.
    pub fn take_raw_tap(&mut self) -> Vec<i16> {
        std::mem::take(&mut self.raw_tap)
    }

    /// Device sample rate of the active input stream, if any.
    pub fn capture_rate(&self) -> Option<u32> {
        self.capture_rx.as_ref().map(|_| self.capture_rate)
    }

    /// Monotonic read cursor of the capture ring, for the far-end
    /// synchronizer.
    pub fn capture_read_cursor(&self) -> Option<usize> {
        self.capture_rx.as_ref().map(Consumer::read_cursor)
    }

    // ----- Playback -----

    /// Enable or disable the playback path.  Disabling flushes queued audio.
    pub fn enable_output(&mut self, enabled: bool) {
        self.output_enabled = enabled;
        if !enabled {
            self.clear_playback();
            self.playback_control.muted.store(true, Ordering::Relaxed);
        }
    }

    pub fn is_output_enabled(&self) -> bool {
        self.output_enabled
    }

    /// Queue decoded PCM (at the configured source rate) for playback.
    ///
    /// The first non-silent write unmutes the output device.
    pub fn write(&mut self, pcm: &[i16]) {
        if !self.output_enabled || pcm.is_empty() {
            return;
        }
        let Some(producer) = self.playback_tx.as_mut() else {
            return;
        };
        let Some(rs) = self.output_resampler.as_mut() else {
            return;
        };

        let gain = self.volume as i32;
        let scaled: Vec<i16> = rs
            .process(pcm)
            .into_iter()
            .map(|s| ((s as i32 * gain) / 100).clamp(i16::MIN as i32, i16::MAX as i32) as i16)
            .collect();

        if pcm.iter().any(|&s| s != 0) && self.playback_control.muted.load(Ordering::Relaxed) {
            self.playback_control.muted.store(false, Ordering::Relaxed);
        }
        producer.write(&scaled);
        self.last_write = Some(Instant::now());
    }

    /// Request a flush of everything queued but not yet played.
    pub fn clear_playback(&mut self) {
        self.playback_control.clear.store(true, Ordering::Relaxed);
    }

    /// Reconfigure the playback source rate (the server's decode rate).
    pub fn set_source_rate(&mut self, rate: u32) {
        if rate == self.source_rate {
            return;
        }
        self.source_rate = rate;
        if self.playback_rate > 0 {
            self.output_resampler = Some(Resampler::new(rate, self.playback_rate));
        }
        info!("playback source rate set to {rate} Hz");
    }

    /// Device sample rate of the output stream.
    pub fn playback_rate(&self) -> u32 {
        self.playback_rate
    }

    /// Monotonic write cursor of the playback ring, for the far-end
    /// synchronizer.
    pub fn playback_write_cursor(&self) -> Option<usize> {
        self.playback_tx.as_ref().map(Producer::write_cursor)
    }

    /// Periodic housekeeping, called once per control tick: mutes the output
    /// after the configured silence window so the amplifier can idle while
    /// the stream stays allocated.
    pub fn maintain(&mut self) {
        if self.playback_control.muted.load(Ordering::Relaxed) {
            return;
        }
        if let Some(at) = self.last_write {
            if at.elapsed().as_millis() as u64 >= self.config.output_mute_after_ms {
                self.playback_control.muted.store(true, Ordering::Relaxed);
            }
        }
    }

    // ----- Volume / devices -----

    /// Output volume, `0..=100`.
    pub fn volume(&self) -> u8 {
        self.volume
    }

    /// Set the output volume and persist it through the settings store.
    pub fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(100);
        if let Err(e) = self.store.set_output_volume(self.volume) {
            warn!("failed to persist volume: {e}");
        }
    }

    /// Names of the available input devices.
    pub fn list_devices(&self) -> Result<Vec<String>, AudioError> {
        self.backend.input_devices()
    }

    /// Switch to the input device at `index`, restarting the capture stream
    /// when input is currently enabled, and persist the choice.
    pub fn switch_input_device(&mut self, index: usize) -> Result<(), AudioError> {
        self.backend.stop_input();
        self.capture_rx = None;
        self.backend.select_input(index)?;
        if let Err(e) = self.store.set_input_device(Some(index)) {
            warn!("failed to persist input device: {e}");
        }
        if self.input_enabled {
            self.open_input()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockBackend  (test-only)
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
