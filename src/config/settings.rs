//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Settings for the duplex audio path: capture quantum, wire format, echo
/// cancellation and transmit silence suppression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Wire sample rate in Hz sent to the server (the capture path resamples
    /// from the device rate down/up to this).
    pub sample_rate: u32,
    /// Channel count on the wire.  The pipeline is mono end to end.
    pub channels: u16,
    /// Capture quantum in milliseconds — one `try_read` frame, and the cadence
    /// of the control loop tick.
    pub frame_ms: u32,
    /// Opus packet duration in milliseconds.  Must be one of the durations
    /// Opus accepts (10, 20, 40, 60); the encoder accumulates capture frames
    /// until one packet's worth is available.
    pub packet_ms: u32,
    /// Skip encoding of all-silent packets instead of sending them.
    pub dtx: bool,
    /// Run the echo canceller on the capture path.  Disable on half-duplex
    /// hardware where no loudspeaker leakage exists.
    pub echo_cancel: bool,
    /// Mute the output device after this many milliseconds with no playback
    /// write.  The stream stays allocated so playback can resume instantly.
    pub output_mute_after_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_ms: 30,
            packet_ms: 60,
            dtx: true,
            echo_cancel: true,
            output_mute_after_ms: 1_000,
        }
    }
}

impl AudioConfig {
    /// Samples per capture frame at the wire rate.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate / 1_000) as usize * self.frame_ms as usize * self.channels as usize
    }

    /// Samples per encoded packet at the wire rate.
    pub fn packet_samples(&self) -> usize {
        (self.sample_rate / 1_000) as usize * self.packet_ms as usize * self.channels as usize
    }
}

// ---------------------------------------------------------------------------
// WakeConfig
// ---------------------------------------------------------------------------

/// Settings for the wake-word detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeConfig {
    /// Whether wake-word detection runs at all.  When `false` the device is
    /// driven purely by explicit user commands.
    pub enabled: bool,
    /// Keywords the spotter recognises.  The first match wins.
    pub keywords: Vec<String>,
    /// RMS energy threshold above which a frame counts as speech.
    pub energy_threshold: f32,
    /// Detection cycle interval in milliseconds.
    pub poll_ms: u64,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keywords: vec!["hey assistant".into()],
            energy_threshold: 0.03,
            poll_ms: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Connection settings for the conversational server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:8000/voice`.
    pub url: String,
    /// Bearer token sent in the `Authorization` header.
    pub token: String,
    /// Stable hardware identifier sent in the `Device-Id` header.
    pub device_id: String,
    /// Per-install identifier sent in the `Client-Id` header.
    pub client_id: String,
    /// Seconds to wait for the server `hello` after the socket opens.
    pub handshake_timeout_secs: u64,
    /// Seconds of total silence after which the channel is considered stale.
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/voice".into(),
            token: String::new(),
            device_id: "00:00:00:00:00:00".into(),
            client_id: "default".into(),
            handshake_timeout_secs: 10,
            idle_timeout_secs: 120,
        }
    }
}

// ---------------------------------------------------------------------------
// ActivationConfig
// ---------------------------------------------------------------------------

/// Settings for the startup activation gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// Whether activation is required before the device goes `Idle`.
    pub required: bool,
    /// Maximum activation-check attempts before giving up.
    pub max_retries: u32,
    /// Seconds to back off between failed attempts.
    pub retry_backoff_secs: u64,
    /// Seconds to wait for the user to confirm a displayed activation code.
    pub code_wait_secs: u64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            required: false,
            max_retries: 10,
            retry_backoff_secs: 1,
            code_wait_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_client::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Duplex audio path settings.
    pub audio: AudioConfig,
    /// Wake-word detector settings.
    pub wake: WakeConfig,
    /// Server connection settings.
    pub server: ServerConfig,
    /// Startup activation gate settings.
    pub activation: ActivationConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet
    /// (first-run scenario) so callers never need to special-case a missing
    /// file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
