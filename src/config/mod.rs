//! Configuration module for the voice-assistant client.
//!
//! Provides `AppConfig` (top-level settings), sub-configs for each subsystem,
//! `AppPaths` for cross-platform data directories, TOML persistence via
//! `AppConfig::load` / `AppConfig::save`, and the write-through
//! `SettingsStore` for runtime-mutable values (volume, input device).

pub mod paths;
pub mod settings;
pub mod store;

pub use paths::AppPaths;
pub use settings::{ActivationConfig, AppConfig, AudioConfig, ServerConfig, WakeConfig};
pub use store::SettingsStore;
