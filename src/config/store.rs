//! Runtime-mutable value store (`runtime.toml`).
//!
//! [`SettingsStore`] persists the handful of values the user changes while
//! the device is running — output volume and the selected input device —
//! separately from `settings.toml` so that a settings re-deploy does not
//! clobber them.  Every setter writes through to disk immediately.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

/// Values persisted in `runtime.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuntimeValues {
    /// Output volume, `0..=100`.
    output_volume: u8,
    /// Index into the enumerated input device list; `None` means the system
    /// default device.
    input_device: Option<usize>,
}

impl Default for RuntimeValues {
    fn default() -> Self {
        Self {
            output_volume: 70,
            input_device: None,
        }
    }
}

/// Write-through store for runtime-mutable settings.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    values: RuntimeValues,
}

impl SettingsStore {
    /// Open the store at the platform-appropriate `runtime.toml`.
    ///
    /// A missing file yields defaults, same as [`crate::config::AppConfig`].
    pub fn open() -> Result<Self> {
        Self::open_at(&AppPaths::new().runtime_file)
    }

    /// Open the store at an explicit path (useful for tests).
    pub fn open_at(path: &Path) -> Result<Self> {
        let values = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            RuntimeValues::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            values,
        })
    }

    /// Current output volume, `0..=100`.
    pub fn output_volume(&self) -> u8 {
        self.values.output_volume
    }

    /// Set and persist the output volume.  Values above 100 are clamped.
    pub fn set_output_volume(&mut self, volume: u8) -> Result<()> {
        self.values.output_volume = volume.min(100);
        self.flush()
    }

    /// Currently selected input device index, if any.
    pub fn input_device(&self) -> Option<usize> {
        self.values.input_device
    }

    /// Set and persist the input device index.
    pub fn set_input_device(&mut self, index: Option<usize>) -> Result<()> {
        self.values.input_device = index;
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().expect("temp dir");
        let store = SettingsStore::open_at(&dir.path().join("runtime.toml")).expect("open");
        assert_eq!(store.output_volume(), 70);
        assert!(store.input_device().is_none());
    }

    #[test]
    fn volume_persists_across_reopen() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("runtime.toml");

        let mut store = SettingsStore::open_at(&path).expect("open");
        store.set_output_volume(35).expect("set volume");
        drop(store);

        let reopened = SettingsStore::open_at(&path).expect("reopen");
        assert_eq!(reopened.output_volume(), 35);
    }

    #[test]
    fn volume_clamped_to_100() {
        let dir = tempdir().expect("temp dir");
        let mut store = SettingsStore::open_at(&dir.path().join("runtime.toml")).expect("open");
        store.set_output_volume(250).expect("set volume");
        assert_eq!(store.output_volume(), 100);
    }

    #[test]
    fn input_device_persists() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("runtime.toml");

        let mut store = SettingsStore::open_at(&path).expect("open");
        store.set_input_device(Some(2)).expect("set device");

        let reopened = SettingsStore::open_at(&path).expect("reopen");
        assert_eq!(reopened.input_device(), Some(2));

        let mut store = reopened;
        store.set_input_device(None).expect("clear device");
        let reopened = SettingsStore::open_at(&path).expect("reopen");
        assert!(reopened.input_device().is_none());
    }
}
