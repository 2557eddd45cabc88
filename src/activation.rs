//! Activation gate the controller awaits once at startup.
//!
//! The check itself (version/OTA HTTP flow) lives outside the core; this
//! seam only carries its outcome: proceed, or display a code and wait for
//! the user to confirm it out of band.

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationStatus {
    /// Device may proceed to `Idle`.
    Activated,
    /// Device must display this code and re-check until activated.
    CodeRequired(String),
}

#[async_trait]
pub trait ActivationService: Send + Sync {
    /// One activation check.  Errors are transient (network); the controller
    /// retries with backoff up to its configured attempt limit.
    async fn check(&self) -> Result<ActivationStatus>;
}

/// Used when no activation backend is configured.
pub struct PreActivated;

#[async_trait]
impl ActivationService for PreActivated {
    async fn check(&self) -> Result<ActivationStatus> {
        Ok(ActivationStatus::Activated)
    }
}
