//! One-way status sink for whatever surface the host application renders.

use log::info;

/// Receives status, emotion and chat-message notifications from the
/// conversation controller.  Implementations must not block; the controller
/// calls these on its tick loop.
pub trait StatusDisplay: Send + Sync {
    fn set_status(&self, status: &str);
    fn set_emotion(&self, emotion: &str);
    fn set_chat_message(&self, role: &str, text: &str);
}

/// Headless display that writes everything to the log.
pub struct LogDisplay;

impl StatusDisplay for LogDisplay {
    fn set_status(&self, status: &str) {
        info!("status: {status}");
    }

    fn set_emotion(&self, emotion: &str) {
        info!("emotion: {emotion}");
    }

    fn set_chat_message(&self, role: &str, text: &str) {
        info!("{role}: {text}");
    }
}
