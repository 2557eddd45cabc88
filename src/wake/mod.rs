//! Wake-word detection — streaming keyword spotting with VAD telemetry.
//!
//! # Detection cycle
//!
//! ```text
//! raw capture frames → feed() → audio queue ┐
//!                                           ▼  (poll interval)
//!                          spotter.accept / vad.update per frame
//!                          vad state sampled once per cycle → VadChanged
//!                          spotter ready? → decode → Detected (pauses itself)
//! ```
//!
//! The detector runs only while the controller is not in `Listening`, and it
//! pauses itself the moment a keyword fires: no second event can be raised
//! until [`WakeWordDetector::start`] is called again, even if matching audio
//! keeps arriving.  `feed` is fire-and-forget — a full queue drops frames
//! rather than blocking the audio tick.

pub mod spotter;
pub mod vad;

pub use spotter::{EnergySpotter, KeywordSpotter};
pub use vad::VadDetector;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Audio frames queued between `feed` and the detection cycle.
const AUDIO_QUEUE: usize = 64;

// ---------------------------------------------------------------------------
// WakeEvent
// ---------------------------------------------------------------------------

/// Events raised by the detection cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeEvent {
    /// A keyword was recognised.  Detection is paused until `start()`.
    Detected { keyword: String },
    /// VAD speaking state flipped (UI/telemetry only).
    VadChanged { speaking: bool },
}

enum Ctl {
    Start,
    Stop,
}

// ---------------------------------------------------------------------------
// WakeWordDetector
// ---------------------------------------------------------------------------

/// Handle to the background detection task.
pub struct WakeWordDetector {
    audio_tx: mpsc::Sender<Vec<i16>>,
    ctl_tx: mpsc::UnboundedSender<Ctl>,
    active: Arc<AtomicBool>,
}

impl WakeWordDetector {
    /// Spawn the detection cycle.  The detector starts paused; call
    /// [`start`](Self::start) once the controller is ready for events.
    pub fn spawn(
        spotter: Box<dyn KeywordSpotter>,
        vad: VadDetector,
        poll: Duration,
        event_tx: mpsc::Sender<WakeEvent>,
    ) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(false));

        tokio::spawn(detection_cycle(
            spotter,
            vad,
            poll,
            audio_rx,
            ctl_rx,
            Arc::clone(&active),
            event_tx,
        ));

        Self {
            audio_tx,
            ctl_tx,
            active,
        }
    }

    /// Resume detection.  Idempotent; resets spotter and VAD state so a
    /// previous half-tracked utterance cannot fire.
    pub fn start(&self) {
        self.active.store(true, Ordering::Relaxed);
        let _ = self.ctl_tx.send(Ctl::Start);
    }

    /// Pause detection.  Idempotent; queued audio is discarded.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Relaxed);
        let _ = self.ctl_tx.send(Ctl::Stop);
    }

    /// Whether the detection cycle is currently consuming audio.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Fire-and-forget frame ingestion.  Frames fed while paused, and frames
    /// beyond the queue depth, are dropped.
    pub fn feed(&self, frame: Vec<i16>) {
        if !self.is_active() {
            return;
        }
        let _ = self.audio_tx.try_send(frame);
    }
}

// ---------------------------------------------------------------------------
// Detection cycle task
// ---------------------------------------------------------------------------

async fn detection_cycle(
    mut spotter: Box<dyn KeywordSpotter>,
    mut vad: VadDetector,
    poll: Duration,
    mut audio_rx: mpsc::Receiver<Vec<i16>>,
    mut ctl_rx: mpsc::UnboundedReceiver<Ctl>,
    active: Arc<AtomicBool>,
    event_tx: mpsc::Sender<WakeEvent>,
) {
    let mut interval = tokio::time::interval(poll);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_speaking = false;

    loop {
        interval.tick().await;

        loop {
            match ctl_rx.try_recv() {
                Ok(Ctl::Start) => {
                    spotter.reset();
                    vad.reset();
                    last_speaking = false;
                }
                Ok(Ctl::Stop) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        let running = active.load(Ordering::Relaxed);
        loop {
            match audio_rx.try_recv() {
                Ok(frame) => {
                    if running {
                        spotter.accept(&frame);
                        vad.update(&frame);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }
        if !running {
            continue;
        }

        // VAD is sampled once per cycle and only surfaced; it never gates
        // the spotter.
        let speaking = vad.is_speaking();
        if speaking != last_speaking {
            last_speaking = speaking;
            if event_tx
                .send(WakeEvent::VadChanged { speaking })
                .await
                .is_err()
            {
                return;
            }
        }

        if spotter.is_ready() {
            if let Some(keyword) = spotter.decode() {
                spotter.reset();
                active.store(false, Ordering::Relaxed);
                info!("wake word detected: {keyword}");
                if event_tx
                    .send(WakeEvent::Detected { keyword })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const POLL: Duration = Duration::from_millis(5);
    const WAIT: Duration = Duration::from_millis(500);

    /// A spotter that reports the configured keyword after `trigger_after`
    /// accepted frames, every time its counter fills up again.
    struct ScriptedSpotter {
        keyword: String,
        trigger_after: usize,
        accepted: usize,
    }

    impl ScriptedSpotter {
        fn new(keyword: &str, trigger_after: usize) -> Box<Self> {
            Box::new(Self {
                keyword: keyword.into(),
                trigger_after,
                accepted: 0,
            })
        }
    }

    impl KeywordSpotter for ScriptedSpotter {
        fn accept(&mut self, _frame: &[i16]) {
            self.accepted += 1;
        }
        fn is_ready(&self) -> bool {
            self.accepted >= self.trigger_after
        }
        fn decode(&mut self) -> Option<String> {
            Some(self.keyword.clone())
        }
        fn reset(&mut self) {
            self.accepted = 0;
        }
    }

    fn detector(
        trigger_after: usize,
    ) -> (WakeWordDetector, mpsc::Receiver<WakeEvent>) {
        let (event_tx, event_rx) = mpsc::channel(16);
        let detector = WakeWordDetector::spawn(
            ScriptedSpotter::new("hey assistant", trigger_after),
            VadDetector::new(0.01),
            POLL,
            event_tx,
        );
        (detector, event_rx)
    }

    async fn next_detection(rx: &mut mpsc::Receiver<WakeEvent>) -> Option<String> {
        loop {
            match timeout(WAIT, rx.recv()).await {
                Ok(Some(WakeEvent::Detected { keyword })) => return Some(keyword),
                Ok(Some(WakeEvent::VadChanged { .. })) => continue,
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn detection_fires_once_and_pauses() {
        let (detector, mut events) = detector(3);
        detector.start();

        for _ in 0..3 {
            detector.feed(vec![8_000i16; 480]);
        }
        assert_eq!(
            next_detection(&mut events).await.as_deref(),
            Some("hey assistant")
        );
        assert!(!detector.is_active(), "detector must pause itself");

        // Matching audio keeps arriving — no second event may fire.
        for _ in 0..10 {
            detector.feed(vec![8_000i16; 480]);
        }
        assert!(next_detection(&mut events).await.is_none());
    }

    #[tokio::test]
    async fn restart_allows_second_detection() {
        let (detector, mut events) = detector(2);
        detector.start();
        detector.feed(vec![8_000i16; 480]);
        detector.feed(vec![8_000i16; 480]);
        assert!(next_detection(&mut events).await.is_some());

        detector.start();
        // The restart reset the spotter; two fresh frames re-trigger it.
        for _ in 0..20 {
            detector.feed(vec![8_000i16; 480]);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(next_detection(&mut events).await.is_some());
    }

    #[tokio::test]
    async fn stopped_detector_ignores_audio() {
        let (detector, mut events) = detector(1);
        detector.stop();
        for _ in 0..5 {
            detector.feed(vec![8_000i16; 480]);
        }
        assert!(next_detection(&mut events).await.is_none());
    }

    #[tokio::test]
    async fn vad_state_changes_are_reported() {
        let (event_tx, mut events) = mpsc::channel(16);
        let detector = WakeWordDetector::spawn(
            // Never triggers; this test is about VAD only.
            ScriptedSpotter::new("unused", usize::MAX),
            VadDetector::with_hangover(0.01, 1),
            POLL,
            event_tx,
        );
        detector.start();

        detector.feed(vec![8_000i16; 480]);
        let ev = timeout(WAIT, events.recv()).await.expect("event").unwrap();
        assert_eq!(ev, WakeEvent::VadChanged { speaking: true });

        detector.feed(vec![0i16; 480]);
        detector.feed(vec![0i16; 480]);
        let ev = timeout(WAIT, events.recv()).await.expect("event").unwrap();
        assert_eq!(ev, WakeEvent::VadChanged { speaking: false });
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let (detector, _events) = detector(1);
        detector.start();
        detector.start();
        assert!(detector.is_active());
        detector.stop();
        detector.stop();
        assert!(!detector.is_active());
    }
}
