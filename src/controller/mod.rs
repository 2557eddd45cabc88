//! The conversation state machine.
//!
//! One control loop ticking at the capture quantum owns every piece of
//! session and device state.  Everything else talks to it through channels:
//! the transport delivers [`ProtocolEvent`]s, the wake-word detector delivers
//! [`WakeEvent`]s, the host application delivers [`UserCommand`]s, and decode
//! results come back from the background lane.  Encode, decode and control
//! sends run on two ordered [`TaskLane`]s; every state transition joins both
//! lanes first, so a stale background task can never write audio belonging
//! to the previous state into the new one.

pub mod state;
pub mod tasks;

pub use state::{ConversationSession, DeviceState};
pub use tasks::TaskLane;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::activation::{ActivationService, ActivationStatus};
use crate::audio::{AudioIoEngine, EchoCanceller, FarEndSync, FrameDecoder, FrameEncoder};
use crate::config::AppConfig;
use crate::display::StatusDisplay;
use crate::protocol::{
    AbortReason, ListeningMode, Protocol, ProtocolEvent, ServerMessage, TtsState,
};
use crate::wake::{EnergySpotter, VadDetector, WakeEvent, WakeWordDetector};

/// Commands issued by the host application (key bindings, buttons, a CLI).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    /// Start a conversation, stop listening, or interrupt speech, depending
    /// on the current state.
    ToggleChat,
    /// Explicit push-to-talk start; the turn ends only on `StopListening`.
    StartListening,
    StopListening,
    AbortSpeaking,
    SetVolume(u8),
    SwitchInput(usize),
    Quit,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ConversationController {
    config: AppConfig,
    engine: AudioIoEngine,
    protocol: Arc<dyn Protocol>,
    protocol_events: mpsc::Receiver<ProtocolEvent>,
    commands: mpsc::Receiver<UserCommand>,
    display: Arc<dyn StatusDisplay>,
    activation: Arc<dyn ActivationService>,

    wake: Option<WakeWordDetector>,
    wake_events: mpsc::Receiver<WakeEvent>,
    wake_event_tx: mpsc::Sender<WakeEvent>,

    state: DeviceState,
    session: ConversationSession,

    encoder: Arc<Mutex<FrameEncoder>>,
    decoder: Arc<Mutex<FrameDecoder>>,
    decoder_rate: u32,
    aec: EchoCanceller,
    far_sync: Option<FarEndSync>,
    /// Decoded playback audio waiting to prime the echo canceller, consumed
    /// in matched-frame quanta by [`sync_farend`](Self::sync_farend).
    far_backlog: Vec<i16>,

    fg_lane: TaskLane,
    bg_lane: TaskLane,
    decoded_tx: mpsc::Sender<Vec<i16>>,
    decoded_rx: mpsc::Receiver<Vec<i16>>,
}

impl ConversationController {
    pub fn new(
        config: AppConfig,
        engine: AudioIoEngine,
        protocol: Arc<dyn Protocol>,
        protocol_events: mpsc::Receiver<ProtocolEvent>,
        commands: mpsc::Receiver<UserCommand>,
        display: Arc<dyn StatusDisplay>,
        activation: Arc<dyn ActivationService>,
    ) -> Result<Self> {
        let audio = &config.audio;
        let encoder =
            FrameEncoder::new(audio.sample_rate, audio.channels, audio.packet_ms, audio.dtx)
                .context("encoder init")?;
        let decoder = FrameDecoder::new(audio.sample_rate, audio.channels, audio.packet_ms)
            .context("decoder init")?;
        let aec = EchoCanceller::new(audio.sample_rate, audio.echo_cancel);
        let decoder_rate = audio.sample_rate;

        let (wake_event_tx, wake_events) = mpsc::channel(16);
        let (decoded_tx, decoded_rx) = mpsc::channel(32);

        Ok(Self {
            config,
            engine,
            protocol,
            protocol_events,
            commands,
            display,
            activation,
            wake: None,
            wake_events,
            wake_event_tx,
            state: DeviceState::Unknown,
            session: ConversationSession::default(),
            encoder: Arc::new(Mutex::new(encoder)),
            decoder: Arc::new(Mutex::new(decoder)),
            decoder_rate,
            aec,
            far_sync: None,
            far_backlog: Vec::new(),
            fg_lane: TaskLane::new("foreground"),
            bg_lane: TaskLane::new("background"),
            decoded_tx,
            decoded_rx,
        })
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Startup, then the control loop, until `Quit` or a terminal state.
    pub async fn run(&mut self) -> Result<()> {
        if let Err(e) = self.startup().await {
            self.set_state(DeviceState::Error).await;
            return Err(e);
        }

        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.audio.frame_ms as u64));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.state.is_terminal() {
            tokio::select! {
                _ = tick.tick() => self.on_tick().await,
                Some(command) = self.commands.recv() => {
                    if command == UserCommand::Quit {
                        break;
                    }
                    self.on_command(command).await;
                }
                Some(event) = self.protocol_events.recv() => self.on_protocol_event(event).await,
                Some(event) = self.wake_events.recv() => self.on_wake_event(event).await,
                Some(pcm) = self.decoded_rx.recv() => self.on_decoded(pcm),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    // ----- Startup / shutdown -----

    pub(crate) async fn startup(&mut self) -> Result<()> {
        self.set_state(DeviceState::Starting).await;

        // A device that cannot speak is unusable; input failure is not fatal
        // and is retried on demand.
        self.engine.start().context("audio output init")?;
        self.engine.enable_input(true);

        if self.config.wake.enabled {
            let rate = self
                .engine
                .capture_rate()
                .unwrap_or(self.config.audio.sample_rate);
            let spotter = Box::new(EnergySpotter::new(
                self.config.wake.keywords.clone(),
                rate,
                self.config.wake.energy_threshold,
            ));
            let vad = VadDetector::new(self.config.wake.energy_threshold);
            self.wake = Some(WakeWordDetector::spawn(
                spotter,
                vad,
                Duration::from_millis(self.config.wake.poll_ms),
                self.wake_event_tx.clone(),
            ));
            self.engine.set_raw_tap(true);
        }

        self.run_activation_gate().await?;
        if self.state != DeviceState::Activating {
            self.set_state(DeviceState::Idle).await;
        }
        Ok(())
    }

    /// Bounded retry loop around the activation collaborator.  An activation
    /// code parks the device in `Activating` with the code on the display;
    /// the user can toggle back to `Idle` from there.
    async fn run_activation_gate(&mut self) -> Result<()> {
        let cfg = self.config.activation.clone();
        let backoff = Duration::from_secs(cfg.retry_backoff_secs.max(1));
        let mut attempts = 0u32;
        loop {
            match self.activation.check().await {
                Ok(ActivationStatus::Activated) => return Ok(()),
                Ok(ActivationStatus::CodeRequired(code)) => {
                    self.set_state(DeviceState::Activating).await;
                    info!("activation code required: {code}");
                    self.display.set_status(&format!("activation code: {code}"));

                    let deadline = Instant::now() + Duration::from_secs(cfg.code_wait_secs);
                    while Instant::now() < deadline {
                        tokio::time::sleep(backoff).await;
                        if let Ok(ActivationStatus::Activated) = self.activation.check().await {
                            self.set_state(DeviceState::Idle).await;
                            return Ok(());
                        }
                    }
                    // Unconfirmed: stay in Activating, let the main loop run.
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= cfg.max_retries.max(1) {
                        if cfg.required {
                            return Err(e.context("activation failed"));
                        }
                        warn!("activation check failed {attempts} times ({e}), continuing");
                        return Ok(());
                    }
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(wake) = &self.wake {
            wake.stop();
        }
        self.fg_lane.close().await;
        self.bg_lane.close().await;
        self.protocol.close_audio_channel().await;
        self.engine.enable_input(false);
        info!("controller stopped");
    }

    // ----- Tick -----

    pub(crate) async fn on_tick(&mut self) {
        self.engine.maintain();
        // Lapsed idle window surfaces as a ChannelClosed event; the window
        // elapses in Idle too, so the poll runs in every state.
        let _ = self.protocol.is_audio_channel_open();
        self.sync_farend();
        match self.state {
            DeviceState::Listening => self.pump_capture().await,
            DeviceState::Idle | DeviceState::Speaking | DeviceState::Activating => {
                self.pump_wake();
            }
            _ => {}
        }
    }

    /// Pair playback and capture cursor progress, then prime the echo
    /// canceller with exactly the matched number of frames from the decoded
    /// backlog.
    fn sync_farend(&mut self) {
        if !self.aec.is_enabled() {
            return;
        }
        let (Some(sync), Some(far), Some(near)) = (
            self.far_sync.as_mut(),
            self.engine.playback_write_cursor(),
            self.engine.capture_read_cursor(),
        ) else {
            return;
        };
        let matched = sync.tick(far, near);
        if matched == 0 || self.far_backlog.is_empty() {
            return;
        }
        let quantum = (self.decoder_rate as usize / 1_000) * self.config.audio.frame_ms as usize;
        let take = (matched * quantum).min(self.far_backlog.len());
        self.aec.buffer_farend(&self.far_backlog[..take]);
        self.far_backlog.drain(..take);
    }

    /// Drain capture frames: echo cancel, then encode and send on the
    /// background lane.
    async fn pump_capture(&mut self) {
        while let Some(frame) = self.engine.try_read() {
            let frame = if self.aec.is_enabled() {
                let latency = self.far_sync.as_ref().map_or(0, FarEndSync::latency_ms);
                self.aec.process(&frame, latency)
            } else {
                frame
            };

            let encoder = Arc::clone(&self.encoder);
            let protocol = Arc::clone(&self.protocol);
            self.bg_lane
                .submit(async move {
                    let mut packets = Vec::new();
                    guard(&encoder).push(&frame, |packet| packets.push(packet));
                    for packet in packets {
                        if let Err(e) = protocol.send_audio(packet.payload).await {
                            debug!("audio send failed: {e}");
                            break;
                        }
                    }
                })
                .await;
        }
    }

    /// Forward raw capture audio to the wake-word detector.
    fn pump_wake(&mut self) {
        let Some(wake) = &self.wake else {
            return;
        };
        // Drain to exhaustion; a missed tick must not leave a backlog of
        // unencoded frames behind.
        while self.engine.try_read().is_some() {}
        let raw = self.engine.take_raw_tap();
        if !raw.is_empty() {
            wake.feed(raw);
        }
    }

    // ----- Transitions -----

    async fn set_state(&mut self, next: DeviceState) {
        if next == self.state {
            return;
        }
        // Let in-flight encode/decode work settle before any side effects.
        self.fg_lane.join().await;
        self.bg_lane.join().await;

        let prev = self.state;
        self.state = next;
        info!("state {prev} -> {next}");
        self.display.set_status(next.label());

        match next {
            DeviceState::Listening => {
                guard(&self.encoder).reset_state();
                guard(&self.decoder).reset_state();
                self.engine.clear_playback();
                self.engine.flush_capture();
                self.aec.reset();
                self.far_backlog.clear();
                self.init_far_sync();
                self.session.aborted = false;
                if let Some(wake) = &self.wake {
                    wake.stop();
                }
                let _ = self.engine.take_raw_tap();
            }
            DeviceState::Speaking => {
                guard(&self.decoder).reset_state();
                self.engine.enable_output(true);
                if self.far_sync.is_none() {
                    self.init_far_sync();
                }
                let _ = self.engine.take_raw_tap();
                if let Some(wake) = &self.wake {
                    wake.start();
                }
            }
            DeviceState::Idle => {
                self.session = ConversationSession::default();
                self.far_backlog.clear();
                let _ = self.engine.take_raw_tap();
                if let Some(wake) = &self.wake {
                    wake.start();
                }
            }
            DeviceState::Error => {
                self.display.set_status("fatal error, restart required");
            }
            _ => {}
        }
    }

    fn init_far_sync(&mut self) {
        let frame_ms = self.config.audio.frame_ms as usize;
        self.far_sync = match (self.engine.playback_rate(), self.engine.capture_rate()) {
            (far, Some(near)) if far > 0 => Some(FarEndSync::new(
                far as usize / 1_000 * frame_ms,
                near as usize / 1_000 * frame_ms,
                self.config.audio.frame_ms,
            )),
            _ => None,
        };
    }

    async fn start_conversation(&mut self, keep_listening: bool, mode: ListeningMode) {
        self.set_state(DeviceState::Connecting).await;

        if let Err(e) = self.protocol.open_audio_channel().await {
            warn!("channel open failed: {e}");
            self.display.set_status("network error");
            self.set_state(DeviceState::Idle).await;
            return;
        }

        self.session = ConversationSession::new(self.protocol.session_id(), keep_listening);
        self.configure_decode_rate();
        self.announce_device().await;

        if let Err(e) = self.protocol.send_start_listening(mode).await {
            warn!("listen start failed: {e}");
            self.protocol.close_audio_channel().await;
            self.set_state(DeviceState::Idle).await;
            return;
        }
        self.set_state(DeviceState::Listening).await;
    }

    fn configure_decode_rate(&mut self) {
        let rate = self.protocol.server_sample_rate();
        self.engine.set_source_rate(rate);
        if rate != self.decoder_rate {
            match FrameDecoder::new(rate, self.config.audio.channels, self.config.audio.packet_ms)
            {
                Ok(decoder) => {
                    *guard(&self.decoder) = decoder;
                    self.decoder_rate = rate;
                }
                Err(e) => warn!("decoder reconfigure to {rate} Hz failed: {e}"),
            }
        }
    }

    /// Best-effort capability snapshot after the handshake.
    async fn announce_device(&mut self) {
        let descriptors = json!([{
            "name": "speaker",
            "description": "output volume control",
            "properties": { "volume": { "type": "number" } },
        }]);
        if let Err(e) = self.protocol.send_iot_descriptors(descriptors).await {
            debug!("iot descriptors not sent: {e}");
            return;
        }
        let states = json!([{ "name": "speaker", "state": { "volume": self.engine.volume() } }]);
        if let Err(e) = self.protocol.send_iot_states(states).await {
            debug!("iot states not sent: {e}");
        }
    }

    async fn stop_listening(&mut self) {
        if let Err(e) = self.protocol.send_stop_listening().await {
            warn!("listen stop failed: {e}");
        }
        self.set_state(DeviceState::Idle).await;
    }

    async fn abort_speaking(&mut self, reason: Option<AbortReason>) {
        self.session.aborted = true;
        self.engine.clear_playback();
        self.far_backlog.clear();

        let protocol = Arc::clone(&self.protocol);
        self.fg_lane
            .submit(async move {
                if let Err(e) = protocol.send_abort(reason).await {
                    warn!("abort send failed: {e}");
                }
            })
            .await;

        self.finish_speaking().await;
    }

    /// Shared tail of `tts.stop` and abort handling.  With `keep_listening`
    /// the fresh `listen start` is queued on the foreground lane, which the
    /// transition joins — the message is on the wire before any Listening
    /// side effect applies.
    async fn finish_speaking(&mut self) {
        if self.session.keep_listening && self.protocol.is_audio_channel_open() {
            let protocol = Arc::clone(&self.protocol);
            self.fg_lane
                .submit(async move {
                    if let Err(e) = protocol.send_start_listening(ListeningMode::AutoStop).await
                    {
                        warn!("listen resume failed: {e}");
                    }
                })
                .await;
            self.set_state(DeviceState::Listening).await;
        } else {
            self.set_state(DeviceState::Idle).await;
        }
    }

    // ----- Event handlers -----

    pub(crate) async fn on_command(&mut self, command: UserCommand) {
        match command {
            UserCommand::ToggleChat => match self.state {
                DeviceState::Idle => {
                    self.start_conversation(true, ListeningMode::AutoStop).await;
                }
                DeviceState::Listening => self.stop_listening().await,
                DeviceState::Speaking => self.abort_speaking(None).await,
                DeviceState::Activating => self.set_state(DeviceState::Idle).await,
                _ => {}
            },
            UserCommand::StartListening => {
                if self.state == DeviceState::Idle {
                    self.start_conversation(false, ListeningMode::ManualStop)
                        .await;
                }
            }
            UserCommand::StopListening => {
                if self.state == DeviceState::Listening {
                    self.stop_listening().await;
                }
            }
            UserCommand::AbortSpeaking => {
                if self.state == DeviceState::Speaking {
                    self.abort_speaking(None).await;
                }
            }
            UserCommand::SetVolume(volume) => self.engine.set_volume(volume),
            UserCommand::SwitchInput(index) => {
                if let Err(e) = self.engine.switch_input_device(index) {
                    warn!("input device switch failed: {e}");
                }
            }
            UserCommand::Quit => {}
        }
    }

    pub(crate) async fn on_wake_event(&mut self, event: WakeEvent) {
        match event {
            WakeEvent::Detected { keyword } => {
                info!("wake word detected: {keyword}");
                match self.state {
                    DeviceState::Idle => {
                        self.start_conversation(true, ListeningMode::AutoStop).await;
                        if self.state == DeviceState::Listening {
                            if let Err(e) = self.protocol.send_wake_word_detected(&keyword).await
                            {
                                debug!("wake word report failed: {e}");
                            }
                        }
                    }
                    DeviceState::Speaking => {
                        self.abort_speaking(Some(AbortReason::WakeWordDetected))
                            .await;
                    }
                    DeviceState::Activating => self.set_state(DeviceState::Idle).await,
                    _ => {
                        // Detection paused itself; nothing to do here, resume.
                        if let Some(wake) = &self.wake {
                            wake.start();
                        }
                    }
                }
            }
            WakeEvent::VadChanged { speaking } => {
                debug!("vad speaking: {speaking}");
            }
        }
    }

    pub(crate) async fn on_protocol_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::ChannelOpened => debug!("audio channel opened"),
            ProtocolEvent::ChannelClosed => {
                debug!("audio channel closed");
                if matches!(
                    self.state,
                    DeviceState::Connecting | DeviceState::Listening | DeviceState::Speaking
                ) {
                    self.set_state(DeviceState::Idle).await;
                }
            }
            ProtocolEvent::NetworkError(e) => {
                warn!("network error: {e}");
                self.display.set_status("network error");
                if matches!(
                    self.state,
                    DeviceState::Connecting | DeviceState::Listening | DeviceState::Speaking
                ) {
                    self.set_state(DeviceState::Idle).await;
                }
            }
            ProtocolEvent::IncomingAudio(payload) => self.on_incoming_audio(payload).await,
            ProtocolEvent::IncomingMessage(message) => self.on_server_message(message).await,
        }
    }

    async fn on_incoming_audio(&mut self, payload: Vec<u8>) {
        if self.state != DeviceState::Speaking || self.session.aborted {
            return;
        }
        let decoder = Arc::clone(&self.decoder);
        let decoded_tx = self.decoded_tx.clone();
        self.bg_lane
            .submit(async move {
                let result = guard(&decoder).decode(&payload);
                match result {
                    Ok(pcm) => {
                        // The lane worker must never block on the control
                        // loop, or a transition joining the lane would hang.
                        if decoded_tx.try_send(pcm).is_err() {
                            debug!("decoded frame dropped, control loop backlogged");
                        }
                    }
                    // Per-packet failure; the session continues.
                    Err(e) => warn!("dropping undecodable packet: {e}"),
                }
            })
            .await;
    }

    /// Decoded PCM coming back from the background lane, in decode order.
    pub(crate) fn on_decoded(&mut self, pcm: Vec<i16>) {
        if self.state != DeviceState::Speaking || self.session.aborted {
            return;
        }
        if self.aec.is_enabled() {
            self.far_backlog.extend_from_slice(&pcm);
            // Cap the backlog at one second of reference audio.
            let limit = self.decoder_rate as usize;
            if self.far_backlog.len() > limit {
                let excess = self.far_backlog.len() - limit;
                self.far_backlog.drain(..excess);
            }
        }
        self.engine.write(&pcm);
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Hello { .. } => debug!("late hello ignored"),
            ServerMessage::Tts { state, text } => match state {
                TtsState::Start => {
                    if matches!(self.state, DeviceState::Idle | DeviceState::Listening) {
                        self.set_state(DeviceState::Speaking).await;
                    } else {
                        debug!("ignoring tts start in {}", self.state);
                    }
                }
                TtsState::Stop => {
                    if self.state == DeviceState::Speaking {
                        self.finish_speaking().await;
                    }
                }
                TtsState::SentenceStart => {
                    if let Some(text) = text {
                        self.display.set_chat_message("assistant", &text);
                    }
                }
            },
            ServerMessage::Stt { text } => {
                if let Some(text) = text {
                    self.display.set_chat_message("user", &text);
                }
            }
            ServerMessage::Llm { emotion, .. } => {
                if let Some(emotion) = emotion {
                    self.display.set_emotion(&emotion);
                }
            }
            ServerMessage::Iot { commands } => self.on_iot_commands(commands),
        }
    }

    /// The only device capability announced is the speaker, so the only
    /// command honoured is its volume.
    fn on_iot_commands(&mut self, commands: Option<serde_json::Value>) {
        let Some(serde_json::Value::Array(commands)) = commands else {
            return;
        };
        for command in commands {
            let is_speaker_volume = command["name"] == "speaker"
                && (command["method"] == "set_volume" || command["method"] == "SetVolume");
            if !is_speaker_volume {
                debug!("ignoring iot command: {command}");
                continue;
            }
            if let Some(volume) = command["parameters"]["volume"].as_u64() {
                self.engine.set_volume(volume.min(100) as u8);
                info!("volume set to {} via iot command", self.engine.volume());
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
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use tempfile::tempdir;

    use crate::activation::PreActivated;
    use crate::audio::engine::mock::MockBackend;
    use crate::config::SettingsStore;
    use crate::protocol::ProtocolError;

    // ---- Doubles ------------------------------------------------------------

    struct MockProtocol {
        calls: Mutex<Vec<String>>,
        open: AtomicBool,
        fail_open: AtomicBool,
        server_rate: AtomicU32,
    }

    impl MockProtocol {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                open: AtomicBool::new(false),
                fail_open: AtomicBool::new(false),
                server_rate: AtomicU32::new(16_000),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl Protocol for MockProtocol {
        async fn open_audio_channel(&self) -> Result<(), ProtocolError> {
            self.record("open");
            if self.fail_open.load(Ordering::Relaxed) {
                return Err(ProtocolError::Connect("refused".into()));
            }
            self.open.store(true, Ordering::Relaxed);
            Ok(())
        }

        async fn close_audio_channel(&self) {
            self.record("close");
            self.open.store(false, Ordering::Relaxed);
        }

        fn is_audio_channel_open(&self) -> bool {
            self.open.load(Ordering::Relaxed)
        }

        async fn send_audio(&self, payload: Vec<u8>) -> Result<(), ProtocolError> {
            self.record(format!("audio:{}", payload.len()));
            Ok(())
        }

        async fn send_start_listening(&self, mode: ListeningMode) -> Result<(), ProtocolError> {
            self.record(format!("listen_start:{mode:?}"));
            Ok(())
        }

        async fn send_stop_listening(&self) -> Result<(), ProtocolError> {
            self.record("listen_stop");
            Ok(())
        }

        async fn send_abort(&self, reason: Option<AbortReason>) -> Result<(), ProtocolError> {
            self.record(format!("abort:{reason:?}"));
            Ok(())
        }

        async fn send_wake_word_detected(&self, keyword: &str) -> Result<(), ProtocolError> {
            self.record(format!("wake:{keyword}"));
            Ok(())
        }

        async fn send_iot_descriptors(
            &self,
            _descriptors: serde_json::Value,
        ) -> Result<(), ProtocolError> {
            self.record("iot_descriptors");
            Ok(())
        }

        async fn send_iot_states(&self, _states: serde_json::Value) -> Result<(), ProtocolError> {
            self.record("iot_states");
            Ok(())
        }

        fn server_sample_rate(&self) -> u32 {
            self.server_rate.load(Ordering::Relaxed)
        }

        fn session_id(&self) -> Option<String> {
            self.open
                .load(Ordering::Relaxed)
                .then(|| "sess-1".to_string())
        }
    }

    #[derive(Default)]
    struct RecordingDisplay {
        statuses: Mutex<Vec<String>>,
        messages: Mutex<Vec<(String, String)>>,
    }

    impl StatusDisplay for RecordingDisplay {
        fn set_status(&self, status: &str) {
            self.statuses.lock().unwrap().push(status.into());
        }
        fn set_emotion(&self, _emotion: &str) {}
        fn set_chat_message(&self, role: &str, text: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((role.into(), text.into()));
        }
    }

    struct Fixture {
        controller: ConversationController,
        protocol: Arc<MockProtocol>,
        display: Arc<RecordingDisplay>,
        shared: Arc<Mutex<crate::audio::engine::mock::MockShared>>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        // Wake handlers are driven directly in most tests.
        fixture_with(|config| config.wake.enabled = false).await
    }

    async fn fixture_with(configure: impl FnOnce(&mut AppConfig)) -> Fixture {
        let dir = tempdir().expect("temp dir");
        let store = SettingsStore::open_at(&dir.path().join("runtime.toml")).expect("store");
        let (backend, shared) = MockBackend::new(48_000, 48_000);
        let mut config = AppConfig::default();
        configure(&mut config);

        let engine = AudioIoEngine::new(Box::new(backend), config.audio.clone(), store);
        let protocol = MockProtocol::new();
        let display = Arc::new(RecordingDisplay::default());
        let (_protocol_tx, protocol_rx) = mpsc::channel(8);
        let (_command_tx, command_rx) = mpsc::channel(8);

        let mut controller = ConversationController::new(
            config,
            engine,
            Arc::clone(&protocol) as Arc<dyn Protocol>,
            protocol_rx,
            command_rx,
            Arc::clone(&display) as Arc<dyn StatusDisplay>,
            Arc::new(PreActivated),
        )
        .expect("controller");
        controller.startup().await.expect("startup");
        assert_eq!(controller.state(), DeviceState::Idle);

        Fixture {
            controller,
            protocol,
            display,
            shared,
            _dir: dir,
        }
    }

    /// Push device-rate samples into the capture ring, as the input callback
    /// thread would.
    fn write_capture(f: &Fixture, samples: &[i16]) {
        f.shared
            .lock()
            .unwrap()
            .capture_tx
            .as_mut()
            .expect("capture stream")
            .write(samples);
    }

    async fn enter_speaking(f: &mut Fixture) {
        f.controller.on_command(UserCommand::ToggleChat).await;
        assert_eq!(f.controller.state(), DeviceState::Listening);
        f.controller
            .on_protocol_event(ProtocolEvent::IncomingMessage(ServerMessage::Tts {
                state: TtsState::Start,
                text: None,
            }))
            .await;
        assert_eq!(f.controller.state(), DeviceState::Speaking);
    }

    // ---- State machine ---------------------------------------------------------

    #[tokio::test]
    async fn toggle_from_idle_opens_channel_and_listens() {
        let mut f = fixture().await;
        f.controller.on_command(UserCommand::ToggleChat).await;

        assert_eq!(f.controller.state(), DeviceState::Listening);
        assert!(f.controller.session.keep_listening);
        assert_eq!(f.controller.session.session_id.as_deref(), Some("sess-1"));
        let calls = f.protocol.calls();
        assert_eq!(calls[0], "open");
        assert!(calls.contains(&"listen_start:AutoStop".to_string()));
    }

    #[tokio::test]
    async fn failed_open_reverts_to_idle_with_network_error() {
        let mut f = fixture().await;
        f.protocol.fail_open.store(true, Ordering::Relaxed);

        f.controller.on_command(UserCommand::ToggleChat).await;

        assert_eq!(f.controller.state(), DeviceState::Idle);
        assert!(f
            .display
            .statuses
            .lock()
            .unwrap()
            .contains(&"network error".to_string()));
        // No listen message may follow a failed open.
        assert!(!f
            .protocol
            .calls()
            .iter()
            .any(|c| c.starts_with("listen_start")));
    }

    #[tokio::test]
    async fn manual_start_does_not_keep_listening() {
        let mut f = fixture().await;
        f.controller.on_command(UserCommand::StartListening).await;

        assert_eq!(f.controller.state(), DeviceState::Listening);
        assert!(!f.controller.session.keep_listening);
        assert!(f
            .protocol
            .calls()
            .contains(&"listen_start:ManualStop".to_string()));
    }

    #[tokio::test]
    async fn stop_listening_returns_to_idle() {
        let mut f = fixture().await;
        f.controller.on_command(UserCommand::ToggleChat).await;
        f.controller.on_command(UserCommand::StopListening).await;

        assert_eq!(f.controller.state(), DeviceState::Idle);
        assert!(f.protocol.calls().contains(&"listen_stop".to_string()));
    }

    #[tokio::test]
    async fn tts_start_is_accepted_from_idle_and_listening() {
        let mut f = fixture().await;
        // From Idle.
        f.controller
            .on_protocol_event(ProtocolEvent::IncomingMessage(ServerMessage::Tts {
                state: TtsState::Start,
                text: None,
            }))
            .await;
        assert_eq!(f.controller.state(), DeviceState::Speaking);

        // From Speaking it is ignored.
        f.controller
            .on_protocol_event(ProtocolEvent::IncomingMessage(ServerMessage::Tts {
                state: TtsState::Start,
                text: None,
            }))
            .await;
        assert_eq!(f.controller.state(), DeviceState::Speaking);
    }

    #[tokio::test]
    async fn tts_stop_with_keep_listening_resumes_listening() {
        let mut f = fixture().await;
        enter_speaking(&mut f).await;

        f.controller
            .on_protocol_event(ProtocolEvent::IncomingMessage(ServerMessage::Tts {
                state: TtsState::Stop,
                text: None,
            }))
            .await;

        assert_eq!(f.controller.state(), DeviceState::Listening);
        // The fresh listen.start went out as part of the transition.
        let listen_starts = f
            .protocol
            .calls()
            .iter()
            .filter(|c| *c == "listen_start:AutoStop")
            .count();
        assert_eq!(listen_starts, 2);
    }

    #[tokio::test]
    async fn tts_stop_without_keep_listening_goes_idle() {
        let mut f = fixture().await;
        f.controller.on_command(UserCommand::StartListening).await;
        f.controller
            .on_protocol_event(ProtocolEvent::IncomingMessage(ServerMessage::Tts {
                state: TtsState::Start,
                text: None,
            }))
            .await;
        assert_eq!(f.controller.state(), DeviceState::Speaking);

        f.controller
            .on_protocol_event(ProtocolEvent::IncomingMessage(ServerMessage::Tts {
                state: TtsState::Stop,
                text: None,
            }))
            .await;
        assert_eq!(f.controller.state(), DeviceState::Idle);
    }

    #[tokio::test]
    async fn wake_word_during_speaking_aborts_with_reason() {
        let mut f = fixture().await;
        enter_speaking(&mut f).await;

        f.controller
            .on_wake_event(WakeEvent::Detected {
                keyword: "hey assistant".into(),
            })
            .await;

        assert!(f
            .protocol
            .calls()
            .contains(&"abort:Some(WakeWordDetected)".to_string()));
        // keep_listening was set by the toggle, so speech abort resumes
        // listening; the abort flag must not survive into the new turn.
        assert_eq!(f.controller.state(), DeviceState::Listening);
        assert!(!f.controller.session.aborted);
    }

    #[tokio::test]
    async fn wake_word_from_idle_starts_conversation_and_reports() {
        let mut f = fixture().await;
        f.controller
            .on_wake_event(WakeEvent::Detected {
                keyword: "hey assistant".into(),
            })
            .await;

        assert_eq!(f.controller.state(), DeviceState::Listening);
        assert!(f
            .protocol
            .calls()
            .contains(&"wake:hey assistant".to_string()));
    }

    #[tokio::test]
    async fn channel_closed_returns_to_idle() {
        let mut f = fixture().await;
        f.controller.on_command(UserCommand::ToggleChat).await;
        assert_eq!(f.controller.state(), DeviceState::Listening);

        f.controller
            .on_protocol_event(ProtocolEvent::ChannelClosed)
            .await;
        assert_eq!(f.controller.state(), DeviceState::Idle);
        assert!(f.controller.session.session_id.is_none());
    }

    // ---- Audio paths --------------------------------------------------------------

    #[tokio::test]
    async fn incoming_audio_is_decoded_only_while_speaking() {
        let mut f = fixture().await;

        // A real Opus packet, produced by the encode side.
        let mut encoder = FrameEncoder::new(16_000, 1, 60, false).unwrap();
        let mut packet = None;
        encoder.push(&vec![2_000i16; 960], |p| packet = Some(p));
        let payload = packet.expect("one packet").payload;

        // In Listening the packet must be dropped.
        f.controller.on_command(UserCommand::ToggleChat).await;
        f.controller
            .on_protocol_event(ProtocolEvent::IncomingAudio(payload.clone()))
            .await;
        f.controller.bg_lane.join().await;
        assert!(f.controller.decoded_rx.try_recv().is_err());

        // In Speaking it is decoded and comes back in order.
        f.controller
            .on_protocol_event(ProtocolEvent::IncomingMessage(ServerMessage::Tts {
                state: TtsState::Start,
                text: None,
            }))
            .await;
        f.controller
            .on_protocol_event(ProtocolEvent::IncomingAudio(payload))
            .await;
        f.controller.bg_lane.join().await;
        let pcm = f.controller.decoded_rx.try_recv().expect("decoded frame");
        assert_eq!(pcm.len(), 960);
    }

    #[tokio::test]
    async fn transition_completes_under_decode_backlog() {
        let mut f = fixture().await;
        enter_speaking(&mut f).await;

        let mut encoder = FrameEncoder::new(16_000, 1, 60, false).unwrap();
        let mut packet = None;
        encoder.push(&vec![2_000i16; 960], |p| packet = Some(p));
        let payload = packet.expect("one packet").payload;

        // Queue far more decodes than the decoded-frame channel can hold
        // before the control loop gets a chance to drain it.
        for _ in 0..50 {
            f.controller
                .on_protocol_event(ProtocolEvent::IncomingAudio(payload.clone()))
                .await;
        }

        let stop = f
            .controller
            .on_protocol_event(ProtocolEvent::IncomingMessage(ServerMessage::Tts {
                state: TtsState::Stop,
                text: None,
            }));
        tokio::time::timeout(Duration::from_secs(5), stop)
            .await
            .expect("transition stalled behind the decode backlog");
        assert_eq!(f.controller.state(), DeviceState::Listening);
    }

    #[tokio::test]
    async fn stale_idle_capture_never_reaches_the_encoder() {
        let mut f = fixture_with(|config| config.wake.enabled = true).await;

        // Several frames pile up in Idle, as after a missed tick.
        write_capture(&f, &vec![5_000i16; 3 * 1440]);
        f.controller.on_tick().await;

        f.controller.on_command(UserCommand::ToggleChat).await;
        assert_eq!(f.controller.state(), DeviceState::Listening);
        f.controller.on_tick().await;
        f.controller.on_tick().await;
        f.controller.bg_lane.join().await;

        assert!(
            !f.protocol.calls().iter().any(|c| c.starts_with("audio:")),
            "pre-turn audio was encoded"
        );
    }

    #[tokio::test]
    async fn matched_playback_frames_prime_the_canceller() {
        let mut f = fixture_with(|config| config.wake.enabled = true).await;
        f.controller.on_command(UserCommand::ToggleChat).await;
        f.controller
            .on_protocol_event(ProtocolEvent::IncomingMessage(ServerMessage::Tts {
                state: TtsState::Start,
                text: None,
            }))
            .await;
        assert_eq!(f.controller.state(), DeviceState::Speaking);

        // 30 ms of decoded playback and 30 ms of captured audio per tick.
        f.controller.on_decoded(vec![1_000i16; 480]);
        write_capture(&f, &vec![100i16; 1_440]);
        f.controller.on_tick().await; // first tick only sets the baseline
        assert_eq!(f.controller.far_backlog.len(), 480);

        f.controller.on_decoded(vec![1_000i16; 480]);
        write_capture(&f, &vec![100i16; 1_440]);
        f.controller.on_tick().await;

        // One matched pair fed one 30 ms quantum into the canceller.
        assert_eq!(f.controller.far_backlog.len(), 480);
    }

    #[tokio::test]
    async fn chat_and_emotion_messages_reach_the_display() {
        let mut f = fixture().await;
        f.controller
            .on_protocol_event(ProtocolEvent::IncomingMessage(ServerMessage::Stt {
                text: Some("turn on the lights".into()),
            }))
            .await;
        f.controller
            .on_protocol_event(ProtocolEvent::IncomingMessage(ServerMessage::Tts {
                state: TtsState::SentenceStart,
                text: Some("sure thing".into()),
            }))
            .await;

        let messages = f.display.messages.lock().unwrap().clone();
        assert_eq!(
            messages,
            vec![
                ("user".to_string(), "turn on the lights".to_string()),
                ("assistant".to_string(), "sure thing".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn iot_volume_command_is_applied() {
        let mut f = fixture().await;
        f.controller
            .on_protocol_event(ProtocolEvent::IncomingMessage(ServerMessage::Iot {
                commands: Some(json!([{
                    "name": "speaker",
                    "method": "set_volume",
                    "parameters": { "volume": 30 },
                }])),
            }))
            .await;
        assert_eq!(f.controller.engine.volume(), 30);
    }
}
