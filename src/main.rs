//! Application entry point — voice-assistant device client.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (returns default on first run).
//! 3. Open the runtime settings store (volume, input device).
//! 4. Build the audio engine on the cpal backend.
//! 5. Build the WebSocket transport and the event channels.
//! 6. Spawn the stdin command reader.
//! 7. Run the conversation controller on the main thread — the audio
//!    backend's stream handles are not `Send`, so the controller loop must
//!    stay here; everything else runs on runtime workers.

use std::sync::Arc;

use anyhow::{Context, Result};
use env_logger::Env;
use log::{info, warn};
use tokio::sync::mpsc;

use voice_client::{
    audio::{AudioIoEngine, CpalBackend},
    config::{AppConfig, SettingsStore},
    controller::{ConversationController, UserCommand},
    display::LogDisplay,
    protocol::WebSocketProtocol,
    PreActivated,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = AppConfig::load().context("loading settings.toml")?;
    info!(
        "starting voice client (server {}, wire rate {} Hz)",
        config.server.url, config.audio.sample_rate
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("tokio runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: AppConfig) -> Result<()> {
    let store = SettingsStore::open().context("opening runtime settings")?;
    let engine = AudioIoEngine::new(Box::new(CpalBackend::new()), config.audio.clone(), store);

    let (protocol_tx, protocol_rx) = mpsc::channel(64);
    let protocol = Arc::new(WebSocketProtocol::new(
        config.server.clone(),
        config.audio.clone(),
        protocol_tx,
    ));

    let (command_tx, command_rx) = mpsc::channel(16);
    spawn_command_reader(command_tx);

    let mut controller = ConversationController::new(
        config,
        engine,
        protocol,
        protocol_rx,
        command_rx,
        Arc::new(LogDisplay),
        Arc::new(PreActivated),
    )?;
    controller.run().await
}

/// Reads commands from stdin on a plain thread (stdin has no async story
/// worth the trouble here) and forwards them to the control loop.
fn spawn_command_reader(commands: mpsc::Sender<UserCommand>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            if stdin.read_line(&mut line).unwrap_or(0) == 0 {
                return; // EOF; the controller keeps running on wake words
            }
            match parse_command(&line) {
                Some(command) => {
                    let quit = command == UserCommand::Quit;
                    if commands.blocking_send(command).is_err() || quit {
                        return;
                    }
                }
                None => {
                    warn!("unknown command: {}", line.trim());
                    eprintln!(
                        "commands: toggle | start | stop | abort | volume <0-100> | input <index> | quit"
                    );
                }
            }
        }
    });
}

fn parse_command(line: &str) -> Option<UserCommand> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "toggle" | "t" => Some(UserCommand::ToggleChat),
        "start" => Some(UserCommand::StartListening),
        "stop" => Some(UserCommand::StopListening),
        "abort" => Some(UserCommand::AbortSpeaking),
        "volume" | "v" => parts
            .next()
            .and_then(|v| v.parse().ok())
            .map(UserCommand::SetVolume),
        "input" => parts
            .next()
            .and_then(|i| i.parse().ok())
            .map(UserCommand::SwitchInput),
        "quit" | "q" | "exit" => Some(UserCommand::Quit),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(parse_command("toggle\n"), Some(UserCommand::ToggleChat));
        assert_eq!(parse_command("t"), Some(UserCommand::ToggleChat));
        assert_eq!(parse_command("volume 40"), Some(UserCommand::SetVolume(40)));
        assert_eq!(parse_command("input 1"), Some(UserCommand::SwitchInput(1)));
        assert_eq!(parse_command("q"), Some(UserCommand::Quit));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("volume loud"), None);
        assert_eq!(parse_command("dance"), None);
    }
}
