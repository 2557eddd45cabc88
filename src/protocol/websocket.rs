//! `tokio-tungstenite` implementation of the [`Protocol`] seam.
//!
//! One connection carries both channels: text frames are JSON control
//! messages, binary frames are single Opus packets.  Opening performs the
//! hello handshake under a timeout; a reader task then forwards incoming
//! traffic as [`ProtocolEvent`]s.  The channel is declared stale when no
//! traffic of any kind has arrived within the configured idle window.
//! `ChannelClosed` fires exactly once per open channel, no matter which side
//! initiated the close or how many times `close_audio_channel` is called.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::{AudioConfig, ServerConfig};
use crate::protocol::messages::{
    AbortMessage, AbortReason, ClientHello, IotMessage, ListenMessage, ListeningMode,
    ServerMessage,
};
use crate::protocol::{Protocol, ProtocolError, ProtocolEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state shared between the handle, the reader task and the
/// output-side send path.
struct LinkState {
    open: AtomicBool,
    /// Guards the exactly-once `ChannelClosed` event.
    closed_sent: AtomicBool,
    server_rate: AtomicU32,
    session_id: Mutex<Option<String>>,
    last_traffic: Mutex<Instant>,
}

impl LinkState {
    fn touch(&self) {
        *lock(&self.last_traffic) = Instant::now();
    }
}

/// `std::sync::Mutex` lock that survives a poisoned peer; the guarded values
/// are plain data, safe to read after a panic elsewhere.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn emit_closed(link: &LinkState, events: &mpsc::Sender<ProtocolEvent>) {
    link.open.store(false, Ordering::Relaxed);
    if !link.closed_sent.swap(true, Ordering::Relaxed) {
        let _ = events.send(ProtocolEvent::ChannelClosed).await;
    }
}

struct Connection {
    sink: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
}

pub struct WebSocketProtocol {
    config: ServerConfig,
    audio: AudioConfig,
    link: Arc<LinkState>,
    events: mpsc::Sender<ProtocolEvent>,
    conn: tokio::sync::Mutex<Option<Connection>>,
}

impl WebSocketProtocol {
    pub fn new(
        config: ServerConfig,
        audio: AudioConfig,
        events: mpsc::Sender<ProtocolEvent>,
    ) -> Self {
        let link = Arc::new(LinkState {
            open: AtomicBool::new(false),
            closed_sent: AtomicBool::new(true),
            // Until the server hello says otherwise, decode at the wire rate.
            server_rate: AtomicU32::new(audio.sample_rate),
            session_id: Mutex::new(None),
            last_traffic: Mutex::new(Instant::now()),
        });
        Self {
            config,
            audio,
            link,
            events,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    fn build_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ProtocolError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::InvalidUrl(e.to_string()))?;
        let headers = request.headers_mut();
        if !self.config.token.is_empty() {
            headers.insert(
                "Authorization",
                header_value(&format!("Bearer {}", self.config.token))?,
            );
        }
        headers.insert("Protocol-Version", HeaderValue::from_static("1"));
        headers.insert("Device-Id", header_value(&self.config.device_id)?);
        headers.insert("Client-Id", header_value(&self.config.client_id)?);
        Ok(request)
    }

    async fn send_message(&self, message: Message) -> Result<(), ProtocolError> {
        if !self.link.open.load(Ordering::Relaxed) {
            return Err(ProtocolError::ChannelClosed);
        }
        let mut conn = self.conn.lock().await;
        let conn = conn.as_mut().ok_or(ProtocolError::ChannelClosed)?;
        conn.sink
            .send(message)
            .await
            .map_err(|e| ProtocolError::Send(e.to_string()))
    }

    async fn send_json(&self, value: &impl serde::Serialize) -> Result<(), ProtocolError> {
        let text = serde_json::to_string(value)?;
        self.send_message(Message::Text(text)).await
    }
}

/// Reads control frames until the server hello arrives; anything else that
/// shows up first is not part of the handshake and is dropped.
async fn await_server_hello(
    stream: &mut SplitStream<WsStream>,
) -> Result<(Option<u32>, Option<String>), ProtocolError> {
    while let Some(item) = stream.next().await {
        let msg = item.map_err(|e| ProtocolError::Connect(e.to_string()))?;
        if let Message::Text(text) = msg {
            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Hello {
                    session_id,
                    audio_params,
                    ..
                }) => {
                    let rate = audio_params.and_then(|p| p.sample_rate);
                    return Ok((rate, session_id));
                }
                Ok(other) => debug!("dropping pre-hello control message: {other:?}"),
                Err(e) => warn!("unparseable control message during handshake: {e}"),
            }
        }
    }
    Err(ProtocolError::Connect(
        "connection closed during handshake".into(),
    ))
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    link: Arc<LinkState>,
    events: mpsc::Sender<ProtocolEvent>,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Binary(payload)) => {
                link.touch();
                if events
                    .send(ProtocolEvent::IncomingAudio(payload))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Message::Text(text)) => {
                link.touch();
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        if events
                            .send(ProtocolEvent::IncomingMessage(message))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => warn!("dropping unparseable control message: {e}"),
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => link.touch(),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                let _ = events
                    .send(ProtocolEvent::NetworkError(e.to_string()))
                    .await;
                break;
            }
        }
    }
    emit_closed(&link, &events).await;
}

#[async_trait]
impl Protocol for WebSocketProtocol {
    async fn open_audio_channel(&self) -> Result<(), ProtocolError> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() && self.link.open.load(Ordering::Relaxed) {
            return Ok(());
        }
        // Drop whatever is left of a previous connection before redialing.
        *conn = None;

        let request = self.build_request()?;
        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| ProtocolError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let hello = ClientHello::new(
            self.audio.sample_rate,
            self.audio.channels,
            self.audio.packet_ms,
        );
        sink.send(Message::Text(serde_json::to_string(&hello)?))
            .await
            .map_err(|e| ProtocolError::Send(e.to_string()))?;

        let secs = self.config.handshake_timeout_secs;
        let (rate, session_id) =
            tokio::time::timeout(Duration::from_secs(secs), await_server_hello(&mut stream))
                .await
                .map_err(|_| ProtocolError::HandshakeTimeout(secs))??;

        self.link
            .server_rate
            .store(rate.unwrap_or(self.audio.sample_rate), Ordering::Relaxed);
        *lock(&self.link.session_id) = session_id;
        self.link.touch();
        self.link.closed_sent.store(false, Ordering::Relaxed);
        self.link.open.store(true, Ordering::Relaxed);

        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&self.link),
            self.events.clone(),
        ));
        *conn = Some(Connection { sink, reader });

        info!(
            "audio channel open, decode rate {} Hz",
            self.link.server_rate.load(Ordering::Relaxed)
        );
        let _ = self.events.send(ProtocolEvent::ChannelOpened).await;
        Ok(())
    }

    async fn close_audio_channel(&self) {
        let mut conn = self.conn.lock().await;
        if let Some(mut connection) = conn.take() {
            let _ = connection.sink.send(Message::Close(None)).await;
            connection.reader.abort();
        }
        emit_closed(&self.link, &self.events).await;
    }

    fn is_audio_channel_open(&self) -> bool {
        if !self.link.open.load(Ordering::Relaxed) {
            return false;
        }
        let idle = lock(&self.link.last_traffic).elapsed();
        if idle > Duration::from_secs(self.config.idle_timeout_secs) {
            warn!("audio channel stale after {} s of silence", idle.as_secs());
            self.link.open.store(false, Ordering::Relaxed);
            if !self.link.closed_sent.swap(true, Ordering::Relaxed) {
                let _ = self.events.try_send(ProtocolEvent::ChannelClosed);
            }
            return false;
        }
        true
    }

    async fn send_audio(&self, payload: Vec<u8>) -> Result<(), ProtocolError> {
        self.send_message(Message::Binary(payload)).await
    }

    async fn send_start_listening(&self, mode: ListeningMode) -> Result<(), ProtocolError> {
        self.send_json(&ListenMessage::start(self.session_id(), mode))
            .await
    }

    async fn send_stop_listening(&self) -> Result<(), ProtocolError> {
        self.send_json(&ListenMessage::stop(self.session_id()))
            .await
    }

    async fn send_abort(&self, reason: Option<AbortReason>) -> Result<(), ProtocolError> {
        self.send_json(&AbortMessage::new(self.session_id(), reason))
            .await
    }

    async fn send_wake_word_detected(&self, keyword: &str) -> Result<(), ProtocolError> {
        self.send_json(&ListenMessage::detect(self.session_id(), keyword))
            .await
    }

    async fn send_iot_descriptors(
        &self,
        descriptors: serde_json::Value,
    ) -> Result<(), ProtocolError> {
        self.send_json(&IotMessage::descriptors(self.session_id(), descriptors))
            .await
    }

    async fn send_iot_states(&self, states: serde_json::Value) -> Result<(), ProtocolError> {
        self.send_json(&IotMessage::states(self.session_id(), states))
            .await
    }

    fn server_sample_rate(&self) -> u32 {
        self.link.server_rate.load(Ordering::Relaxed)
    }

    fn session_id(&self) -> Option<String> {
        lock(&self.link.session_id).clone()
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ProtocolError> {
    HeaderValue::from_str(value)
        .map_err(|e| ProtocolError::InvalidUrl(format!("invalid header value: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
