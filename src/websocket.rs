use crate::protocol::{InboundMessage, WsCommand};
use crate::types::{clamp_dimension, Brightness, PluginId, RotateDirection, DEFAULT_MATRIX_SIZE};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Identifier returned by [`WebSocketChannel::add_callback`]
pub type CallbackId = Uuid;

/// Error a callback may report; it is logged and otherwise ignored
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

type Callback = Arc<dyn Fn(&InboundMessage) -> Result<(), CallbackError> + Send + Sync>;

/// Connection state of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Exponential reconnect delay: doubles per failure up to a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns twice as much
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

/// Persistent WebSocket to `ws://{host}/ws`
///
/// Carries the commands the REST API lacks (rotation, plugin persistence)
/// and receives push frames from the device. Transport errors never leave
/// this type: operations report `false` and log the cause.
///
/// Once [`disconnect`](Self::disconnect) is called the channel stays closed,
/// refusing to connect or send, until [`reopen`](Self::reopen).
pub struct WebSocketChannel {
    url: String,
    state: Mutex<ChannelState>,
    /// Bumped on every successful connect so stale listeners cannot mark a
    /// newer connection as lost
    generation: AtomicU64,
    frame_len: AtomicUsize,
    writer: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    reader: tokio::sync::Mutex<Option<SplitStream<WsStream>>>,
    connect_lock: tokio::sync::Mutex<()>,
    callbacks: Mutex<Vec<(CallbackId, Callback)>>,
    closing_tx: watch::Sender<bool>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl WebSocketChannel {
    pub fn new(host: &str) -> Self {
        let (closing_tx, _) = watch::channel(false);
        let url = format!("ws://{}/ws", host);
        tracing::debug!("WebSocket channel initialized for {}", url);

        Self {
            url,
            state: Mutex::new(ChannelState::Disconnected),
            generation: AtomicU64::new(0),
            frame_len: AtomicUsize::new(DEFAULT_MATRIX_SIZE * DEFAULT_MATRIX_SIZE),
            writer: tokio::sync::Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            callbacks: Mutex::new(Vec::new()),
            closing_tx,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    /// Override the reconnect backoff bounds
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Display dimensions used to validate binary frames
    pub fn set_dimensions(&self, rows: usize, cols: usize) {
        let len = clamp_dimension(rows) * clamp_dimension(cols);
        self.frame_len.store(len, Ordering::SeqCst);
    }

    /// Bytes a binary frame must contain
    pub fn frame_len(&self) -> usize {
        self.frame_len.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn is_closing(&self) -> bool {
        *self.closing_tx.borrow()
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap() = state;
    }

    /// Mark the connection of `generation` as lost, unless a newer one replaced it
    fn mark_disconnected(&self, generation: u64) {
        let mut state = self.state.lock().unwrap();
        if self.generation.load(Ordering::SeqCst) == generation {
            *state = ChannelState::Disconnected;
        }
    }

    /// Open the socket; returns immediately if already connected
    pub async fn connect(&self) -> bool {
        if self.is_closing() {
            tracing::debug!("WebSocket connect skipped: closing requested");
            return false;
        }

        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return true;
        }

        self.set_state(ChannelState::Connecting);
        tracing::debug!("Connecting to WebSocket at {}", self.url);

        match connect_async(&self.url).await {
            Ok((stream, _)) => {
                let (write, read) = stream.split();
                *self.writer.lock().await = Some(write);
                *self.reader.lock().await = Some(read);
                self.generation.fetch_add(1, Ordering::SeqCst);

                if self.is_closing() {
                    // disconnect() raced with the handshake
                    self.writer.lock().await.take();
                    self.reader.lock().await.take();
                    self.set_state(ChannelState::Disconnected);
                    return false;
                }

                self.set_state(ChannelState::Connected);
                tracing::info!("WebSocket connected to {}", self.url);
                true
            }
            Err(e) => {
                tracing::error!("Failed to connect to WebSocket {}: {}", self.url, e);
                self.set_state(ChannelState::Disconnected);
                false
            }
        }
    }

    /// Flag the channel as closing without waiting on the socket
    ///
    /// Listeners and reconnect loops wake and return; the socket itself is
    /// released when the channel is dropped.
    pub fn close(&self) {
        self.closing_tx.send_replace(true);
    }

    /// Close the socket and stop any reconnect loop
    pub async fn disconnect(&self) {
        self.close();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close().await {
                tracing::debug!("Error closing WebSocket: {}", e);
            }
        }
        self.reader.lock().await.take();
        self.set_state(ChannelState::Disconnected);
        tracing::debug!("WebSocket disconnected");
    }

    /// Allow connecting again after [`disconnect`](Self::disconnect)
    pub fn reopen(&self) {
        self.closing_tx.send_replace(false);
    }

    /// Send a JSON text frame, reconnecting once if needed
    pub async fn send_json(&self, data: &Value) -> bool {
        if !self.ensure_connected().await {
            return false;
        }
        tracing::debug!("Sending WebSocket message: {}", data);
        self.send_frame(Message::Text(data.to_string())).await
    }

    /// Send one full display frame
    ///
    /// The payload must be exactly rows x cols bytes; anything else is
    /// rejected before touching the socket.
    pub async fn send_binary(&self, data: &[u8]) -> bool {
        let expected = self.frame_len();
        if data.len() != expected {
            tracing::error!(
                "Invalid binary data size: {} bytes (expected {})",
                data.len(),
                expected
            );
            return false;
        }
        if !self.ensure_connected().await {
            return false;
        }
        tracing::debug!("Sending {} bytes of binary data", data.len());
        self.send_frame(Message::Binary(data.to_vec())).await
    }

    async fn ensure_connected(&self) -> bool {
        if self.is_closing() {
            tracing::debug!("WebSocket send skipped: closing requested");
            return false;
        }
        if self.is_connected() {
            return true;
        }
        tracing::warn!("WebSocket not connected, attempting to reconnect");
        self.connect().await
    }

    async fn send_frame(&self, frame: Message) -> bool {
        let generation = self.generation.load(Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            tracing::error!("WebSocket writer missing");
            return false;
        };

        match sink.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to send WebSocket message: {}", e);
                writer.take();
                drop(writer);
                self.mark_disconnected(generation);
                false
            }
        }
    }

    async fn send_command(&self, command: WsCommand) -> bool {
        match command.to_value() {
            Ok(value) => self.send_json(&value).await,
            Err(e) => {
                tracing::error!("Failed to encode {:?}: {}", command, e);
                false
            }
        }
    }

    /// Rotate the display a quarter turn
    pub async fn rotate_display(&self, direction: RotateDirection) -> bool {
        self.send_command(WsCommand::Rotate { direction }).await
    }

    /// Make the current plugin the one shown after boot
    pub async fn persist_plugin(&self) -> bool {
        self.send_command(WsCommand::PersistPlugin).await
    }

    pub async fn set_plugin(&self, plugin: PluginId) -> bool {
        self.send_command(WsCommand::Plugin { plugin }).await
    }

    pub async fn set_brightness(&self, brightness: Brightness) -> bool {
        self.send_command(WsCommand::Brightness { brightness }).await
    }

    /// Ask the device to push its info over the socket
    pub async fn request_info(&self) -> bool {
        self.send_command(WsCommand::Info).await
    }

    /// Register a callback for inbound frames
    pub fn add_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&InboundMessage) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.callbacks.lock().unwrap().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback; returns whether it was registered
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap();
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        callbacks.len() != before
    }

    fn dispatch(&self, message: &InboundMessage) {
        let callbacks: Vec<(CallbackId, Callback)> = self.callbacks.lock().unwrap().clone();
        for (id, callback) in callbacks {
            if let Err(e) = callback(message) {
                tracing::error!("Error in WebSocket callback {}: {}", id, e);
            }
        }
    }

    /// Read frames until the connection closes, errors, or closing is requested
    pub async fn listen(&self) {
        if !self.is_connected() {
            tracing::debug!("WebSocket listen called while disconnected");
            return;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let Some(mut reader) = self.reader.lock().await.take() else {
            tracing::debug!("WebSocket is already being listened to");
            return;
        };
        let mut closing_rx = self.closing_tx.subscribe();

        loop {
            let frame = tokio::select! {
                _ = wait_closing(&mut closing_rx) => break,
                frame = reader.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => {
                        tracing::debug!("Received WebSocket message: {}", value);
                        self.dispatch(&InboundMessage::Json(value));
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse WebSocket message as JSON: {}", e);
                    }
                },
                Some(Ok(Message::Binary(data))) => {
                    tracing::debug!("Received {} bytes of binary data", data.len());
                    self.dispatch(&InboundMessage::Binary(data));
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("WebSocket connection closing");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {}", e);
                    break;
                }
            }
        }

        self.mark_disconnected(generation);
        tracing::debug!("WebSocket listener stopped");
    }

    /// Connect and listen in a loop until [`disconnect`](Self::disconnect)
    ///
    /// Reconnect attempts back off exponentially (1s doubling to a 300s cap by
    /// default); the delay resets after every successful connection.
    pub async fn listen_forever(&self) {
        let mut backoff = Backoff::new(self.initial_backoff, self.max_backoff);
        let mut closing_rx = self.closing_tx.subscribe();

        while !self.is_closing() {
            if !self.connect().await {
                let delay = backoff.next_delay();
                tracing::warn!("WebSocket connect failed, retrying in {:?}", delay);
                if sleep_unless_closing(delay, &mut closing_rx).await {
                    break;
                }
                continue;
            }

            backoff.reset();
            self.listen().await;

            if !self.is_closing() {
                let delay = backoff.next_delay();
                tracing::info!("WebSocket connection lost, reconnecting in {:?}", delay);
                if sleep_unless_closing(delay, &mut closing_rx).await {
                    break;
                }
            }
        }

        tracing::info!("WebSocket listener for {} finished", self.url);
    }
}

async fn wait_closing(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closing| *closing).await;
}

/// Sleep for `delay`; returns true if closing was requested meanwhile
async fn sleep_unless_closing(delay: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = wait_closing(rx) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
