//! In-process fake device serving the REST and WebSocket endpoints for tests

use crate::protocol::InboundMessage;
use axum::body::Bytes;
use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(crate) enum Push {
    Text(String),
    Close,
}

#[derive(Default)]
struct Inner {
    info: Value,
    failure: Option<u16>,
    non_json: bool,
    display: Vec<u8>,
    requests: Vec<RecordedRequest>,
    ws_received: Vec<InboundMessage>,
    ws_reject: bool,
    ws_connections: usize,
    ws_attempts: Vec<Instant>,
}

#[derive(Clone)]
struct Shared {
    inner: Arc<Mutex<Inner>>,
    push_tx: broadcast::Sender<Push>,
}

pub(crate) struct FakeDevice {
    addr: std::net::SocketAddr,
    shared: Shared,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeDevice {
    pub async fn start(info: Value) -> Self {
        let (push_tx, _) = broadcast::channel(16);
        let shared = Shared {
            inner: Arc::new(Mutex::new(Inner {
                info,
                ..Inner::default()
            })),
            push_tx,
        };

        let app = Router::new()
            .route("/ws", get(ws_upgrade))
            .fallback(api)
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            shared,
            handle,
        }
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap()
    }

    pub fn set_info(&self, info: Value) {
        self.inner().info = info;
    }

    /// Answer every REST request with this status code
    pub fn set_failure(&self, status: Option<u16>) {
        self.inner().failure = status;
    }

    pub fn set_non_json(&self, non_json: bool) {
        self.inner().non_json = non_json;
    }

    pub fn set_display(&self, data: Vec<u8>) {
        self.inner().display = data;
    }

    pub fn set_ws_reject(&self, reject: bool) {
        self.inner().ws_reject = reject;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner().requests.clone()
    }

    pub fn count_requests(&self, path: &str) -> usize {
        self.inner().requests.iter().filter(|r| r.path == path).count()
    }

    pub fn ws_received(&self) -> Vec<InboundMessage> {
        self.inner().ws_received.clone()
    }

    pub fn ws_connections(&self) -> usize {
        self.inner().ws_connections
    }

    /// When each WebSocket upgrade arrived, rejected ones included
    pub fn ws_attempts(&self) -> Vec<Instant> {
        self.inner().ws_attempts.clone()
    }

    /// Send a frame to every connected socket
    pub fn push(&self, push: Push) {
        let _ = self.shared.push_tx.send(push);
    }

    /// Poll until `check` holds or two seconds pass
    pub async fn wait_for(&self, check: impl Fn(&FakeDevice) -> bool) -> bool {
        for _ in 0..200 {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn api(State(shared): State<Shared>, method: Method, uri: Uri, body: Bytes) -> Response {
    let mut inner = shared.inner.lock().unwrap();
    inner.requests.push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        body: body.to_vec(),
    });

    if let Some(status) = inner.failure {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, "device error").into_response();
    }
    if inner.non_json {
        return "OK".into_response();
    }

    match uri.path() {
        "/api/info" => Json(inner.info.clone()).into_response(),
        "/api/data" => inner.display.clone().into_response(),
        path if path.starts_with("/api/") => Json(json!({"status": "ok"})).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_upgrade(State(shared): State<Shared>, ws: WebSocketUpgrade) -> Response {
    let reject = {
        let mut inner = shared.inner.lock().unwrap();
        inner.ws_attempts.push(Instant::now());
        if !inner.ws_reject {
            inner.ws_connections += 1;
        }
        inner.ws_reject
    };
    if reject {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| ws_session(socket, shared))
}

async fn ws_session(socket: WebSocket, shared: Shared) {
    let (mut write, mut read) = socket.split();
    let mut push_rx = shared.push_tx.subscribe();

    loop {
        tokio::select! {
            frame = read.next() => {
                let received = match frame {
                    Some(Ok(WsFrame::Text(text))) => match serde_json::from_str(text.as_str()) {
                        Ok(value) => InboundMessage::Json(value),
                        Err(_) => continue,
                    },
                    Some(Ok(WsFrame::Binary(data))) => InboundMessage::Binary(data.to_vec()),
                    Some(Ok(WsFrame::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                shared.inner.lock().unwrap().ws_received.push(received);
            }
            push = push_rx.recv() => {
                match push {
                    Ok(Push::Text(text)) => {
                        if write.send(WsFrame::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Ok(Push::Close) | Err(_) => {
                        let _ = write.send(WsFrame::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }
}
