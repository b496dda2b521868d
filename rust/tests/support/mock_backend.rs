use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::broadcast;

#[derive(Debug, Default)]
pub struct MockState {
    pub statuses: HashMap<String, String>,
    pub active_call: Option<Value>,
    /// `"<METHOD> <action> <call_id>"`, in arrival order.
    pub requests: Vec<String>,
    pub bodies: Vec<Value>,
    pub auth_headers: Vec<String>,
    pub client_frames: Vec<Value>,
    pub ws_connections: usize,
    pub issued_tokens: usize,
}

/// Local REST + WebSocket stand-in for the call backend.
///
/// Runs on its own runtime so tests can stay synchronous, like the app shell.
pub struct MockBackend {
    pub api_url: String,
    pub signaling_url: String,
    state: Arc<Mutex<MockState>>,
    frames: broadcast::Sender<String>,
    _runtime: tokio::runtime::Runtime,
}

#[derive(Clone)]
struct Shared {
    state: Arc<Mutex<MockState>>,
    frames: broadcast::Sender<String>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn record(&self, headers: &HeaderMap, request: String, body: Option<Value>) {
        let mut state = self.lock();
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        state.auth_headers.push(auth);
        state.requests.push(request);
        if let Some(body) = body {
            state.bodies.push(body);
        }
    }

    fn credentials(&self, call_id: &str) -> Value {
        let mut state = self.lock();
        let token = format!("tok-{}", state.issued_tokens);
        state.issued_tokens += 1;
        json!({
            "channelName": format!("ch-{call_id}"),
            "token": token,
            "uid": 7,
            "agoraAppId": "mock-app",
        })
    }
}

fn ok(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

async fn initiate(
    State(shared): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    shared.record(&headers, "POST initiate -".to_string(), Some(body));
    shared
        .lock()
        .statuses
        .insert("C-out".to_string(), "ringing".to_string());
    ok(json!({ "callId": "C-out" }))
}

async fn call_post(
    State(shared): State<Shared>,
    Path((call_id, action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Json<Value> {
    shared.record(
        &headers,
        format!("POST {action} {call_id}"),
        body.map(|Json(v)| v),
    );
    match action.as_str() {
        "join" | "refresh-token" => ok(shared.credentials(&call_id)),
        "accept" => {
            shared
                .lock()
                .statuses
                .insert(call_id, "active".to_string());
            ok(json!({}))
        }
        "decline" | "end" => {
            shared
                .lock()
                .statuses
                .insert(call_id, "ended".to_string());
            ok(json!({}))
        }
        _ => Json(json!({ "success": false, "message": format!("unknown action {action}") })),
    }
}

async fn call_get(
    State(shared): State<Shared>,
    Path((call_id, action)): Path<(String, String)>,
    headers: HeaderMap,
) -> Json<Value> {
    shared.record(&headers, format!("GET {action} {call_id}"), None);
    if call_id == "active" && action == "user" {
        let active = shared.lock().active_call.clone();
        return ok(json!({ "activeCall": active }));
    }
    let status = shared.lock().statuses.get(&call_id).cloned();
    match status {
        Some(status) => ok(json!({ "status": status })),
        None => Json(json!({ "success": false, "message": "call not found" })),
    }
}

async fn signaling(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(shared): State<Shared>,
) -> Response {
    shared.record(&headers, "WS connect -".to_string(), None);
    ws.on_upgrade(move |socket| serve_socket(socket, shared))
}

async fn serve_socket(mut socket: WebSocket, shared: Shared) {
    let mut frames = shared.frames.subscribe();
    shared.lock().ws_connections += 1;
    let ready = json!({ "event": "connection_ready", "data": {} }).to_string();
    if socket.send(Message::Text(ready)).await.is_err() {
        return;
    }
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Ok(frame) = frame else { return };
                if socket.send(Message::Text(frame)).await.is_err() {
                    return;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            shared.lock().client_frames.push(value);
                        }
                    }
                    Some(Ok(_)) => {}
                    _ => return,
                }
            }
        }
    }
}

impl MockBackend {
    pub fn start() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (frames, _) = broadcast::channel(64);
        let state = Arc::new(Mutex::new(MockState::default()));
        let shared = Shared {
            state: state.clone(),
            frames: frames.clone(),
        };
        let app = Router::new()
            .route("/v1/call/initiate", post(initiate))
            .route("/v1/call/:call_id/:action", post(call_post).get(call_get))
            .route("/call", get(signaling))
            .with_state(shared);

        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        runtime.spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            api_url: format!("http://{addr}/v1/"),
            signaling_url: format!("ws://{addr}"),
            state,
            frames,
            _runtime: runtime,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_status(&self, call_id: &str, status: &str) {
        self.lock()
            .statuses
            .insert(call_id.to_string(), status.to_string());
    }

    pub fn requests(&self) -> Vec<String> {
        self.lock().requests.clone()
    }

    pub fn saw_request(&self, request: &str) -> bool {
        self.lock().requests.iter().any(|r| r == request)
    }

    /// Pushes a server frame to every connected signaling client.
    pub fn push(&self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        let _ = self.frames.send(frame);
    }

    pub fn ws_connections(&self) -> usize {
        self.lock().ws_connections
    }

    /// Writes a config pointing a data dir at this backend.
    pub fn write_config(&self, data_dir: &str) {
        let path = std::path::Path::new(data_dir).join("medcall_config.json");
        let v = json!({
            "api_base_url": self.api_url,
            "signaling_url": self.signaling_url,
            "join_retry_delay_ms": 20,
            "signaling_backoff_base_ms": 20,
            "signaling_backoff_max_ms": 100,
            "heartbeat_interval_ms": 200,
        });
        std::fs::write(path, serde_json::to_vec(&v).unwrap()).unwrap();
    }
}
