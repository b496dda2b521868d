use std::time::Duration;

use flume::Sender;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::AppCore;
use crate::state::ConnectionState;
use crate::updates::{CoreMsg, InternalEvent};

const CALL_NAMESPACE: &str = "call";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub heartbeat_interval: Duration,
}

/// Server-pushed call events, normalized from `{"event", "data"}` frames.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    IncomingCall(Value),
    CallAccepted {
        call_id: String,
    },
    CallDeclined {
        call_id: String,
    },
    CallEnded {
        call_id: String,
        reason: Option<String>,
    },
    ParticipantJoined {
        call_id: String,
        user_id: Option<String>,
    },
    ParticipantLeft {
        call_id: String,
        user_id: Option<String>,
    },
    ConnectionReady,
    ConnectionError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),
    #[error("not signed in")]
    MissingAuthToken,
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    #[error("server refused connection: {0}")]
    Rejected(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("websocket error: {0}")]
    Transport(String),
    #[error("signaling unavailable after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn string_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

pub(crate) fn parse_frame(text: &str) -> Option<SignalingEvent> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(%e, "signaling: dropping non-json frame");
            return None;
        }
    };
    let Some(event) = frame.get("event").and_then(Value::as_str) else {
        tracing::debug!("signaling: dropping frame without event name");
        return None;
    };
    let data = frame.get("data").cloned().unwrap_or(Value::Null);
    let call_id = string_field(&data, "callId");

    let needs_call_id = |build: fn(String, &Value) -> SignalingEvent| match call_id.clone() {
        Some(id) => Some(build(id, &data)),
        None => {
            tracing::warn!(event, "signaling: dropping frame without callId");
            None
        }
    };

    match event {
        "connection_ready" => Some(SignalingEvent::ConnectionReady),
        "incoming_call" => Some(SignalingEvent::IncomingCall(data.clone())),
        "call_accepted" => needs_call_id(|call_id, _| SignalingEvent::CallAccepted { call_id }),
        "call_declined" => needs_call_id(|call_id, _| SignalingEvent::CallDeclined { call_id }),
        "call_ended" => needs_call_id(|call_id, data| SignalingEvent::CallEnded {
            call_id,
            reason: string_field(data, "reason"),
        }),
        "participant_joined" => needs_call_id(|call_id, data| SignalingEvent::ParticipantJoined {
            call_id,
            user_id: string_field(data, "userId"),
        }),
        "participant_left" => needs_call_id(|call_id, data| SignalingEvent::ParticipantLeft {
            call_id,
            user_id: string_field(data, "userId"),
        }),
        "error" | "connection_error" => Some(SignalingEvent::ConnectionError(
            string_field(&data, "message").unwrap_or_else(|| "signaling server error".to_string()),
        )),
        "pong" => None,
        other => {
            tracing::debug!(event = other, "signaling: ignoring unknown event");
            None
        }
    }
}

fn encode_frame(event: &str, data: Value) -> String {
    serde_json::json!({ "event": event, "data": data }).to_string()
}

/// `<base>/call`, with http(s) mapped onto ws(s).
pub(crate) fn call_namespace_url(base: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(base.trim()).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(SignalingError::InvalidUrl(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(base.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| SignalingError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .push(CALL_NAMESPACE);
    Ok(url)
}

pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.checked_mul(2).map(|next| next.min(max)).unwrap_or(max)
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A socket that has seen `connection_ready`.
pub struct SignalingConnection {
    stream: WsStream,
    // Events that arrived before the ready frame; delivered first by `run`.
    pending: Vec<SignalingEvent>,
}

/// Opens the call namespace, retrying with exponential backoff up to `max_attempts`.
pub async fn connect(
    config: &SignalingConfig,
    token: &str,
) -> Result<SignalingConnection, SignalingError> {
    if token.trim().is_empty() {
        return Err(SignalingError::MissingAuthToken);
    }
    let url = call_namespace_url(&config.url)?;
    let mut attempts = 0u32;
    let mut backoff = config.backoff_base;

    loop {
        attempts = attempts.saturating_add(1);
        let attempt = match tokio::time::timeout(config.connect_timeout, connect_once(&url, token))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SignalingError::Timeout(config.connect_timeout)),
        };
        let error = match attempt {
            Ok(conn) => {
                tracing::info!(attempts, url = %url, "signaling connected");
                return Ok(conn);
            }
            Err(e) => e.to_string(),
        };
        if attempts >= config.max_attempts {
            tracing::warn!(attempts, "signaling connect attempt failed: {error}");
            return Err(SignalingError::Exhausted {
                attempts,
                last_error: error,
            });
        }
        tracing::warn!(
            attempts,
            retry_in_ms = backoff.as_millis() as u64,
            "signaling connect attempt failed: {error}"
        );
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff, config.backoff_max);
    }
}

async fn connect_once(url: &Url, token: &str) -> Result<SignalingConnection, SignalingError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| SignalingError::Handshake(e.to_string()))?;
    let auth = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
        .map_err(|_| SignalingError::Handshake("auth token is not a valid header".to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, auth);

    let (mut stream, _response) = connect_async(request)
        .await
        .map_err(|e| SignalingError::Handshake(e.to_string()))?;

    let mut pending = Vec::new();
    while let Some(msg) = stream.next().await {
        match msg.map_err(|e| SignalingError::Transport(e.to_string()))? {
            Message::Text(text) => match parse_frame(text.as_str()) {
                Some(SignalingEvent::ConnectionReady) => {
                    return Ok(SignalingConnection { stream, pending })
                }
                Some(SignalingEvent::ConnectionError(message)) => {
                    return Err(SignalingError::Rejected(message))
                }
                Some(event) => pending.push(event),
                None => {}
            },
            Message::Close(_) => return Err(SignalingError::Closed),
            _ => {}
        }
    }
    Err(SignalingError::Closed)
}

impl SignalingConnection {
    /// Pumps frames until the socket closes. Announces presence once, then heartbeats
    /// on `heartbeat`; the heartbeat lives and dies with this future.
    pub async fn run<F>(
        mut self,
        heartbeat: Duration,
        user_id: Option<String>,
        mut on_event: F,
    ) -> Result<(), SignalingError>
    where
        F: FnMut(SignalingEvent),
    {
        for event in std::mem::take(&mut self.pending) {
            on_event(event);
        }
        if let Some(user_id) = user_id {
            self.send("user_online", serde_json::json!({ "userId": user_id }))
                .await?;
        }

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.send("ping", serde_json::json!({ "ts": now_millis() })).await?;
                }
                msg = self.stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = parse_frame(text.as_str()) {
                            on_event(event);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "signaling: server closed connection");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(SignalingError::Transport(e.to_string())),
                    None => return Ok(()),
                }
            }
        }
    }

    async fn send(&mut self, event: &str, data: Value) -> Result<(), SignalingError> {
        self.stream
            .send(Message::text(encode_frame(event, data)))
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))
    }
}

struct ConnectionTask(tokio::task::JoinHandle<()>);

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Actor-side handle: at most one connection task, generation-tagged events.
pub(crate) struct SignalingChannel {
    generation: u64,
    state: ConnectionState,
    task: Option<ConnectionTask>,
}

impl SignalingChannel {
    pub fn new() -> Self {
        Self {
            generation: 0,
            state: ConnectionState::Disconnected,
            task: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Tears down any running connection and starts a new one. Returns the new generation.
    pub fn start(
        &mut self,
        runtime: &tokio::runtime::Runtime,
        config: SignalingConfig,
        token: String,
        user_id: Option<String>,
        core_sender: Sender<CoreMsg>,
    ) -> u64 {
        self.task = None;
        self.generation = self.generation.saturating_add(1);
        self.state = ConnectionState::Connecting;
        let generation = self.generation;

        let handle = runtime.spawn(async move {
            let send = move |internal: InternalEvent| {
                let _ = core_sender.send(CoreMsg::Internal(Box::new(internal)));
            };
            match connect(&config, &token).await {
                Ok(conn) => {
                    send(InternalEvent::SignalingStateChanged {
                        generation,
                        state: ConnectionState::Connected,
                        error: None,
                    });
                    send(InternalEvent::SignalingEvent {
                        generation,
                        event: SignalingEvent::ConnectionReady,
                    });
                    let result = conn
                        .run(config.heartbeat_interval, user_id, |event| {
                            send(InternalEvent::SignalingEvent { generation, event })
                        })
                        .await;
                    send(InternalEvent::SignalingStateChanged {
                        generation,
                        state: ConnectionState::Disconnected,
                        error: result.err().map(|e| e.to_string()),
                    });
                }
                Err(e) => {
                    send(InternalEvent::SignalingEvent {
                        generation,
                        event: SignalingEvent::ConnectionError(e.to_string()),
                    });
                    send(InternalEvent::SignalingStateChanged {
                        generation,
                        state: ConnectionState::Disconnected,
                        error: Some(e.to_string()),
                    });
                }
            }
        });
        self.task = Some(ConnectionTask(handle));
        generation
    }

    pub fn stop(&mut self) {
        self.task = None;
        self.generation = self.generation.saturating_add(1);
        self.state = ConnectionState::Disconnected;
    }
}

impl AppCore {
    fn signaling_allowed(&self) -> bool {
        self.config.network_enabled() && self.credentials.is_some()
    }

    pub(super) fn ensure_signaling_connected(&mut self) {
        if !self.signaling_allowed() || self.signaling.state() != ConnectionState::Disconnected {
            return;
        }
        self.start_signaling();
    }

    pub(super) fn force_reconnect_signaling(&mut self) {
        if !self.signaling_allowed() {
            return;
        }
        self.start_signaling();
    }

    fn start_signaling(&mut self) {
        let Some(creds) = self.credentials.clone() else {
            return;
        };
        let generation = self.signaling.start(
            &self.runtime,
            self.config.signaling_config(),
            creds.auth_token,
            Some(creds.user_id),
            self.core_sender.clone(),
        );
        tracing::info!(generation, "signaling: connecting");
        self.publish_signaling_state();
    }

    pub(super) fn disconnect_signaling(&mut self) {
        self.signaling.stop();
        self.publish_signaling_state();
    }

    fn publish_signaling_state(&mut self) {
        let state = self.signaling.state();
        if self.state.signaling != state {
            self.state.signaling = state;
            self.emit_state();
        }
    }

    pub(super) fn handle_signaling_state_changed(
        &mut self,
        generation: u64,
        state: ConnectionState,
        error: Option<String>,
    ) {
        if !self.signaling.is_current(generation) {
            tracing::debug!(generation, "signaling: stale state change ignored");
            return;
        }
        let previous = self.signaling.state();
        self.signaling.set_state(state);
        if state == ConnectionState::Disconnected {
            if let Some(error) = &error {
                tracing::warn!(generation, error = %error, "signaling disconnected");
            }
            if previous == ConnectionState::Connected && self.signaling_allowed() {
                self.schedule_signaling_reconnect(generation);
            }
        }
        self.publish_signaling_state();
    }

    fn schedule_signaling_reconnect(&self, generation: u64) {
        let delay = self.config.signaling_config().backoff_base;
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::SignalingReconnectDue { generation },
            )));
        });
    }

    pub(super) fn handle_signaling_reconnect_due(&mut self, generation: u64) {
        if !self.signaling.is_current(generation) {
            return;
        }
        self.ensure_signaling_connected();
    }

    pub(super) fn handle_signaling_event(&mut self, generation: u64, event: SignalingEvent) {
        if !self.signaling.is_current(generation) {
            tracing::debug!(generation, "signaling: stale event ignored");
            return;
        }
        match event {
            SignalingEvent::IncomingCall(payload) => self.handle_incoming_call_payload(payload),
            SignalingEvent::CallAccepted { call_id } => self.handle_remote_call_accepted(&call_id),
            SignalingEvent::CallDeclined { call_id } => self.handle_remote_call_declined(&call_id),
            SignalingEvent::CallEnded { call_id, reason } => {
                self.handle_remote_call_ended(&call_id, reason)
            }
            SignalingEvent::ParticipantJoined { call_id, .. } => {
                self.handle_remote_participant(&call_id, true)
            }
            SignalingEvent::ParticipantLeft { call_id, .. } => {
                self.handle_remote_participant(&call_id, false)
            }
            SignalingEvent::ConnectionReady => {
                tracing::info!(generation, "signaling: ready");
            }
            SignalingEvent::ConnectionError(message) => {
                tracing::warn!(generation, message = %message, "signaling: connection error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;
    use tokio::sync::mpsc;

    use super::*;

    fn config(url: String) -> SignalingConfig {
        SignalingConfig {
            url,
            connect_timeout: Duration::from_millis(500),
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            heartbeat_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn frames_are_normalized() {
        assert_eq!(
            parse_frame(r#"{"event":"connection_ready","data":{}}"#),
            Some(SignalingEvent::ConnectionReady)
        );
        assert_eq!(
            parse_frame(r#"{"event":"call_ended","data":{"callId":"C1","reason":"hangup"}}"#),
            Some(SignalingEvent::CallEnded {
                call_id: "C1".into(),
                reason: Some("hangup".into())
            })
        );
        assert_eq!(
            parse_frame(r#"{"event":"participant_left","data":{"callId":"C1","userId":"u2"}}"#),
            Some(SignalingEvent::ParticipantLeft {
                call_id: "C1".into(),
                user_id: Some("u2".into())
            })
        );
        assert!(matches!(
            parse_frame(r#"{"event":"incoming_call","data":{"callId":"C9"}}"#),
            Some(SignalingEvent::IncomingCall(_))
        ));
    }

    #[test]
    fn frames_without_call_id_are_dropped() {
        assert_eq!(parse_frame(r#"{"event":"call_ended","data":{}}"#), None);
        assert_eq!(parse_frame(r#"{"event":"call_ended","data":{"callId":""}}"#), None);
        assert_eq!(parse_frame(r#"{"event":"call_accepted","data":{"callId":7}}"#), None);
        assert_eq!(parse_frame("not json"), None);
        assert_eq!(parse_frame(r#"{"data":{}}"#), None);
        assert_eq!(parse_frame(r#"{"event":"mystery"}"#), None);
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let max = Duration::from_secs(8);
        let mut delay = Duration::from_millis(500);
        let mut seen = vec![delay];
        for _ in 0..5 {
            delay = next_backoff(delay, max);
            seen.push(delay);
        }
        let ms: Vec<u64> = seen.iter().map(|d| d.as_millis() as u64).collect();
        assert_eq!(ms, vec![500, 1000, 2000, 4000, 8000, 8000]);
    }

    #[test]
    fn namespace_url_maps_scheme_and_appends_path() {
        assert_eq!(
            call_namespace_url("https://api.example.com").unwrap().as_str(),
            "wss://api.example.com/call"
        );
        assert_eq!(
            call_namespace_url("ws://127.0.0.1:4000/rt/").unwrap().as_str(),
            "ws://127.0.0.1:4000/rt/call"
        );
        assert!(call_namespace_url("ftp://x").is_err());
        assert!(call_namespace_url("::").is_err());
    }

    async fn ws_route(
        ws: WebSocketUpgrade,
        headers: HeaderMap,
        State(seen): State<mpsc::UnboundedSender<String>>,
    ) -> Response {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let _ = seen.send(format!("auth:{auth}"));
        ws.on_upgrade(move |socket| serve_socket(socket, seen))
    }

    async fn serve_socket(mut socket: WebSocket, seen: mpsc::UnboundedSender<String>) {
        let early = r#"{"event":"call_ended","data":{"callId":"EARLY"}}"#;
        let ready = r#"{"event":"connection_ready","data":{}}"#;
        let offer = r#"{"event":"incoming_call","data":{"callId":"C1","callerId":"d1"}}"#;
        for frame in [early, ready, offer] {
            if socket.send(AxumMessage::Text(frame.to_string())).await.is_err() {
                return;
            }
        }
        while let Some(Ok(msg)) = socket.recv().await {
            if let AxumMessage::Text(text) = msg {
                let _ = seen.send(text);
            }
        }
    }

    async fn spawn_ws_server() -> (String, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new().route("/call", get(ws_route)).with_state(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("ws://{addr}"), rx)
    }

    #[tokio::test]
    async fn connect_authenticates_and_pumps_events_with_heartbeat() {
        let (url, mut seen) = spawn_ws_server().await;
        let conn = connect(&config(url), "secret").await.unwrap();
        assert_eq!(seen.recv().await.unwrap(), "auth:Bearer secret");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(conn.run(
            Duration::from_millis(20),
            Some("u1".to_string()),
            move |event| {
                let _ = events_tx.send(event);
            },
        ));

        assert_eq!(
            events_rx.recv().await.unwrap(),
            SignalingEvent::CallEnded {
                call_id: "EARLY".into(),
                reason: None
            }
        );
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            SignalingEvent::IncomingCall(_)
        ));

        let online: Value = serde_json::from_str(&seen.recv().await.unwrap()).unwrap();
        assert_eq!(online["event"], "user_online");
        assert_eq!(online["data"]["userId"], "u1");
        let ping: Value = serde_json::from_str(&seen.recv().await.unwrap()).unwrap();
        assert_eq!(ping["event"], "ping");
        assert!(ping["data"]["ts"].as_u64().unwrap() > 0);

        pump.abort();
    }

    #[tokio::test]
    async fn connect_gives_up_after_bounded_attempts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        match connect(&config(format!("ws://{addr}")), "secret").await {
            Err(SignalingError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });
        let mut cfg = config(format!("ws://{addr}"));
        cfg.max_attempts = 1;
        cfg.connect_timeout = Duration::from_millis(50);
        match connect(&cfg, "secret").await {
            Err(SignalingError::Exhausted { last_error, .. }) => {
                assert!(last_error.contains("timed out"), "{last_error}")
            }
            other => panic!("expected timeout, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn empty_token_is_rejected_without_io() {
        let cfg = config("ws://127.0.0.1:1".to_string());
        assert!(matches!(
            connect(&cfg, "  ").await,
            Err(SignalingError::MissingAuthToken)
        ));
    }
}
