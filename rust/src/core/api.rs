use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::session_store::ParticipantInfo;
use crate::state::{CallRole, CallType};

/// Backend statuses that mean the call can still be joined.
const ACTIVE_CALL_STATUSES: [&str; 3] = ["active", "connected", "ringing"];

pub(crate) type SharedAuthToken = Arc<RwLock<Option<String>>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCredentials {
    pub channel_name: String,
    pub token: String,
    pub uid: u32,
    #[serde(rename = "agoraAppId", alias = "appId")]
    pub app_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitiateCallRequest {
    pub target_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doctor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    pub call_type: CallType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appointment_id: Option<String>,
}

impl InitiateCallRequest {
    /// Fills the doctor/patient ids from the caller's role: the caller is one side,
    /// the target the other.
    pub fn new(
        caller_id: &str,
        caller_role: CallRole,
        target_user_id: &str,
        call_type: CallType,
        appointment_id: Option<String>,
    ) -> Self {
        let (doctor_id, patient_id) = match caller_role {
            CallRole::Doctor => (caller_id.to_string(), target_user_id.to_string()),
            CallRole::Patient => (target_user_id.to_string(), caller_id.to_string()),
        };
        Self {
            target_user_id: target_user_id.to_string(),
            doctor_id: Some(doctor_id),
            patient_id: Some(patient_id),
            call_type,
            appointment_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCallSummary {
    pub call_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub other_participant: Option<ParticipantInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeviceIdentity {
    pub label: String,
    pub id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not signed in")]
    MissingAuthToken,
    #[error("invalid request url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {status}: {}", .message.as_deref().unwrap_or("no message"))]
    Status { status: u16, message: Option<String> },
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("response missing data")]
    MissingData,
    #[error("malformed response: {0}")]
    Decode(String),
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateCallData {
    call_id: String,
}

#[derive(Debug, Deserialize)]
struct CallStatusData {
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveCallData {
    #[serde(default)]
    active_call: Option<ActiveCallSummary>,
}

/// REST surface the call core depends on.
#[async_trait]
pub(crate) trait CallBackend: Send + Sync {
    async fn initiate_call(&self, request: &InitiateCallRequest) -> Result<String, ApiError>;
    async fn join_call(
        &self,
        call_id: &str,
        device: &DeviceIdentity,
    ) -> Result<JoinCredentials, ApiError>;
    async fn accept_call(&self, call_id: &str) -> Result<(), ApiError>;
    async fn decline_call(&self, call_id: &str) -> Result<(), ApiError>;
    async fn end_call(&self, call_id: &str) -> Result<(), ApiError>;
    async fn call_status(&self, call_id: &str) -> Result<String, ApiError>;
    async fn refresh_token(
        &self,
        call_id: &str,
        device: &DeviceIdentity,
        reason: &str,
    ) -> Result<JoinCredentials, ApiError>;
    async fn active_call_for_user(&self) -> Result<Option<ActiveCallSummary>, ApiError>;
}

pub fn status_is_active(status: &str) -> bool {
    let status = status.trim();
    ACTIVE_CALL_STATUSES
        .iter()
        .any(|s| s.eq_ignore_ascii_case(status))
}

/// Remote status oracle. Any failure reads as "not active" so a dead call is never rejoined.
pub(crate) async fn is_call_active(backend: &dyn CallBackend, call_id: &str) -> bool {
    match backend.call_status(call_id).await {
        Ok(status) => {
            let active = status_is_active(&status);
            tracing::debug!(call_id, status = %status, active, "call status");
            active
        }
        Err(e) => {
            tracing::warn!(call_id, %e, "call status check failed, treating as inactive");
            false
        }
    }
}

pub(crate) struct HttpCallBackend {
    client: reqwest::Client,
    base_url: String,
    auth_token: SharedAuthToken,
}

impl HttpCallBackend {
    pub fn new(base_url: impl Into<String>, auth_token: SharedAuthToken) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
            auth_token,
        }
    }

    fn bearer(&self) -> Result<String, ApiError> {
        let guard = match self.auth_token.read() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        guard
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .ok_or(ApiError::MissingAuthToken)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<url::Url, ApiError> {
        let mut url = url::Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<serde_json::Value>,
    ) -> Result<Option<T>, ApiError> {
        let token = self.bearer()?;
        let url = self.endpoint(segments)?;
        let mut req = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        let envelope = match serde_json::from_str::<Envelope<T>>(&text) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    message: None,
                })
            }
            Err(e) => return Err(ApiError::Decode(e.to_string())),
        };
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: envelope.message,
            });
        }
        if !envelope.success {
            return Err(ApiError::Rejected(
                envelope
                    .message
                    .unwrap_or_else(|| "request was not successful".to_string()),
            ));
        }
        Ok(envelope.data)
    }

    async fn request_data<T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<serde_json::Value>,
    ) -> Result<T, ApiError> {
        self.request(method, segments, body)
            .await?
            .ok_or(ApiError::MissingData)
    }

    async fn post_unit(&self, segments: &[&str]) -> Result<(), ApiError> {
        self.request::<serde_json::Value>(Method::POST, segments, None)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl CallBackend for HttpCallBackend {
    async fn initiate_call(&self, request: &InitiateCallRequest) -> Result<String, ApiError> {
        let body = serde_json::to_value(request).map_err(|e| ApiError::Decode(e.to_string()))?;
        let data: InitiateCallData = self
            .request_data(Method::POST, &["call", "initiate"], Some(body))
            .await?;
        Ok(data.call_id)
    }

    async fn join_call(
        &self,
        call_id: &str,
        device: &DeviceIdentity,
    ) -> Result<JoinCredentials, ApiError> {
        let body = serde_json::json!({ "device": device.label, "deviceId": device.id });
        self.request_data(Method::POST, &["call", call_id, "join"], Some(body))
            .await
    }

    async fn accept_call(&self, call_id: &str) -> Result<(), ApiError> {
        self.post_unit(&["call", call_id, "accept"]).await
    }

    async fn decline_call(&self, call_id: &str) -> Result<(), ApiError> {
        self.post_unit(&["call", call_id, "decline"]).await
    }

    async fn end_call(&self, call_id: &str) -> Result<(), ApiError> {
        self.post_unit(&["call", call_id, "end"]).await
    }

    async fn call_status(&self, call_id: &str) -> Result<String, ApiError> {
        let data: CallStatusData = self
            .request_data(Method::GET, &["call", call_id, "status"], None)
            .await?;
        Ok(data.status)
    }

    async fn refresh_token(
        &self,
        call_id: &str,
        device: &DeviceIdentity,
        reason: &str,
    ) -> Result<JoinCredentials, ApiError> {
        let body = serde_json::json!({
            "device": device.label,
            "deviceId": device.id,
            "reason": reason,
        });
        self.request_data(Method::POST, &["call", call_id, "refresh-token"], Some(body))
            .await
    }

    async fn active_call_for_user(&self) -> Result<Option<ActiveCallSummary>, ApiError> {
        let data: Option<ActiveCallData> = self
            .request(Method::GET, &["call", "active", "user"], None)
            .await?;
        Ok(data.and_then(|d| d.active_call))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};

    use super::*;

    #[derive(Clone, Default)]
    struct Hits(Arc<AtomicUsize>);

    async fn status_handler(
        State(hits): State<Hits>,
        headers: HeaderMap,
        Path(call_id): Path<String>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        hits.0.fetch_add(1, Ordering::SeqCst);
        assert_eq!(
            headers.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer secret")
        );
        match call_id.as_str() {
            "live" => (
                StatusCode::OK,
                Json(serde_json::json!({"success": true, "data": {"status": "Connected"}})),
            ),
            "over" => (
                StatusCode::OK,
                Json(serde_json::json!({"success": true, "data": {"status": "ended"}})),
            ),
            "garbled" => (
                StatusCode::OK,
                Json(serde_json::json!({"success": true, "data": {"nope": 1}})),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"success": false, "message": "boom"})),
            ),
        }
    }

    async fn join_handler(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
        assert_eq!(body["device"], "test-device");
        Json(serde_json::json!({
            "success": true,
            "data": {"channelName": "ch1", "token": "t1", "uid": 7, "agoraAppId": "app"}
        }))
    }

    async fn spawn_server(hits: Hits) -> String {
        let app = Router::new()
            .route("/api/call/:id/status", get(status_handler))
            .route("/api/call/:id/join", post(join_handler))
            .with_state(hits);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api")
    }

    fn backend(base: &str, token: Option<&str>) -> HttpCallBackend {
        HttpCallBackend::new(base, Arc::new(RwLock::new(token.map(ToString::to_string))))
    }

    #[test]
    fn active_statuses_are_case_insensitive() {
        assert!(status_is_active("ACTIVE"));
        assert!(status_is_active("ringing"));
        assert!(status_is_active(" Connected "));
        assert!(!status_is_active("ended"));
        assert!(!status_is_active(""));
    }

    #[test]
    fn initiate_request_assigns_roles() {
        let req = InitiateCallRequest::new("pat-1", CallRole::Patient, "doc-1", CallType::Video, None);
        assert_eq!(req.doctor_id.as_deref(), Some("doc-1"));
        assert_eq!(req.patient_id.as_deref(), Some("pat-1"));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["callType"], "video");
        assert!(json.get("appointmentId").is_none());
    }

    #[tokio::test]
    async fn oracle_reports_live_and_dead_calls() {
        let hits = Hits::default();
        let base = spawn_server(hits.clone()).await;
        let api = backend(&base, Some("secret"));
        assert!(is_call_active(&api, "live").await);
        assert!(!is_call_active(&api, "over").await);
        assert!(!is_call_active(&api, "garbled").await);
        assert!(!is_call_active(&api, "broken").await);
        assert_eq!(hits.0.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn missing_token_short_circuits_before_network() {
        let hits = Hits::default();
        let base = spawn_server(hits.clone()).await;
        let api = backend(&base, None);
        assert!(!is_call_active(&api, "live").await);
        assert!(matches!(
            api.call_status("live").await,
            Err(ApiError::MissingAuthToken)
        ));
        assert_eq!(hits.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn join_decodes_credentials() {
        let base = spawn_server(Hits::default()).await;
        let api = backend(&base, Some("secret"));
        let device = DeviceIdentity {
            label: "test-device".into(),
            id: "d1".into(),
        };
        let creds = api.join_call("C1", &device).await.unwrap();
        assert_eq!(
            creds,
            JoinCredentials {
                channel_name: "ch1".into(),
                token: "t1".into(),
                uid: 7,
                app_id: "app".into(),
            }
        );
    }

    #[tokio::test]
    async fn server_error_carries_message() {
        let base = spawn_server(Hits::default()).await;
        let api = backend(&base, Some("secret"));
        match api.call_status("broken").await {
            Err(ApiError::Status { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message.as_deref(), Some("boom"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }
}
