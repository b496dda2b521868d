use serde::{Deserialize, Serialize};

/// Full snapshot pushed to the native shell on every change.
#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct AppState {
    pub rev: u64,
    pub auth: AuthState,
    pub signaling: ConnectionState,
    pub active_call: Option<CallState>,
    pub incoming_call: Option<IncomingCallState>,
    pub resume_prompt: Option<ResumePrompt>,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            auth: AuthState::LoggedOut,
            signaling: ConnectionState::Disconnected,
            active_call: None,
            incoming_call: None,
            resume_prompt: None,
            toast: None,
        }
    }

    pub fn call_phase(&self) -> CallPhase {
        match self.active_call.as_ref().map(|c| &c.status) {
            None => CallPhase::Idle,
            Some(CallStatus::Connecting) => CallPhase::Connecting,
            Some(CallStatus::InCall) => CallPhase::InCall,
            Some(CallStatus::Reconnecting) => CallPhase::Reconnecting,
            Some(CallStatus::Ended { .. }) => CallPhase::Ended,
        }
    }
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    LoggedOut,
    LoggedIn { user_id: String, role: CallRole },
}

#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Patient,
    Doctor,
}

#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Voice => "voice",
            CallType::Video => "video",
        }
    }

    /// Unknown or missing call types are treated as voice.
    pub fn parse_lenient(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "video" => CallType::Video,
            _ => CallType::Voice,
        }
    }
}

#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Flat view of the call state machine, `Idle` meaning "no active call".
#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Connecting,
    InCall,
    Reconnecting,
    Ended,
}

#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum CallStatus {
    Connecting,
    InCall,
    Reconnecting,
    Ended { reason: String },
}

#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct CallState {
    pub call_id: String,
    pub role: CallRole,
    pub call_type: CallType,
    pub status: CallStatus,
    pub appointment_id: Option<String>,
    pub other_participant_id: Option<String>,
    pub other_participant_name: Option<String>,
    pub other_participant_avatar: Option<String>,
    pub started_at: Option<i64>,
    pub duration_display: Option<String>,
    pub awaiting_answer: bool,
    pub remote_joined: bool,
    pub is_muted: bool,
    pub is_camera_enabled: bool,
    pub demo_mode: bool,
    pub error: Option<String>,
    pub can_retry: bool,
}

impl CallState {
    pub fn connecting(call_id: impl Into<String>, role: CallRole, call_type: CallType) -> Self {
        Self {
            call_id: call_id.into(),
            role,
            call_type,
            status: CallStatus::Connecting,
            appointment_id: None,
            other_participant_id: None,
            other_participant_name: None,
            other_participant_avatar: None,
            started_at: None,
            duration_display: None,
            awaiting_answer: false,
            remote_joined: false,
            is_muted: false,
            is_camera_enabled: matches!(call_type, CallType::Video),
            demo_mode: false,
            error: None,
            can_retry: false,
        }
    }

    /// `InCall` or `Reconnecting`: the user is (or is being put back) in the call.
    pub fn is_live(&self) -> bool {
        matches!(self.status, CallStatus::InCall | CallStatus::Reconnecting)
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.status, CallStatus::Ended { .. })
    }

    pub fn is_joining(&self) -> bool {
        matches!(self.status, CallStatus::Connecting | CallStatus::Reconnecting)
    }

    pub fn set_status(&mut self, status: CallStatus) {
        self.status = status;
    }

    pub fn refresh_duration_display(&mut self, now: i64) {
        self.duration_display = self
            .started_at
            .map(|started| format_call_duration(now.saturating_sub(started)));
    }
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct IncomingCallState {
    pub call_id: String,
    pub caller_id: String,
    pub caller_name: String,
    pub caller_avatar: Option<String>,
    pub call_type: CallType,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct ResumePrompt {
    pub call_id: String,
    pub other_participant_name: Option<String>,
    pub started_at: Option<i64>,
}

pub fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn format_call_duration(elapsed_secs: i64) -> String {
    let secs = elapsed_secs.max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formats_minutes_and_hours() {
        assert_eq!(format_call_duration(0), "00:00");
        assert_eq!(format_call_duration(65), "01:05");
        assert_eq!(format_call_duration(3 * 3600 + 7), "3:00:07");
        assert_eq!(format_call_duration(-5), "00:00");
    }

    #[test]
    fn call_phase_tracks_active_call_status() {
        let mut state = AppState::empty();
        assert_eq!(state.call_phase(), CallPhase::Idle);
        state.active_call = Some(CallState::connecting("C1", CallRole::Patient, CallType::Video));
        assert_eq!(state.call_phase(), CallPhase::Connecting);
        if let Some(call) = state.active_call.as_mut() {
            call.set_status(CallStatus::Ended {
                reason: "local_hangup".into(),
            });
        }
        assert_eq!(state.call_phase(), CallPhase::Ended);
    }

    #[test]
    fn call_type_parsing_defaults_to_voice() {
        assert_eq!(CallType::parse_lenient(Some("VIDEO")), CallType::Video);
        assert_eq!(CallType::parse_lenient(Some("audio")), CallType::Voice);
        assert_eq!(CallType::parse_lenient(None), CallType::Voice);
    }
}
