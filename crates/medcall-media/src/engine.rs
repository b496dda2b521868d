use std::fmt::Debug;
use std::sync::Arc;

/// Why a join attempt did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinFailureKind {
    /// The channel token expired or was rejected; a fresh token may succeed.
    TokenExpired,
    /// Network or engine state problem; retrying may succeed.
    Transient,
    /// Configuration problem (bad app id, bad channel name). Retrying won't help.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinFailure {
    pub code: i32,
    pub kind: JoinFailureKind,
    pub message: String,
}

impl JoinFailure {
    pub fn new(code: i32, kind: JoinFailureKind, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            message: message.into(),
        }
    }

    pub fn from_code(code: i32) -> Self {
        let kind = crate::codes::classify_vendor_code(code);
        Self::new(code, kind, crate::codes::describe_vendor_code(code))
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind, JoinFailureKind::Fatal)
    }
}

/// Immediate result of asking the engine to join a channel.
///
/// Vendor SDKs usually accept the request synchronously and confirm later through
/// a "joined channel" callback, which arrives as [`EngineEvent::JoinedChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Pending,
    Joined,
    Failed(JoinFailure),
}

/// Vendor lifecycle callbacks, normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    JoinedChannel { channel_name: String, uid: u32 },
    JoinFailed(JoinFailure),
    ParticipantJoined { uid: u32 },
    ParticipantLeft { uid: u32 },
    ConnectionLost,
    ConnectionRestored,
    Error { code: i32, message: String },
}

pub type EngineEventSink = Arc<dyn Fn(EngineEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("media engine is not available on this device")]
    Unavailable,
    #[error("media engine creation failed: {0}")]
    CreateFailed(String),
    #[error("media engine {op} failed with code {code}")]
    Rejected { op: &'static str, code: i32 },
}

/// A live handle to the real-time audio/video engine.
///
/// `leave_channel` and `destroy` are best effort: implementations log failures
/// and return, since teardown must never block leaving the call screen.
pub trait MediaEngine: Send + Debug {
    fn join_channel(&mut self, token: &str, channel_name: &str, uid: u32) -> JoinOutcome;
    fn leave_channel(&mut self);
    fn set_muted(&mut self, muted: bool) -> Result<(), EngineError>;
    fn set_camera_enabled(&mut self, enabled: bool) -> Result<(), EngineError>;
    fn destroy(&mut self);

    /// Demo engines report joins but carry no media.
    fn is_demo(&self) -> bool {
        false
    }
}

/// Creates engine handles. Callers destroy any handle they hold before asking for another.
pub trait MediaEngineFactory: Send + Sync {
    fn create(
        &self,
        app_id: &str,
        events: EngineEventSink,
    ) -> Result<Box<dyn MediaEngine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fatal_failures_are_unrecoverable() {
        assert!(JoinFailure::new(109, JoinFailureKind::TokenExpired, "").is_recoverable());
        assert!(JoinFailure::new(10, JoinFailureKind::Transient, "").is_recoverable());
        assert!(!JoinFailure::new(101, JoinFailureKind::Fatal, "").is_recoverable());
    }

    #[test]
    fn from_code_classifies_and_describes() {
        let failure = JoinFailure::from_code(109);
        assert_eq!(failure.kind, JoinFailureKind::TokenExpired);
        assert!(failure.message.contains("token"));
    }
}
