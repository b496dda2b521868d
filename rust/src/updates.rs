use medcall_media::EngineEvent;

use crate::core::{ActiveCallSummary, JoinCredentials, ReconcilePurpose, SignalingEvent};
use crate::state::{AppState, CallType, ConnectionState};
use crate::AppAction;

#[derive(uniffi::Enum, Clone, Debug)]
#[allow(clippy::large_enum_variant)] // uniffi enums cannot use Box<T> indirection
pub enum AppUpdate {
    /// Primary update stream: always send a full state snapshot.
    FullState(AppState),
    /// Sent alongside the snapshot when an offer arrives while the app is not in the
    /// foreground, so the shell can raise a system-level ringing notification.
    IncomingCallAlert {
        rev: u64,
        call_id: String,
        caller_name: String,
        call_type: CallType,
    },
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
            AppUpdate::IncomingCallAlert { rev, .. } => *rev,
        }
    }
}

#[derive(Debug)]
pub(crate) enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

#[derive(Debug)]
pub(crate) enum InternalEvent {
    Toast(String),
    ToastAutoDismiss {
        token: u64,
    },
    CallDurationTick {
        token: u64,
    },

    // REST results
    /// Credential fetch preceding a fresh join. `call_id` is `None` only when
    /// initiating an outgoing call failed before the backend assigned one.
    CallCredentialsReady {
        attempt: u64,
        call_id: Option<String>,
        result: Result<JoinCredentials, String>,
    },
    TokenRefreshed {
        attempt: u64,
        call_id: String,
        result: Result<JoinCredentials, String>,
    },
    RemoteStatusChecked {
        token: u64,
        call_id: String,
        active: bool,
        purpose: ReconcilePurpose,
    },
    ServerActiveCallFetched {
        token: u64,
        summary: Option<ActiveCallSummary>,
    },
    PersistedCallEnded {
        call_id: String,
        error: Option<String>,
    },

    // Media engine callbacks, normalized
    MediaEngine(EngineEvent),

    // Signaling
    SignalingStateChanged {
        generation: u64,
        state: ConnectionState,
        error: Option<String>,
    },
    SignalingEvent {
        generation: u64,
        event: SignalingEvent,
    },
    SignalingReconnectDue {
        generation: u64,
    },
}
