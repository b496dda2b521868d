use crate::state::{CallRole, CallType};

#[derive(uniffi::Enum, Debug, Clone, PartialEq)]
pub enum AppAction {
    // Auth
    SetCredentials {
        auth_token: String,
        user_id: String,
        role: CallRole,
    },
    ClearCredentials,

    // Calls
    StartCall {
        target_user_id: String,
        call_type: CallType,
        appointment_id: Option<String>,
        other_participant_name: Option<String>,
        other_participant_avatar: Option<String>,
    },
    AcceptIncomingCall {
        call_id: String,
    },
    DeclineIncomingCall {
        call_id: String,
    },
    EndCall,
    ToggleMute,
    ToggleCamera,
    RetryCall,
    DismissCall,

    // Reconciliation prompt
    ResumePersistedCall,
    EndPersistedCall,

    // Signaling
    ReconnectSignaling,

    // UI
    ClearToast,

    // Lifecycle
    Foregrounded,
    Backgrounded,
}

impl AppAction {
    /// Log-safe action tag (never includes secrets like `auth_token`).
    pub fn tag(&self) -> &'static str {
        match self {
            // Auth
            AppAction::SetCredentials { .. } => "SetCredentials",
            AppAction::ClearCredentials => "ClearCredentials",

            // Calls
            AppAction::StartCall { .. } => "StartCall",
            AppAction::AcceptIncomingCall { .. } => "AcceptIncomingCall",
            AppAction::DeclineIncomingCall { .. } => "DeclineIncomingCall",
            AppAction::EndCall => "EndCall",
            AppAction::ToggleMute => "ToggleMute",
            AppAction::ToggleCamera => "ToggleCamera",
            AppAction::RetryCall => "RetryCall",
            AppAction::DismissCall => "DismissCall",

            // Reconciliation prompt
            AppAction::ResumePersistedCall => "ResumePersistedCall",
            AppAction::EndPersistedCall => "EndPersistedCall",

            // Signaling
            AppAction::ReconnectSignaling => "ReconnectSignaling",

            // UI
            AppAction::ClearToast => "ClearToast",

            // Lifecycle
            AppAction::Foregrounded => "Foregrounded",
            AppAction::Backgrounded => "Backgrounded",
        }
    }
}
