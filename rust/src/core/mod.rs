mod api;
mod call_control;
mod config;
mod incoming;
mod session_store;
mod signaling;

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use flume::Sender;
use medcall_media::{EngineEventSink, MediaEngine, MediaEngineFactory};

use crate::actions::AppAction;
use crate::state::{now_seconds, AppState, AuthState, CallRole};
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

pub use api::{status_is_active, ActiveCallSummary, ApiError, JoinCredentials};
pub(crate) use call_control::ReconcilePurpose;
pub use signaling::{
    connect as connect_signaling, SignalingConfig, SignalingConnection, SignalingError,
    SignalingEvent,
};

use api::{CallBackend, DeviceIdentity, HttpCallBackend, SharedAuthToken};
use call_control::ResumeCandidate;
use incoming::IncomingCallOffer;
use session_store::{CallSession, SessionStore};
use signaling::SignalingChannel;

const DEVICE_ID_FILE: &str = "device_id.txt";

/// One-shot status lookup against the REST backend, outside the actor.
pub async fn fetch_call_status(
    api_base_url: &str,
    auth_token: &str,
    call_id: &str,
) -> Result<String, ApiError> {
    let token: SharedAuthToken = Arc::new(RwLock::new(Some(auth_token.to_string())));
    HttpCallBackend::new(api_base_url, token)
        .call_status(call_id)
        .await
}

#[derive(Clone)]
pub(crate) struct Credentials {
    pub auth_token: String,
    pub user_id: String,
    pub role: CallRole,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("auth_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .finish()
    }
}

pub struct AppCore {
    pub state: AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    data_dir: String,
    config: config::AppConfig,
    runtime: tokio::runtime::Runtime,

    backend: Arc<dyn CallBackend>,
    auth_token: SharedAuthToken,
    engine_factory: Arc<dyn MediaEngineFactory>,
    device: DeviceIdentity,

    credentials: Option<Credentials>,
    signaling: SignalingChannel,
    session_store: Option<SessionStore>,

    // Media engine handle and the app id it was created for. At most one exists.
    engine: Option<Box<dyn MediaEngine>>,
    engine_app_id: Option<String>,
    // Credentials of the call being joined or in progress. Token is cleared after a failed join.
    call_session: Option<CallSession>,

    // Bumped whenever a join cycle starts or the call ends; async results carry it.
    join_attempt: u64,
    join_retries: u32,
    // Outgoing attempts hung up before `initiate` answered; the server call still needs ending.
    cancelled_initiates: Vec<u64>,
    reconcile_token: u64,
    backgrounded_in_call: bool,
    // Vendor engine is reconnecting on its own; join failures are not ours to retry.
    vendor_reconnecting: bool,
    resume_candidate: Option<ResumeCandidate>,
    presented_offer: Option<IncomingCallOffer>,
    app_foreground: bool,
    launch_reconcile_pending: bool,

    toast_dismiss_token: u64,
    call_duration_tick_token: u64,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        shared_state: Arc<RwLock<AppState>>,
        engine_factory: Arc<dyn MediaEngineFactory>,
    ) -> Self {
        let config = config::load_app_config(&data_dir);
        let auth_token: SharedAuthToken = Arc::new(RwLock::new(None));
        let backend: Arc<dyn CallBackend> = Arc::new(HttpCallBackend::new(
            config.api_base_url(),
            auth_token.clone(),
        ));
        Self::with_backend(
            update_sender,
            core_sender,
            data_dir,
            shared_state,
            engine_factory,
            backend,
            auth_token,
        )
    }

    pub(crate) fn with_backend(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        shared_state: Arc<RwLock<AppState>>,
        engine_factory: Arc<dyn MediaEngineFactory>,
        backend: Arc<dyn CallBackend>,
        auth_token: SharedAuthToken,
    ) -> Self {
        let config = config::load_app_config(&data_dir);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()
            .expect("tokio runtime");

        let session_store = match SessionStore::open(&data_dir, &config.storage_key_prefix()) {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::warn!(%e, "failed to open call session store");
                None
            }
        };
        let device = DeviceIdentity {
            label: config.device_label(),
            id: Self::load_or_create_device_id(&data_dir),
        };
        tracing::info!(
            api = %config.api_base_url(),
            network = config.network_enabled(),
            "core configured"
        );

        let this = Self {
            state: AppState::empty(),
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            data_dir,
            config,
            runtime,
            backend,
            auth_token,
            engine_factory,
            device,
            credentials: None,
            signaling: SignalingChannel::new(),
            session_store,
            engine: None,
            engine_app_id: None,
            call_session: None,
            join_attempt: 0,
            join_retries: 0,
            cancelled_initiates: Vec::new(),
            reconcile_token: 0,
            backgrounded_in_call: false,
            vendor_reconnecting: false,
            resume_candidate: None,
            presented_offer: None,
            app_foreground: true,
            launch_reconcile_pending: true,
            toast_dismiss_token: 0,
            call_duration_tick_token: 0,
        };

        // Ensure FfiApp.state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    fn load_or_create_device_id(data_dir: &str) -> String {
        let path = Path::new(data_dir).join(DEVICE_ID_FILE);
        if let Ok(id) = std::fs::read_to_string(&path) {
            let id = id.trim().to_string();
            if !id.is_empty() {
                return id;
            }
        }
        let id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = std::fs::write(&path, &id) {
            tracing::warn!(%e, "failed to persist device id");
        }
        id
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn emit_call_state(&mut self) {
        self.emit_state();
    }

    fn toast(&mut self, msg: impl Into<String>) {
        self.state.toast = Some(msg.into());
        self.toast_dismiss_token = self.toast_dismiss_token.saturating_add(1);
        self.schedule_toast_auto_dismiss(self.toast_dismiss_token);
        self.emit_state();
    }

    fn schedule_toast_auto_dismiss(&self, token: u64) {
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::ToastAutoDismiss { token },
            )));
        });
    }

    fn handle_toast_auto_dismiss(&mut self, token: u64) {
        if token != self.toast_dismiss_token {
            return;
        }
        if self.state.toast.is_some() {
            self.state.toast = None;
            self.emit_state();
        }
    }

    fn cancel_call_duration_ticks(&mut self) {
        self.call_duration_tick_token = self.call_duration_tick_token.saturating_add(1);
    }

    fn schedule_call_duration_tick(&self, token: u64) {
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::CallDurationTick { token },
            )));
        });
    }

    fn call_should_tick(&self) -> bool {
        self.state
            .active_call
            .as_ref()
            .is_some_and(|call| call.is_live() && call.started_at.is_some())
    }

    fn ensure_call_duration_ticks(&mut self) {
        if !self.call_should_tick() {
            self.cancel_call_duration_ticks();
            return;
        }
        self.call_duration_tick_token = self.call_duration_tick_token.saturating_add(1);
        self.schedule_call_duration_tick(self.call_duration_tick_token);
    }

    fn handle_call_duration_tick(&mut self, token: u64) {
        if token != self.call_duration_tick_token || !self.call_should_tick() {
            return;
        }
        let now = now_seconds();
        let changed = match self.state.active_call.as_mut() {
            Some(call) => {
                let before = call.duration_display.clone();
                call.refresh_duration_display(now);
                call.duration_display != before
            }
            None => false,
        };
        if changed {
            self.emit_call_state();
        }
        self.schedule_call_duration_tick(token);
    }

    /// Runs `fut` on the runtime and feeds its result back into the actor.
    fn spawn_internal<F>(&self, fut: F)
    where
        F: std::future::Future<Output = InternalEvent> + Send + 'static,
    {
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let event = fut.await;
            let _ = tx.send(CoreMsg::Internal(Box::new(event)));
        });
    }

    fn engine_event_sink(&self) -> EngineEventSink {
        let tx = self.core_sender.clone();
        Arc::new(move |event| {
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::MediaEngine(
                event,
            ))));
        })
    }

    fn set_auth_token(&self, token: Option<String>) {
        match self.auth_token.write() {
            Ok(mut g) => *g = token,
            Err(poison) => *poison.into_inner() = token,
        }
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(action) => {
                // Never log `?action` directly: SetCredentials carries the bearer token.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action);
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::Toast(msg) => {
                tracing::info!(msg, "toast");
                self.toast(msg);
            }
            InternalEvent::ToastAutoDismiss { token } => self.handle_toast_auto_dismiss(token),
            InternalEvent::CallDurationTick { token } => self.handle_call_duration_tick(token),
            InternalEvent::CallCredentialsReady {
                attempt,
                call_id,
                result,
            } => self.handle_call_credentials_ready(attempt, call_id, result),
            InternalEvent::TokenRefreshed {
                attempt,
                call_id,
                result,
            } => self.handle_token_refreshed(attempt, call_id, result),
            InternalEvent::RemoteStatusChecked {
                token,
                call_id,
                active,
                purpose,
            } => self.handle_remote_status_checked(token, call_id, active, purpose),
            InternalEvent::ServerActiveCallFetched { token, summary } => {
                self.handle_server_active_call_fetched(token, summary)
            }
            InternalEvent::PersistedCallEnded { call_id, error } => {
                self.handle_persisted_call_ended(call_id, error)
            }
            InternalEvent::MediaEngine(event) => self.handle_engine_event(event),
            InternalEvent::SignalingStateChanged {
                generation,
                state,
                error,
            } => self.handle_signaling_state_changed(generation, state, error),
            InternalEvent::SignalingEvent { generation, event } => {
                self.handle_signaling_event(generation, event)
            }
            InternalEvent::SignalingReconnectDue { generation } => {
                self.handle_signaling_reconnect_due(generation)
            }
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            AppAction::SetCredentials {
                auth_token,
                user_id,
                role,
            } => self.handle_set_credentials(auth_token, user_id, role),
            AppAction::ClearCredentials => self.handle_clear_credentials(),
            AppAction::StartCall {
                target_user_id,
                call_type,
                appointment_id,
                other_participant_name,
                other_participant_avatar,
            } => self.handle_start_call(
                target_user_id,
                call_type,
                appointment_id,
                other_participant_name,
                other_participant_avatar,
            ),
            AppAction::AcceptIncomingCall { call_id } => self.handle_accept_incoming_call(call_id),
            AppAction::DeclineIncomingCall { call_id } => {
                self.handle_decline_incoming_call(call_id)
            }
            AppAction::EndCall => self.handle_end_call(),
            AppAction::ToggleMute => self.handle_toggle_mute(),
            AppAction::ToggleCamera => self.handle_toggle_camera(),
            AppAction::RetryCall => self.handle_retry_call(),
            AppAction::DismissCall => self.handle_dismiss_call(),
            AppAction::ResumePersistedCall => self.handle_resume_persisted_call(),
            AppAction::EndPersistedCall => self.handle_end_persisted_call(),
            AppAction::ReconnectSignaling => self.force_reconnect_signaling(),
            AppAction::ClearToast => {
                if self.state.toast.take().is_some() {
                    self.emit_state();
                }
            }
            AppAction::Foregrounded => self.handle_foregrounded(),
            AppAction::Backgrounded => self.handle_backgrounded(),
        }
    }

    fn handle_set_credentials(&mut self, auth_token: String, user_id: String, role: CallRole) {
        let auth_token = auth_token.trim().to_string();
        let user_id = user_id.trim().to_string();
        if auth_token.is_empty() || user_id.is_empty() {
            self.toast("Sign-in details are incomplete");
            return;
        }
        let switching_user = self
            .credentials
            .as_ref()
            .is_some_and(|c| c.user_id != user_id);
        if switching_user {
            self.abandon_call_state();
            self.disconnect_signaling();
        }

        tracing::info!(user_id, ?role, "credentials set");
        self.set_auth_token(Some(auth_token.clone()));
        self.credentials = Some(Credentials {
            auth_token,
            user_id: user_id.clone(),
            role,
        });
        self.state.auth = AuthState::LoggedIn { user_id, role };
        self.emit_state();

        self.ensure_signaling_connected();
        if std::mem::take(&mut self.launch_reconcile_pending) {
            self.reconcile_persisted_session(true);
        }
    }

    fn handle_clear_credentials(&mut self) {
        tracing::info!("credentials cleared");
        self.abandon_call_state();
        self.disconnect_signaling();
        self.set_auth_token(None);
        self.credentials = None;
        self.launch_reconcile_pending = true;
        self.state.auth = AuthState::LoggedOut;
        self.state.toast = None;
        self.emit_state();
    }
}
