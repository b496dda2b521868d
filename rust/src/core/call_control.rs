use medcall_media::codes::ERR_INVALID_TOKEN;
use medcall_media::{
    DemoEngine, EngineError, EngineEvent, JoinFailure, JoinFailureKind, JoinOutcome,
};

use super::api::{self, ActiveCallSummary, InitiateCallRequest, JoinCredentials};
use super::incoming::IncomingCallOffer;
use super::session_store::{CallSession, ParticipantInfo};
use super::AppCore;
use crate::state::{now_seconds, CallState, CallStatus, CallType, ResumePrompt};
use crate::updates::{CoreMsg, InternalEvent};

/// Join retries after the first failure; the next failure ends the call.
pub(crate) const MAX_JOIN_RETRIES: u32 = 3;

pub(crate) const END_LOCAL_HANGUP: &str = "local_hangup";
pub(crate) const END_REMOTE_ENDED: &str = "remote_ended";
pub(crate) const END_DECLINED: &str = "declined";
pub(crate) const END_JOIN_FAILED: &str = "join_failed";
pub(crate) const END_START_FAILED: &str = "start_failed";
pub(crate) const END_MEDIA_FAILED: &str = "media_failed";

/// Why a remote status check was issued; decides what its answer does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconcilePurpose {
    SeamlessRejoin,
    ResumePrompt,
    Retry,
}

/// A call the user may pick back up, shown behind the resume prompt.
#[derive(Debug, Clone)]
pub(super) enum ResumeCandidate {
    Persisted(CallSession),
    Server(ActiveCallSummary),
}

impl ResumeCandidate {
    fn call_id(&self) -> &str {
        match self {
            ResumeCandidate::Persisted(s) => &s.call_id,
            ResumeCandidate::Server(s) => &s.call_id,
        }
    }

    fn prompt(&self) -> ResumePrompt {
        match self {
            ResumeCandidate::Persisted(s) => ResumePrompt {
                call_id: s.call_id.clone(),
                other_participant_name: s.other_participant.as_ref().and_then(|p| p.name.clone()),
                started_at: s.started_at,
            },
            ResumeCandidate::Server(s) => ResumePrompt {
                call_id: s.call_id.clone(),
                other_participant_name: s.other_participant.as_ref().and_then(|p| p.name.clone()),
                started_at: s.started_at,
            },
        }
    }
}

impl AppCore {
    pub(super) fn has_call_in_progress(&self) -> bool {
        self.state
            .active_call
            .as_ref()
            .is_some_and(|call| !call.is_ended())
    }

    fn next_join_attempt(&mut self) -> u64 {
        self.join_attempt = self.join_attempt.saturating_add(1);
        self.join_attempt
    }

    fn reset_call_tracking(&mut self) {
        self.teardown_media();
        self.call_session = None;
        self.join_retries = 0;
        self.vendor_reconnecting = false;
        self.backgrounded_in_call = false;
        self.cancel_call_duration_ticks();
    }

    // ── Outgoing / incoming call setup ──────────────────────────────────

    pub(super) fn handle_start_call(
        &mut self,
        target_user_id: String,
        call_type: CallType,
        appointment_id: Option<String>,
        other_participant_name: Option<String>,
        other_participant_avatar: Option<String>,
    ) {
        let Some(creds) = self.credentials.clone() else {
            self.toast("Sign in to start a call");
            return;
        };
        if self.has_call_in_progress() {
            self.toast("You're already in a call");
            return;
        }
        let target = target_user_id.trim().to_string();
        if target.is_empty() {
            self.toast("Choose who to call");
            return;
        }

        self.reset_call_tracking();
        let mut call = CallState::connecting("", creds.role, call_type);
        call.appointment_id = appointment_id.clone();
        call.other_participant_id = Some(target.clone());
        call.other_participant_name = other_participant_name;
        call.other_participant_avatar = other_participant_avatar;
        call.awaiting_answer = true;
        self.state.active_call = Some(call);
        self.emit_call_state();

        let attempt = self.next_join_attempt();
        let request = InitiateCallRequest::new(
            &creds.user_id,
            creds.role,
            &target,
            call_type,
            appointment_id,
        );
        let backend = self.backend.clone();
        let device = self.device.clone();
        tracing::info!(target_user_id = %target, call_type = call_type.as_str(), "call: initiating");
        self.spawn_internal(async move {
            let call_id = match backend.initiate_call(&request).await {
                Ok(call_id) => call_id,
                Err(e) => {
                    return InternalEvent::CallCredentialsReady {
                        attempt,
                        call_id: None,
                        result: Err(e.to_string()),
                    }
                }
            };
            let result = backend
                .join_call(&call_id, &device)
                .await
                .map_err(|e| e.to_string());
            InternalEvent::CallCredentialsReady {
                attempt,
                call_id: Some(call_id),
                result,
            }
        });
    }

    pub(super) fn begin_incoming_call(&mut self, offer: IncomingCallOffer) {
        let Some(creds) = self.credentials.clone() else {
            self.toast("Sign in to answer calls");
            return;
        };
        if self.has_call_in_progress() {
            self.toast("Finish your current call first");
            return;
        }
        self.reset_call_tracking();
        let mut call = CallState::connecting(offer.call_id.clone(), creds.role, offer.call_type);
        call.other_participant_id = Some(offer.caller_id);
        call.other_participant_name = Some(offer.caller_name);
        call.other_participant_avatar = offer.caller_avatar;
        self.state.active_call = Some(call);
        self.emit_call_state();
        self.request_join_credentials(offer.call_id, true);
    }

    fn request_join_credentials(&mut self, call_id: String, accept_first: bool) {
        let attempt = self.next_join_attempt();
        let backend = self.backend.clone();
        let device = self.device.clone();
        self.spawn_internal(async move {
            if accept_first {
                if let Err(e) = backend.accept_call(&call_id).await {
                    return InternalEvent::CallCredentialsReady {
                        attempt,
                        call_id: Some(call_id),
                        result: Err(e.to_string()),
                    };
                }
            }
            let result = backend
                .join_call(&call_id, &device)
                .await
                .map_err(|e| e.to_string());
            InternalEvent::CallCredentialsReady {
                attempt,
                call_id: Some(call_id),
                result,
            }
        });
    }

    pub(super) fn handle_call_credentials_ready(
        &mut self,
        attempt: u64,
        call_id: Option<String>,
        result: Result<JoinCredentials, String>,
    ) {
        if attempt != self.join_attempt {
            if let Some(pos) = self.cancelled_initiates.iter().position(|a| *a == attempt) {
                self.cancelled_initiates.swap_remove(pos);
                if let Some(call_id) = call_id {
                    tracing::info!(call_id = %call_id, "call: ending call hung up before it was created");
                    self.report_call_end(call_id, false);
                }
                return;
            }
            tracing::debug!(attempt, current = self.join_attempt, "stale call credentials ignored");
            return;
        }
        let Some(call) = self.state.active_call.as_mut() else {
            return;
        };
        if call.status != CallStatus::Connecting {
            return;
        }
        if let Some(id) = &call_id {
            call.call_id = id.clone();
        }

        let join = match result {
            Ok(join) => join,
            Err(e) => {
                tracing::warn!(call_id = ?call_id, error = %e, "call: credential fetch failed");
                self.end_call_with_error(
                    END_START_FAILED,
                    format!("Couldn't connect the call: {e}"),
                    call_id.is_some(),
                );
                return;
            }
        };
        let session = CallSession {
            call_id: call.call_id.clone(),
            channel_name: join.channel_name,
            access_token: join.token,
            participant_id: join.uid,
            app_id: join.app_id,
            role: call.role,
            call_type: call.call_type,
            started_at: call.started_at,
            appointment_id: call.appointment_id.clone(),
            other_participant: Some(ParticipantInfo {
                user_id: call.other_participant_id.clone(),
                name: call.other_participant_name.clone(),
                avatar_url: call.other_participant_avatar.clone(),
            }),
        };
        tracing::info!(call_id = %session.call_id, channel = %session.channel_name, "call: credentials ready");
        self.call_session = Some(session);
        self.join_retries = 0;
        self.emit_call_state();
        self.begin_join();
    }

    // ── Joining and retry ───────────────────────────────────────────────

    fn begin_join(&mut self) {
        let Some(session) = self.call_session.clone() else {
            return;
        };
        if session.access_token.is_empty() {
            // Token was discarded by an earlier failure; never reuse, go through refresh.
            self.handle_join_failure(JoinFailure::from_code(ERR_INVALID_TOKEN));
            return;
        }
        if !self.ensure_engine(&session.app_id) {
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let outcome = engine.join_channel(
            &session.access_token,
            &session.channel_name,
            session.participant_id,
        );
        tracing::info!(
            call_id = %session.call_id,
            channel = %session.channel_name,
            uid = session.participant_id,
            retry = self.join_retries,
            "call: join requested"
        );
        match outcome {
            JoinOutcome::Joined => self.handle_channel_joined(),
            JoinOutcome::Pending => {}
            JoinOutcome::Failed(failure) => self.handle_join_failure(failure),
        }
    }

    /// Makes sure an engine for `app_id` exists, destroying any other one first.
    fn ensure_engine(&mut self, app_id: &str) -> bool {
        if self.engine.is_some() && self.engine_app_id.as_deref() == Some(app_id) {
            return true;
        }
        self.destroy_engine();

        let sink = self.engine_event_sink();
        let demo = match self.engine_factory.create(app_id, sink) {
            Ok(engine) => {
                let demo = engine.is_demo();
                self.engine = Some(engine);
                demo
            }
            Err(EngineError::Unavailable) => {
                tracing::warn!("media engine unavailable, continuing in demo mode");
                self.engine = Some(Box::new(DemoEngine::new()));
                true
            }
            Err(e) => {
                tracing::error!(%e, "media engine creation failed");
                self.end_call_with_error(
                    END_MEDIA_FAILED,
                    format!("Couldn't start audio/video: {e}"),
                    true,
                );
                return false;
            }
        };
        self.engine_app_id = Some(app_id.to_string());
        if let Some(call) = self.state.active_call.as_mut() {
            call.demo_mode = demo;
        }
        true
    }

    fn destroy_engine(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.destroy();
        }
        self.engine_app_id = None;
    }

    fn teardown_media(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.leave_channel();
        }
        self.destroy_engine();
    }

    fn handle_channel_joined(&mut self) {
        let now = now_seconds();
        let Some(call) = self.state.active_call.as_mut() else {
            return;
        };
        if !call.is_joining() {
            return;
        }
        call.set_status(CallStatus::InCall);
        let started_at = *call.started_at.get_or_insert(now);
        call.error = None;
        call.can_retry = false;
        call.refresh_duration_display(now);
        tracing::info!(call_id = %call.call_id, retries = self.join_retries, "call: joined channel");

        self.vendor_reconnecting = false;
        self.join_retries = 0;
        if let Some(session) = self.call_session.as_mut() {
            session.started_at = Some(started_at);
        }
        self.persist_call_session();
        self.ensure_call_duration_ticks();
        self.emit_call_state();
    }

    fn handle_join_failure(&mut self, failure: JoinFailure) {
        let Some(call) = self.state.active_call.as_ref() else {
            return;
        };
        if !call.is_joining() || self.vendor_reconnecting {
            tracing::debug!(code = failure.code, "join failure outside a join cycle ignored");
            return;
        }
        let call_id = call.call_id.clone();
        if let Some(session) = self.call_session.as_mut() {
            session.access_token.clear();
        }
        self.discard_persisted_token(&call_id);

        if !failure.is_recoverable() {
            tracing::warn!(call_id = %call_id, code = failure.code, "call: fatal join failure");
            self.end_call_with_error(
                END_JOIN_FAILED,
                format!("Couldn't join the call: {}", failure.message),
                false,
            );
            return;
        }
        if self.join_retries >= MAX_JOIN_RETRIES {
            tracing::warn!(call_id = %call_id, code = failure.code, "call: join retries exhausted");
            self.end_call_with_error(
                END_JOIN_FAILED,
                "Couldn't connect to the call. Check your connection and try again.".to_string(),
                true,
            );
            return;
        }

        self.join_retries += 1;
        let attempt = self.join_attempt;
        let delay = self.config.join_retry_delay();
        let reason = match failure.kind {
            JoinFailureKind::TokenExpired => "token_expired",
            _ => "join_failed",
        };
        tracing::warn!(
            call_id,
            code = failure.code,
            retry = self.join_retries,
            max = MAX_JOIN_RETRIES,
            retry_in_ms = delay.as_millis() as u64,
            "call: join failed, refreshing token"
        );
        let backend = self.backend.clone();
        let device = self.device.clone();
        self.spawn_internal(async move {
            tokio::time::sleep(delay).await;
            let result = backend
                .refresh_token(&call_id, &device, reason)
                .await
                .map_err(|e| e.to_string());
            InternalEvent::TokenRefreshed {
                attempt,
                call_id,
                result,
            }
        });
    }

    pub(super) fn handle_token_refreshed(
        &mut self,
        attempt: u64,
        call_id: String,
        result: Result<JoinCredentials, String>,
    ) {
        if attempt != self.join_attempt {
            tracing::debug!(attempt, "stale token refresh ignored");
            return;
        }
        let joining = self
            .state
            .active_call
            .as_ref()
            .is_some_and(|c| c.call_id == call_id && c.is_joining());
        if !joining {
            return;
        }
        match result {
            Ok(creds) => {
                if let Some(session) = self.call_session.as_mut() {
                    session.access_token = creds.token;
                    session.channel_name = creds.channel_name;
                    session.participant_id = creds.uid;
                    if !creds.app_id.is_empty() {
                        session.app_id = creds.app_id;
                    }
                }
                self.begin_join();
            }
            Err(e) => self.handle_join_failure(JoinFailure::new(
                0,
                JoinFailureKind::Transient,
                format!("token refresh failed: {e}"),
            )),
        }
    }

    // ── Ending ──────────────────────────────────────────────────────────

    fn end_call_with_error(&mut self, reason: &str, message: String, can_retry: bool) {
        self.teardown_media();
        self.next_join_attempt();
        self.call_session = None;
        self.vendor_reconnecting = false;
        self.backgrounded_in_call = false;
        if let Some(call) = self.state.active_call.as_mut() {
            call.set_status(CallStatus::Ended {
                reason: reason.to_string(),
            });
            call.error = Some(message);
            call.can_retry = can_retry && !call.call_id.is_empty();
            call.remote_joined = false;
        }
        self.cancel_call_duration_ticks();
        self.emit_call_state();
    }

    /// Clean end: media torn down, persisted session cleared.
    fn finish_call(&mut self, reason: &str) {
        self.teardown_media();
        self.next_join_attempt();
        self.call_session = None;
        self.vendor_reconnecting = false;
        self.backgrounded_in_call = false;
        self.clear_persisted_session();
        if let Some(call) = self.state.active_call.as_mut() {
            tracing::info!(call_id = %call.call_id, reason, "call: ended");
            call.set_status(CallStatus::Ended {
                reason: reason.to_string(),
            });
            call.remote_joined = false;
            call.awaiting_answer = false;
            call.can_retry = false;
        }
        self.cancel_call_duration_ticks();
        self.emit_call_state();
    }

    pub(super) fn handle_end_call(&mut self) {
        let Some(call) = self.state.active_call.as_ref() else {
            return;
        };
        if call.is_ended() {
            return;
        }
        let call_id = call.call_id.clone();
        let initiating = call_id.is_empty() && call.status == CallStatus::Connecting;
        let pending_attempt = self.join_attempt;
        self.finish_call(END_LOCAL_HANGUP);
        if initiating {
            // The id arrives with the initiate result; that result ends the call.
            self.cancelled_initiates.push(pending_attempt);
            return;
        }
        if call_id.is_empty() {
            return;
        }
        self.report_call_end(call_id, true);
    }

    fn report_call_end(&self, call_id: String, notify_failure: bool) {
        let backend = self.backend.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            if let Err(e) = backend.end_call(&call_id).await {
                tracing::warn!(call_id = %call_id, %e, "call: end request failed");
                if notify_failure {
                    let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::Toast(format!(
                        "Couldn't reach the server to end the call: {e}"
                    )))));
                }
            }
        });
    }

    pub(super) fn handle_dismiss_call(&mut self) {
        if self
            .state
            .active_call
            .as_ref()
            .is_some_and(|call| call.is_ended())
        {
            self.state.active_call = None;
            self.call_session = None;
            self.emit_call_state();
        }
    }

    /// Local teardown on sign-out. The backend is not told: the token is going away.
    pub(super) fn abandon_call_state(&mut self) {
        self.reset_call_tracking();
        self.next_join_attempt();
        self.reconcile_token = self.reconcile_token.saturating_add(1);
        self.clear_persisted_session();
        self.state.active_call = None;
        self.state.incoming_call = None;
        self.state.resume_prompt = None;
        self.presented_offer = None;
        self.resume_candidate = None;
    }

    // ── Remote signaling events ─────────────────────────────────────────

    fn is_current_call(&self, call_id: &str) -> bool {
        self.state
            .active_call
            .as_ref()
            .is_some_and(|c| c.call_id == call_id && !c.is_ended())
    }

    pub(super) fn handle_remote_call_ended(&mut self, call_id: &str, reason: Option<String>) {
        let dismissed = self.dismiss_offer(call_id);
        if self
            .resume_candidate
            .as_ref()
            .is_some_and(|c| c.call_id() == call_id)
        {
            self.resume_candidate = None;
            self.state.resume_prompt = None;
            self.clear_persisted_session();
            self.emit_state();
        }
        if !self.is_current_call(call_id) {
            if !dismissed {
                tracing::debug!(call_id = %call_id, "call_ended for another or finished call ignored");
            }
            return;
        }
        tracing::info!(call_id = %call_id, reason = ?reason, "call: ended remotely");
        self.finish_call(END_REMOTE_ENDED);
    }

    pub(super) fn handle_remote_call_declined(&mut self, call_id: &str) {
        let outgoing_ringing = self
            .state
            .active_call
            .as_ref()
            .is_some_and(|c| c.call_id == call_id && c.status == CallStatus::Connecting);
        if !outgoing_ringing {
            tracing::debug!(call_id = %call_id, "call_declined ignored");
            return;
        }
        self.finish_call(END_DECLINED);
    }

    pub(super) fn handle_remote_call_accepted(&mut self, call_id: &str) {
        if !self.is_current_call(call_id) {
            return;
        }
        if let Some(call) = self.state.active_call.as_mut() {
            call.awaiting_answer = false;
        }
        self.emit_call_state();
    }

    pub(super) fn handle_remote_participant(&mut self, call_id: &str, joined: bool) {
        if !self.is_current_call(call_id) {
            return;
        }
        self.set_remote_joined(joined);
    }

    fn set_remote_joined(&mut self, joined: bool) {
        let Some(call) = self.state.active_call.as_mut() else {
            return;
        };
        if call.is_ended() {
            return;
        }
        call.remote_joined = joined;
        if joined {
            call.awaiting_answer = false;
        }
        self.emit_call_state();
    }

    // ── Media engine events ─────────────────────────────────────────────

    pub(super) fn handle_engine_event(&mut self, event: EngineEvent) {
        if self.engine.is_none() {
            tracing::debug!(?event, "engine event without an engine ignored");
            return;
        }
        match event {
            EngineEvent::JoinedChannel { channel_name, uid } => {
                let expected = self
                    .call_session
                    .as_ref()
                    .is_some_and(|s| s.channel_name == channel_name);
                if expected {
                    self.handle_channel_joined();
                } else {
                    tracing::debug!(channel = %channel_name, uid, "joined unexpected channel");
                }
            }
            EngineEvent::JoinFailed(failure) => self.handle_join_failure(failure),
            EngineEvent::ParticipantJoined { .. } => self.set_remote_joined(true),
            EngineEvent::ParticipantLeft { .. } => self.set_remote_joined(false),
            EngineEvent::ConnectionLost => {
                let Some(call) = self.state.active_call.as_mut() else {
                    return;
                };
                if call.status != CallStatus::InCall {
                    return;
                }
                tracing::warn!(call_id = %call.call_id, "call: media connection lost");
                call.set_status(CallStatus::Reconnecting);
                self.vendor_reconnecting = true;
                self.ensure_call_duration_ticks();
                self.emit_call_state();
            }
            EngineEvent::ConnectionRestored => {
                if !self.vendor_reconnecting {
                    return;
                }
                self.vendor_reconnecting = false;
                let Some(call) = self.state.active_call.as_mut() else {
                    return;
                };
                if call.status != CallStatus::Reconnecting {
                    return;
                }
                tracing::info!(call_id = %call.call_id, "call: media connection restored");
                call.set_status(CallStatus::InCall);
                self.ensure_call_duration_ticks();
                self.emit_call_state();
            }
            EngineEvent::Error { code, message } => {
                let joining = self
                    .state
                    .active_call
                    .as_ref()
                    .is_some_and(|c| c.is_joining());
                if joining && !self.vendor_reconnecting {
                    self.handle_join_failure(JoinFailure::from_code(code));
                } else {
                    tracing::warn!(code, message, "media engine error");
                }
            }
        }
    }

    // ── Mute / camera ───────────────────────────────────────────────────

    pub(super) fn handle_toggle_mute(&mut self) {
        let Some(call) = self.state.active_call.as_mut() else {
            return;
        };
        if call.is_ended() {
            return;
        }
        let target = !call.is_muted;
        call.is_muted = target;
        let result = match self.engine.as_mut() {
            Some(engine) => engine.set_muted(target),
            None => Err(EngineError::Unavailable),
        };
        if let Err(e) = result {
            tracing::warn!(%e, muted = target, "mute toggle failed, rolling back");
            if let Some(call) = self.state.active_call.as_mut() {
                call.is_muted = !target;
            }
            self.toast("Couldn't change the microphone");
            return;
        }
        self.emit_call_state();
    }

    pub(super) fn handle_toggle_camera(&mut self) {
        let Some(call) = self.state.active_call.as_mut() else {
            return;
        };
        if call.is_ended() {
            return;
        }
        let target = !call.is_camera_enabled;
        call.is_camera_enabled = target;
        let result = match self.engine.as_mut() {
            Some(engine) => engine.set_camera_enabled(target),
            None => Err(EngineError::Unavailable),
        };
        if let Err(e) = result {
            tracing::warn!(%e, enabled = target, "camera toggle failed, rolling back");
            if let Some(call) = self.state.active_call.as_mut() {
                call.is_camera_enabled = !target;
            }
            self.toast("Couldn't change the camera");
            return;
        }
        self.emit_call_state();
    }

    // ── Persistence and reconciliation ──────────────────────────────────

    fn persist_call_session(&mut self) {
        let (Some(store), Some(session)) = (self.session_store.as_mut(), self.call_session.as_ref())
        else {
            return;
        };
        if let Err(e) = store.save(session) {
            tracing::warn!(%e, call_id = %session.call_id, "failed to persist call session");
        }
    }

    /// A failed token must not survive in the store for a later resume.
    fn discard_persisted_token(&mut self, call_id: &str) {
        let stale = self
            .load_persisted_session()
            .is_some_and(|s| s.call_id == call_id && !s.access_token.is_empty());
        if stale {
            self.persist_call_session();
        }
    }

    fn clear_persisted_session(&mut self) {
        if let Some(store) = self.session_store.as_mut() {
            if let Err(e) = store.clear() {
                tracing::warn!(%e, "failed to clear persisted call session");
            }
        }
    }

    fn load_persisted_session(&self) -> Option<CallSession> {
        self.session_store.as_ref().and_then(|store| store.load())
    }

    pub(super) fn handle_backgrounded(&mut self) {
        self.app_foreground = false;
        let in_call = self
            .state
            .active_call
            .as_ref()
            .is_some_and(|c| c.status == CallStatus::InCall);
        if in_call && self.call_session.is_some() {
            // Synchronous: the app may be suspended right after this message.
            self.persist_call_session();
            self.backgrounded_in_call = true;
            tracing::info!("call: persisted session on background");
        }
    }

    pub(super) fn handle_foregrounded(&mut self) {
        self.app_foreground = true;
        if self.credentials.is_none() {
            return;
        }
        self.force_reconnect_signaling();

        if std::mem::take(&mut self.backgrounded_in_call) {
            let live_call = self
                .state
                .active_call
                .as_ref()
                .filter(|c| c.is_live() && self.call_session.is_some())
                .map(|c| c.call_id.clone());
            if let Some(call_id) = live_call {
                self.check_remote_status(call_id, ReconcilePurpose::SeamlessRejoin);
                return;
            }
        }
        if self.call_session.is_none()
            && !self.has_call_in_progress()
            && self.resume_candidate.is_none()
        {
            self.reconcile_persisted_session(false);
        }
    }

    /// Persisted session → oracle → prompt or silent clear. On cold start, also asks the
    /// backend whether the user has an active call when nothing is persisted.
    pub(super) fn reconcile_persisted_session(&mut self, check_server: bool) {
        match self.load_persisted_session() {
            Some(session) => {
                tracing::info!(call_id = %session.call_id, "call: found persisted session");
                self.check_remote_status(session.call_id, ReconcilePurpose::ResumePrompt);
            }
            None if check_server => {
                self.reconcile_token = self.reconcile_token.saturating_add(1);
                let token = self.reconcile_token;
                let backend = self.backend.clone();
                self.spawn_internal(async move {
                    let summary = match backend.active_call_for_user().await {
                        Ok(summary) => summary,
                        Err(e) => {
                            tracing::warn!(%e, "active call lookup failed");
                            None
                        }
                    };
                    InternalEvent::ServerActiveCallFetched { token, summary }
                });
            }
            None => {}
        }
    }

    fn check_remote_status(&mut self, call_id: String, purpose: ReconcilePurpose) {
        self.reconcile_token = self.reconcile_token.saturating_add(1);
        let token = self.reconcile_token;
        let backend = self.backend.clone();
        self.spawn_internal(async move {
            let active = api::is_call_active(backend.as_ref(), &call_id).await;
            InternalEvent::RemoteStatusChecked {
                token,
                call_id,
                active,
                purpose,
            }
        });
    }

    pub(super) fn handle_remote_status_checked(
        &mut self,
        token: u64,
        call_id: String,
        active: bool,
        purpose: ReconcilePurpose,
    ) {
        if token != self.reconcile_token {
            tracing::debug!(token, "stale status check ignored");
            return;
        }
        tracing::info!(call_id = %call_id, active, ?purpose, "call: remote status");
        match purpose {
            ReconcilePurpose::SeamlessRejoin => {
                let still_ours = self
                    .state
                    .active_call
                    .as_ref()
                    .is_some_and(|c| c.call_id == call_id && c.is_live())
                    && self.call_session.is_some();
                if !still_ours {
                    return;
                }
                if active {
                    self.rejoin_seamlessly();
                } else {
                    self.finish_call(END_REMOTE_ENDED);
                }
            }
            ReconcilePurpose::ResumePrompt => {
                if self.has_call_in_progress() {
                    return;
                }
                let Some(session) = self
                    .load_persisted_session()
                    .filter(|s| s.call_id == call_id)
                else {
                    return;
                };
                if active {
                    self.show_resume_prompt(ResumeCandidate::Persisted(session));
                } else {
                    tracing::info!(call_id = %call_id, "persisted call is over, clearing");
                    self.clear_persisted_session();
                }
            }
            ReconcilePurpose::Retry => {
                let retrying = self
                    .state
                    .active_call
                    .as_ref()
                    .is_some_and(|c| c.call_id == call_id && c.status == CallStatus::Connecting);
                if !retrying {
                    return;
                }
                if active {
                    self.request_join_credentials(call_id, false);
                    return;
                }
                self.clear_persisted_session();
                if let Some(call) = self.state.active_call.as_mut() {
                    call.set_status(CallStatus::Ended {
                        reason: END_REMOTE_ENDED.to_string(),
                    });
                    call.error = Some("This call has already ended".to_string());
                    call.can_retry = false;
                }
                self.emit_call_state();
                self.toast("This call has already ended");
            }
        }
    }

    fn rejoin_seamlessly(&mut self) {
        let Some(call) = self.state.active_call.as_mut() else {
            return;
        };
        tracing::info!(call_id = %call.call_id, "call: rejoining after foreground");
        call.set_status(CallStatus::Reconnecting);
        self.vendor_reconnecting = false;
        self.join_retries = 0;
        self.next_join_attempt();
        if let Some(engine) = self.engine.as_mut() {
            engine.leave_channel();
        }
        self.ensure_call_duration_ticks();
        self.emit_call_state();
        self.begin_join();
    }

    fn show_resume_prompt(&mut self, candidate: ResumeCandidate) {
        self.state.resume_prompt = Some(candidate.prompt());
        self.resume_candidate = Some(candidate);
        self.emit_state();
    }

    pub(super) fn handle_server_active_call_fetched(
        &mut self,
        token: u64,
        summary: Option<ActiveCallSummary>,
    ) {
        if token != self.reconcile_token {
            return;
        }
        if self.has_call_in_progress() || self.resume_candidate.is_some() {
            return;
        }
        let Some(summary) = summary else {
            return;
        };
        let status = summary.status.trim();
        if !status.is_empty() && !api::status_is_active(status) {
            return;
        }
        tracing::info!(call_id = %summary.call_id, "call: backend reports an active call");
        self.show_resume_prompt(ResumeCandidate::Server(summary));
    }

    pub(super) fn handle_resume_persisted_call(&mut self) {
        let Some(candidate) = self.resume_candidate.take() else {
            return;
        };
        self.state.resume_prompt = None;
        let Some(creds) = self.credentials.clone() else {
            self.emit_state();
            return;
        };
        if self.has_call_in_progress() {
            self.emit_state();
            self.toast("Finish your current call first");
            return;
        }

        self.reset_call_tracking();
        match candidate {
            ResumeCandidate::Persisted(session) => {
                let mut call =
                    CallState::connecting(session.call_id.clone(), session.role, session.call_type);
                call.started_at = session.started_at;
                call.appointment_id = session.appointment_id.clone();
                if let Some(other) = &session.other_participant {
                    call.other_participant_id = other.user_id.clone();
                    call.other_participant_name = other.name.clone();
                    call.other_participant_avatar = other.avatar_url.clone();
                }
                self.state.active_call = Some(call);
                self.call_session = Some(session);
                self.next_join_attempt();
                self.emit_call_state();
                self.begin_join();
            }
            ResumeCandidate::Server(summary) => {
                let call_type = CallType::parse_lenient(summary.call_type.as_deref());
                let mut call = CallState::connecting(summary.call_id.clone(), creds.role, call_type);
                call.started_at = summary.started_at;
                if let Some(other) = &summary.other_participant {
                    call.other_participant_id = other.user_id.clone();
                    call.other_participant_name = other.name.clone();
                    call.other_participant_avatar = other.avatar_url.clone();
                }
                self.state.active_call = Some(call);
                self.emit_call_state();
                self.request_join_credentials(summary.call_id, false);
            }
        }
    }

    pub(super) fn handle_end_persisted_call(&mut self) {
        let Some(candidate) = self.resume_candidate.take() else {
            return;
        };
        self.state.resume_prompt = None;
        self.emit_state();

        let call_id = candidate.call_id().to_string();
        let backend = self.backend.clone();
        self.spawn_internal(async move {
            let error = backend.end_call(&call_id).await.err().map(|e| e.to_string());
            InternalEvent::PersistedCallEnded { call_id, error }
        });
    }

    pub(super) fn handle_persisted_call_ended(&mut self, call_id: String, error: Option<String>) {
        if let Some(error) = error {
            tracing::warn!(call_id = %call_id, error = %error, "ending persisted call failed, clearing anyway");
        }
        let persisted_matches = self
            .load_persisted_session()
            .is_some_and(|s| s.call_id == call_id);
        if persisted_matches && !self.is_current_call(&call_id) {
            self.clear_persisted_session();
        }
    }

    pub(super) fn handle_retry_call(&mut self) {
        let Some(call) = self.state.active_call.as_mut() else {
            return;
        };
        if !call.is_ended() || !call.can_retry || call.call_id.is_empty() {
            return;
        }
        call.set_status(CallStatus::Connecting);
        call.error = None;
        call.can_retry = false;
        call.remote_joined = false;
        let call_id = call.call_id.clone();
        tracing::info!(call_id = %call_id, "call: retry requested");
        self.join_retries = 0;
        self.emit_call_state();
        self.check_remote_status(call_id, ReconcilePurpose::Retry);
    }
}
