use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::engine::{
    EngineError, EngineEvent, EngineEventSink, JoinFailure, JoinOutcome, MediaEngine,
    MediaEngineFactory,
};

/// Scripted result for the next `join_channel` call on a loopback engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackJoin {
    /// Accept, then confirm through `EngineEvent::JoinedChannel`.
    Accept,
    /// Accept synchronously (`JoinOutcome::Joined`).
    AcceptNow,
    /// Reject synchronously with a vendor code.
    Reject(i32),
    /// Accept, then fail through `EngineEvent::JoinFailed`.
    FailLater(i32),
    /// Accept and never report back.
    Hold,
}

#[derive(Default)]
struct LoopbackState {
    unavailable: bool,
    script: VecDeque<LoopbackJoin>,
    fail_mute: bool,
    fail_camera: bool,
    created: u32,
    destroyed: u32,
    live: u32,
    leaves: u32,
    joins: Vec<(String, String, u32)>,
    muted: bool,
    camera_enabled: bool,
    sink: Option<EngineEventSink>,
}

/// In-process engine with no real media, used by tests.
///
/// Clones share state, so a test can keep one clone to script join outcomes and
/// inspect what the call core asked the engine to do.
#[derive(Clone, Default)]
pub struct LoopbackEngineFactory {
    state: Arc<Mutex<LoopbackState>>,
}

impl std::fmt::Debug for LoopbackEngineFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("LoopbackEngineFactory")
            .field("created", &state.created)
            .field("destroyed", &state.destroyed)
            .field("joins", &state.joins.len())
            .finish()
    }
}

impl LoopbackEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn script_joins(&self, outcomes: impl IntoIterator<Item = LoopbackJoin>) {
        self.lock().script.extend(outcomes);
    }

    pub fn set_fail_mute(&self, fail: bool) {
        self.lock().fail_mute = fail;
    }

    pub fn set_fail_camera(&self, fail: bool) {
        self.lock().fail_camera = fail;
    }

    /// Emit an event as if the vendor SDK fired a callback.
    pub fn emit(&self, event: EngineEvent) {
        let sink = self.lock().sink.clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    pub fn created_count(&self) -> u32 {
        self.lock().created
    }

    pub fn destroyed_count(&self) -> u32 {
        self.lock().destroyed
    }

    pub fn live_engines(&self) -> u32 {
        self.lock().live
    }

    pub fn leave_count(&self) -> u32 {
        self.lock().leaves
    }

    /// Tokens passed to `join_channel`, in call order.
    pub fn join_tokens(&self) -> Vec<String> {
        self.lock().joins.iter().map(|(t, _, _)| t.clone()).collect()
    }

    pub fn join_count(&self) -> usize {
        self.lock().joins.len()
    }

    pub fn last_join(&self) -> Option<(String, String, u32)> {
        self.lock().joins.last().cloned()
    }

    pub fn is_muted(&self) -> bool {
        self.lock().muted
    }

    pub fn is_camera_enabled(&self) -> bool {
        self.lock().camera_enabled
    }
}

impl MediaEngineFactory for LoopbackEngineFactory {
    fn create(
        &self,
        app_id: &str,
        events: EngineEventSink,
    ) -> Result<Box<dyn MediaEngine>, EngineError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(EngineError::Unavailable);
        }
        if app_id.trim().is_empty() {
            return Err(EngineError::CreateFailed("empty app id".to_string()));
        }
        state.created += 1;
        state.live += 1;
        state.camera_enabled = true;
        state.sink = Some(events);
        Ok(Box::new(LoopbackEngine {
            shared: self.clone(),
            destroyed: false,
        }))
    }
}

struct LoopbackEngine {
    shared: LoopbackEngineFactory,
    destroyed: bool,
}

impl std::fmt::Debug for LoopbackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackEngine")
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl MediaEngine for LoopbackEngine {
    fn join_channel(&mut self, token: &str, channel_name: &str, uid: u32) -> JoinOutcome {
        let (step, sink) = {
            let mut state = self.shared.lock();
            state
                .joins
                .push((token.to_string(), channel_name.to_string(), uid));
            let step = state.script.pop_front().unwrap_or(LoopbackJoin::Accept);
            (step, state.sink.clone())
        };
        let emit = |event: EngineEvent| {
            if let Some(sink) = &sink {
                sink(event);
            }
        };
        match step {
            LoopbackJoin::Accept => {
                emit(EngineEvent::JoinedChannel {
                    channel_name: channel_name.to_string(),
                    uid,
                });
                JoinOutcome::Pending
            }
            LoopbackJoin::AcceptNow => JoinOutcome::Joined,
            LoopbackJoin::Reject(code) => JoinOutcome::Failed(JoinFailure::from_code(code)),
            LoopbackJoin::FailLater(code) => {
                emit(EngineEvent::JoinFailed(JoinFailure::from_code(code)));
                JoinOutcome::Pending
            }
            LoopbackJoin::Hold => JoinOutcome::Pending,
        }
    }

    fn leave_channel(&mut self) {
        self.shared.lock().leaves += 1;
    }

    fn set_muted(&mut self, muted: bool) -> Result<(), EngineError> {
        let mut state = self.shared.lock();
        if state.fail_mute {
            return Err(EngineError::Rejected {
                op: "set_muted",
                code: -1,
            });
        }
        state.muted = muted;
        Ok(())
    }

    fn set_camera_enabled(&mut self, enabled: bool) -> Result<(), EngineError> {
        let mut state = self.shared.lock();
        if state.fail_camera {
            return Err(EngineError::Rejected {
                op: "set_camera_enabled",
                code: -1,
            });
        }
        state.camera_enabled = enabled;
        Ok(())
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let mut state = self.shared.lock();
        state.destroyed += 1;
        state.live = state.live.saturating_sub(1);
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::engine::JoinFailureKind;

    fn sink() -> (EngineEventSink, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let sink: EngineEventSink = Arc::new(move |event| {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send(event);
            }
        });
        (sink, rx)
    }

    #[test]
    fn scripted_outcomes_are_consumed_in_order() {
        let factory = LoopbackEngineFactory::new();
        factory.script_joins([LoopbackJoin::Reject(109), LoopbackJoin::Accept]);
        let (events, rx) = sink();
        let mut engine = factory.create("app", events).expect("create");

        match engine.join_channel("expired", "ch1", 42) {
            JoinOutcome::Failed(failure) => {
                assert_eq!(failure.kind, JoinFailureKind::TokenExpired)
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(engine.join_channel("fresh", "ch1", 42), JoinOutcome::Pending);
        assert_eq!(
            rx.try_recv().expect("joined event"),
            EngineEvent::JoinedChannel {
                channel_name: "ch1".to_string(),
                uid: 42
            }
        );
        assert_eq!(factory.join_tokens(), vec!["expired", "fresh"]);
    }

    #[test]
    fn unavailable_factory_refuses_to_create() {
        let factory = LoopbackEngineFactory::new();
        factory.set_unavailable(true);
        let (events, _rx) = sink();
        let err = factory.create("app", events).unwrap_err();
        assert_eq!(err, EngineError::Unavailable);
        assert_eq!(factory.created_count(), 0);
    }

    #[test]
    fn destroy_is_counted_once_even_when_dropped_later() {
        let factory = LoopbackEngineFactory::new();
        let (events, _rx) = sink();
        let mut engine = factory.create("app", events).expect("create");
        engine.destroy();
        drop(engine);
        assert_eq!(factory.destroyed_count(), 1);
        assert_eq!(factory.live_engines(), 0);
    }

    #[test]
    fn failing_toggles_leave_state_untouched() {
        let factory = LoopbackEngineFactory::new();
        let (events, _rx) = sink();
        let mut engine = factory.create("app", events).expect("create");
        factory.set_fail_mute(true);
        assert!(engine.set_muted(true).is_err());
        assert!(!factory.is_muted());
        factory.set_fail_mute(false);
        assert!(engine.set_muted(true).is_ok());
        assert!(factory.is_muted());
    }

    #[test]
    fn debug_output_summarises_a_factory_with_a_live_engine() {
        let factory = LoopbackEngineFactory::new();
        let (events, _rx) = sink();
        let mut engine = factory.create("app", events).expect("create");
        engine.join_channel("tok", "ch1", 1);

        let rendered = format!("{factory:?} {engine:?}");
        assert!(rendered.contains("LoopbackEngineFactory"));
        assert!(rendered.contains("created: 1"));
        assert!(rendered.contains("joins: 1"));
    }
}
