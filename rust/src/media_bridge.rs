use std::sync::{Arc, RwLock};

use medcall_media::{
    EngineError, EngineEvent, EngineEventSink, JoinFailure, JoinOutcome, MediaEngine,
    MediaEngineFactory,
};

/// Native side of the real-time media SDK. Return codes follow the vendor SDK: `0` is
/// success, anything else is a vendor error code.
#[uniffi::export(callback_interface)]
pub trait MediaEngineBridge: Send + Sync + 'static {
    /// Creates the vendor engine for `app_id`. `false` if the SDK refused.
    fn create_engine(&self, app_id: String) -> bool;
    fn join_channel(&self, token: String, channel_name: String, uid: u32) -> i32;
    fn leave_channel(&self) -> i32;
    fn set_muted(&self, muted: bool) -> i32;
    fn set_camera_enabled(&self, enabled: bool) -> i32;
    fn destroy_engine(&self);
}

/// Vendor callbacks as the native shell reports them.
#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum MediaEngineEvent {
    JoinChannelSuccess { channel_name: String, uid: u32 },
    JoinFailed { code: i32 },
    UserJoined { uid: u32 },
    UserOffline { uid: u32 },
    ConnectionLost,
    Rejoined,
    Error { code: i32, message: String },
}

impl From<MediaEngineEvent> for EngineEvent {
    fn from(event: MediaEngineEvent) -> Self {
        match event {
            MediaEngineEvent::JoinChannelSuccess { channel_name, uid } => {
                EngineEvent::JoinedChannel { channel_name, uid }
            }
            MediaEngineEvent::JoinFailed { code } => {
                EngineEvent::JoinFailed(JoinFailure::from_code(code))
            }
            MediaEngineEvent::UserJoined { uid } => EngineEvent::ParticipantJoined { uid },
            MediaEngineEvent::UserOffline { uid } => EngineEvent::ParticipantLeft { uid },
            MediaEngineEvent::ConnectionLost => EngineEvent::ConnectionLost,
            MediaEngineEvent::Rejoined => EngineEvent::ConnectionRestored,
            MediaEngineEvent::Error { code, message } => EngineEvent::Error { code, message },
        }
    }
}

pub(crate) type SharedMediaEngineBridge = Arc<RwLock<Option<Arc<dyn MediaEngineBridge>>>>;
type SharedEventSink = Arc<RwLock<Option<EngineEventSink>>>;

fn current_bridge(slot: &SharedMediaEngineBridge) -> Option<Arc<dyn MediaEngineBridge>> {
    match slot.read() {
        Ok(g) => g.clone(),
        Err(poison) => poison.into_inner().clone(),
    }
}

fn set_sink(slot: &SharedEventSink, sink: Option<EngineEventSink>) {
    match slot.write() {
        Ok(mut g) => *g = sink,
        Err(poison) => *poison.into_inner() = sink,
    }
}

/// Engine factory backed by whatever bridge the native shell installed. No bridge
/// means no vendor SDK on this runtime.
#[derive(Clone)]
pub(crate) struct PlatformEngineFactory {
    bridge: SharedMediaEngineBridge,
    sink: SharedEventSink,
}

impl PlatformEngineFactory {
    pub fn new(bridge: SharedMediaEngineBridge) -> Self {
        Self {
            bridge,
            sink: Arc::new(RwLock::new(None)),
        }
    }

    /// Routes a native callback to the live engine. Dropped when no engine is live.
    pub fn report(&self, event: MediaEngineEvent) {
        let sink = match self.sink.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        };
        match sink {
            Some(sink) => sink(event.into()),
            None => tracing::debug!(?event, "media event without a live engine dropped"),
        }
    }
}

impl MediaEngineFactory for PlatformEngineFactory {
    fn create(
        &self,
        app_id: &str,
        events: EngineEventSink,
    ) -> Result<Box<dyn MediaEngine>, EngineError> {
        let Some(bridge) = current_bridge(&self.bridge) else {
            return Err(EngineError::Unavailable);
        };
        if !bridge.create_engine(app_id.to_string()) {
            return Err(EngineError::CreateFailed(format!(
                "platform refused app id {app_id:?}"
            )));
        }
        set_sink(&self.sink, Some(events));
        tracing::info!("platform media engine created");
        Ok(Box::new(PlatformEngine {
            bridge,
            sink: self.sink.clone(),
            destroyed: false,
        }))
    }
}

struct PlatformEngine {
    bridge: Arc<dyn MediaEngineBridge>,
    sink: SharedEventSink,
    destroyed: bool,
}

impl std::fmt::Debug for PlatformEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformEngine")
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl MediaEngine for PlatformEngine {
    fn join_channel(&mut self, token: &str, channel_name: &str, uid: u32) -> JoinOutcome {
        match self
            .bridge
            .join_channel(token.to_string(), channel_name.to_string(), uid)
        {
            0 => JoinOutcome::Pending,
            code => JoinOutcome::Failed(JoinFailure::from_code(code)),
        }
    }

    fn leave_channel(&mut self) {
        let code = self.bridge.leave_channel();
        if code != 0 {
            tracing::warn!(code, "leave channel failed");
        }
    }

    fn set_muted(&mut self, muted: bool) -> Result<(), EngineError> {
        match self.bridge.set_muted(muted) {
            0 => Ok(()),
            code => Err(EngineError::Rejected {
                op: "set_muted",
                code,
            }),
        }
    }

    fn set_camera_enabled(&mut self, enabled: bool) -> Result<(), EngineError> {
        match self.bridge.set_camera_enabled(enabled) {
            0 => Ok(()),
            code => Err(EngineError::Rejected {
                op: "set_camera_enabled",
                code,
            }),
        }
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        set_sink(&self.sink, None);
        self.bridge.destroy_engine();
        tracing::info!("platform media engine destroyed");
    }
}

impl Drop for PlatformEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use medcall_media::JoinFailureKind;

    use super::*;

    #[derive(Default)]
    struct RecordingBridge {
        calls: Mutex<Vec<String>>,
        join_code: i32,
        mute_code: i32,
    }

    impl MediaEngineBridge for RecordingBridge {
        fn create_engine(&self, app_id: String) -> bool {
            self.calls.lock().unwrap().push(format!("create:{app_id}"));
            !app_id.is_empty()
        }

        fn join_channel(&self, _token: String, channel_name: String, uid: u32) -> i32 {
            self.calls
                .lock()
                .unwrap()
                .push(format!("join:{channel_name}:{uid}"));
            self.join_code
        }

        fn leave_channel(&self) -> i32 {
            self.calls.lock().unwrap().push("leave".into());
            0
        }

        fn set_muted(&self, muted: bool) -> i32 {
            self.calls.lock().unwrap().push(format!("mute:{muted}"));
            self.mute_code
        }

        fn set_camera_enabled(&self, enabled: bool) -> i32 {
            self.calls.lock().unwrap().push(format!("camera:{enabled}"));
            0
        }

        fn destroy_engine(&self) {
            self.calls.lock().unwrap().push("destroy".into());
        }
    }

    fn factory_with(bridge: Option<Arc<RecordingBridge>>) -> PlatformEngineFactory {
        let slot: SharedMediaEngineBridge = Arc::new(RwLock::new(
            bridge.map(|b| b as Arc<dyn MediaEngineBridge>),
        ));
        PlatformEngineFactory::new(slot)
    }

    fn collecting_sink() -> (EngineEventSink, Arc<Mutex<Vec<EngineEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_for_sink = seen.clone();
        let sink: EngineEventSink = Arc::new(move |event| {
            seen_for_sink.lock().unwrap().push(event);
        });
        (sink, seen)
    }

    #[test]
    fn missing_bridge_reports_unavailable() {
        let factory = factory_with(None);
        let (sink, _) = collecting_sink();
        assert_eq!(
            factory.create("app", sink).unwrap_err(),
            EngineError::Unavailable
        );
    }

    #[test]
    fn refused_creation_is_an_error() {
        let factory = factory_with(Some(Arc::new(RecordingBridge::default())));
        let (sink, _) = collecting_sink();
        assert!(matches!(
            factory.create("", sink),
            Err(EngineError::CreateFailed(_))
        ));
    }

    #[test]
    fn return_codes_map_to_outcomes() {
        let bridge = Arc::new(RecordingBridge {
            join_code: -109,
            mute_code: 7,
            ..Default::default()
        });
        let factory = factory_with(Some(bridge.clone()));
        let (sink, _) = collecting_sink();
        let mut engine = factory.create("app", sink).unwrap();

        match engine.join_channel("t", "ch", 5) {
            JoinOutcome::Failed(failure) => assert_eq!(failure.kind, JoinFailureKind::TokenExpired),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            engine.set_muted(true),
            Err(EngineError::Rejected {
                op: "set_muted",
                code: 7
            })
        );
        assert!(engine.set_camera_enabled(false).is_ok());
    }

    #[test]
    fn events_route_to_live_engine_only_and_destroy_runs_once() {
        let bridge = Arc::new(RecordingBridge::default());
        let factory = factory_with(Some(bridge.clone()));
        let (sink, seen) = collecting_sink();
        let mut engine = factory.create("app", sink).unwrap();
        assert_eq!(engine.join_channel("t", "ch", 5), JoinOutcome::Pending);

        factory.report(MediaEngineEvent::JoinChannelSuccess {
            channel_name: "ch".into(),
            uid: 5,
        });
        factory.report(MediaEngineEvent::Rejoined);
        engine.destroy();
        factory.report(MediaEngineEvent::UserJoined { uid: 9 });
        drop(engine);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                EngineEvent::JoinedChannel {
                    channel_name: "ch".into(),
                    uid: 5
                },
                EngineEvent::ConnectionRestored,
            ]
        );
        let destroys = bridge
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == "destroy")
            .count();
        assert_eq!(destroys, 1);
    }
}
