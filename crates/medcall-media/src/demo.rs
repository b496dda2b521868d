use crate::engine::{
    EngineError, EngineEventSink, JoinOutcome, MediaEngine, MediaEngineFactory,
};

/// Stand-in used when the vendor engine is missing on this runtime.
///
/// Every operation succeeds without touching any media so the call screen can
/// still be presented (demo mode).
#[derive(Debug, Default)]
pub struct DemoEngine {
    channel: Option<String>,
}

impl DemoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }
}

impl MediaEngine for DemoEngine {
    fn join_channel(&mut self, _token: &str, channel_name: &str, uid: u32) -> JoinOutcome {
        tracing::info!(channel = channel_name, uid, "demo engine: join");
        self.channel = Some(channel_name.to_string());
        JoinOutcome::Joined
    }

    fn leave_channel(&mut self) {
        self.channel = None;
    }

    fn set_muted(&mut self, _muted: bool) -> Result<(), EngineError> {
        Ok(())
    }

    fn set_camera_enabled(&mut self, _enabled: bool) -> Result<(), EngineError> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.channel = None;
    }

    fn is_demo(&self) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DemoEngineFactory;

impl MediaEngineFactory for DemoEngineFactory {
    fn create(
        &self,
        _app_id: &str,
        _events: EngineEventSink,
    ) -> Result<Box<dyn MediaEngine>, EngineError> {
        Ok(Box::new(DemoEngine::new()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn demo_engine_joins_immediately_and_tracks_channel() {
        let mut engine = DemoEngineFactory
            .create("app", Arc::new(|_| {}))
            .expect("demo engine");
        assert!(engine.is_demo());
        assert_eq!(engine.join_channel("t", "ch1", 7), JoinOutcome::Joined);
        assert!(engine.set_muted(true).is_ok());
        assert!(engine.set_camera_enabled(false).is_ok());
        engine.leave_channel();
        engine.destroy();
    }
}
