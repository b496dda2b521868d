pub mod codes;
pub mod demo;
pub mod engine;
pub mod loopback;

pub use codes::classify_vendor_code;
pub use demo::{DemoEngine, DemoEngineFactory};
pub use engine::{
    EngineError, EngineEvent, EngineEventSink, JoinFailure, JoinFailureKind, JoinOutcome,
    MediaEngine, MediaEngineFactory,
};
pub use loopback::{LoopbackEngineFactory, LoopbackJoin};
