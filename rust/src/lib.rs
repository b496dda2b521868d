mod actions;
mod core;
mod logging;
mod media_bridge;
mod state;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::{Receiver, Sender};
use medcall_media::MediaEngineFactory;

pub use actions::AppAction;
pub use media_bridge::{MediaEngineBridge, MediaEngineEvent};
pub use state::*;
pub use updates::*;

// Not exposed over UniFFI; used by the probe binary.
pub use crate::core::{
    connect_signaling, fetch_call_status, status_is_active, ApiError, SignalingConfig,
    SignalingConnection, SignalingError, SignalingEvent,
};

use media_bridge::{PlatformEngineFactory, SharedMediaEngineBridge};

uniffi::setup_scaffolding!();

#[uniffi::export(callback_interface)]
pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

#[derive(uniffi::Object)]
pub struct FfiApp {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
    media_bridge: SharedMediaEngineBridge,
    platform_engines: PlatformEngineFactory,
}

#[uniffi::export]
impl FfiApp {
    #[uniffi::constructor]
    pub fn new(data_dir: String) -> Arc<Self> {
        logging::init_logging(&data_dir);
        tracing::info!(data_dir = %data_dir, "FfiApp::new() starting");

        let media_bridge: SharedMediaEngineBridge = Arc::new(RwLock::new(None));
        let platform_engines = PlatformEngineFactory::new(media_bridge.clone());
        Self::spawn(
            data_dir,
            Arc::new(platform_engines.clone()),
            media_bridge,
            platform_engines,
        )
    }

    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn AppReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }

    /// Installs the native media SDK. Without one, calls run in demo mode.
    pub fn set_media_engine_bridge(&self, bridge: Box<dyn MediaEngineBridge>) {
        let bridge: Arc<dyn MediaEngineBridge> = Arc::from(bridge);
        match self.media_bridge.write() {
            Ok(mut slot) => {
                *slot = Some(bridge);
            }
            Err(poison) => {
                *poison.into_inner() = Some(bridge);
            }
        }
    }

    /// Vendor SDK callbacks, forwarded by the native shell from any thread.
    pub fn report_media_event(&self, event: MediaEngineEvent) {
        self.platform_engines.report(event);
    }
}

impl FfiApp {
    /// Builds an app whose calls use `engines` instead of the native bridge.
    pub fn new_with_engine_factory(
        data_dir: String,
        engines: Arc<dyn MediaEngineFactory>,
    ) -> Arc<Self> {
        let media_bridge: SharedMediaEngineBridge = Arc::new(RwLock::new(None));
        let platform_engines = PlatformEngineFactory::new(media_bridge.clone());
        Self::spawn(data_dir, engines, media_bridge, platform_engines)
    }

    fn spawn(
        data_dir: String,
        engines: Arc<dyn MediaEngineFactory>,
        media_bridge: SharedMediaEngineBridge,
        platform_engines: PlatformEngineFactory,
    ) -> Arc<Self> {
        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));

        // Actor loop thread (single threaded "app actor").
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        thread::spawn(move || {
            let mut core = crate::core::AppCore::new(
                update_tx,
                core_tx_for_core,
                data_dir,
                shared_for_core,
                engines,
            );
            while let Ok(msg) = core_rx.recv() {
                core.handle_message(msg);
            }
        });

        Arc::new(Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
            media_bridge,
            platform_engines,
        })
    }
}
