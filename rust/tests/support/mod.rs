#![allow(dead_code)]

mod mock_backend;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use medcall_core::{AppReconciler, AppUpdate};

pub use mock_backend::{MockBackend, MockState};

pub fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("{what}: condition not met within {timeout:?}");
}

#[derive(Clone, Default)]
pub struct Collector {
    pub updates: Arc<Mutex<Vec<AppUpdate>>>,
}

impl AppReconciler for Collector {
    fn reconcile(&self, update: AppUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

impl Collector {
    pub fn snapshot(&self) -> Vec<AppUpdate> {
        self.updates.lock().unwrap().clone()
    }
}
