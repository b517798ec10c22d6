#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use huddle_core::{AppReconciler, AppUpdate, CallPhase, FfiApp};

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

/// Offline config with short settle and unmute delays. `extra` keys override the defaults.
pub fn write_config(data_dir: &str, extra: serde_json::Value) {
    let path = std::path::Path::new(data_dir).join("huddle_config.json");
    let mut v = serde_json::json!({
        "app_id": "test-app",
        "disable_network": true,
        "call_audio_backend": "loopback",
        "leave_settle_ms": 20,
        "audio_unmute_delay_ms": 50,
    });
    if let (Some(base), Some(extra)) = (v.as_object_mut(), extra.as_object()) {
        for (k, val) in extra {
            base.insert(k.clone(), val.clone());
        }
    }
    std::fs::write(path, serde_json::to_vec(&v).unwrap()).unwrap();
}

/// Unique per test so parallel tests never share a call document or channel.
pub fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

pub struct TestReconciler {
    updates: Arc<Mutex<Vec<AppUpdate>>>,
}

impl TestReconciler {
    pub fn new() -> (Self, Arc<Mutex<Vec<AppUpdate>>>) {
        let updates = Arc::new(Mutex::new(vec![]));
        (
            Self {
                updates: updates.clone(),
            },
            updates,
        )
    }
}

impl AppReconciler for TestReconciler {
    fn reconcile(&self, update: AppUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

pub struct TestApp {
    pub app: Arc<FfiApp>,
    pub updates: Arc<Mutex<Vec<AppUpdate>>>,
    _dir: tempfile::TempDir,
}

impl TestApp {
    pub fn new(extra_config: serde_json::Value) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        write_config(&data_dir, extra_config);
        let app = FfiApp::new(data_dir);
        let (reconciler, updates) = TestReconciler::new();
        app.listen_for_updates(Box::new(reconciler));
        Self {
            app,
            updates,
            _dir: dir,
        }
    }

    pub fn phase(&self) -> Option<CallPhase> {
        self.app.state().active_call.map(|c| c.phase)
    }

    pub fn closed_reasons(&self) -> Vec<String> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter_map(|u| match u {
                AppUpdate::CallClosed { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn wait_for_phase(&self, what: &str, phase: CallPhase) {
        wait_until(what, Duration::from_secs(5), || {
            self.phase().as_ref() == Some(&phase)
        });
    }

    /// Teardown always waits out the engine release grace.
    pub fn wait_for_close(&self, what: &str) -> String {
        wait_until(what, Duration::from_secs(10), || {
            !self.closed_reasons().is_empty()
        });
        self.closed_reasons().remove(0)
    }
}
