mod actions;
mod bridge;
mod core;
mod logging;
mod state;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::{Receiver, Sender};
use huddle_media::EngineFactory;

use crate::bridge::{
    forward_engine_event, SharedEngineSink, SwitchingEngineFactory, SwitchingSignalingStore,
};
use crate::core::signaling::snapshot_msg;

pub use actions::AppAction;
pub use bridge::{
    EngineEventRecord, PlatformMediaEngine, PlatformSignalingStore, SignalingWriteResult,
};
pub use crate::core::signaling::{
    CallDocument, CallDocumentUpdate, InMemorySignalingStore, SignalingError, SignalingStatus,
};
pub use crate::core::token::{
    HttpTokenProvider, SessionToken, StaticTokenProvider, TokenFetchError, TokenProvider,
};
pub use crate::core::CallError;
pub use state::*;
pub use updates::*;

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
    engine_factory: Arc<SwitchingEngineFactory>,
    engine_sink: SharedEngineSink,
    signaling: Arc<SwitchingSignalingStore>,
}

#[uniffi::export]
impl FfiApp {
    #[uniffi::constructor]
    pub fn new(data_dir: String) -> Arc<Self> {
        logging::init_logging(&data_dir);
        tracing::info!(data_dir = %data_dir, "FfiApp::new() starting");

        let config = crate::core::load_call_config(&data_dir);
        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));
        let engine_sink: SharedEngineSink = Arc::new(RwLock::new(None));
        let engine_factory = Arc::new(SwitchingEngineFactory::new(
            engine_sink.clone(),
            config.prefers_loopback_engine(),
        ));
        let signaling = Arc::new(SwitchingSignalingStore::new());

        // Actor loop thread (single threaded "app actor").
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        let collaborators = crate::core::Collaborators {
            engine_factory: engine_factory.clone(),
            signaling: signaling.clone(),
            tokens: crate::core::token::provider_from_config(&config),
        };
        thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_time()
                .enable_io()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(%e, "FfiApp: tokio runtime unavailable, core not started");
                    return;
                }
            };
            let mut core = crate::core::CallSessionManager::new(
                update_tx,
                core_tx_for_core,
                config,
                shared_for_core,
                runtime.handle().clone(),
                collaborators,
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
            engine_factory,
            engine_sink,
            signaling,
        })
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

    /// Registers the native engine. Used by calls started after this returns.
    pub fn set_media_engine(&self, engine: Box<dyn PlatformMediaEngine>) {
        self.engine_factory.set_platform(Arc::from(engine));
    }

    /// Engine callback from the native engine. Safe to call from any thread.
    pub fn on_engine_event(&self, event: EngineEventRecord) {
        forward_engine_event(&self.engine_sink, event.into());
    }

    pub fn set_signaling_store(&self, store: Box<dyn PlatformSignalingStore>) {
        self.signaling.set_platform(Arc::from(store));
    }

    /// Live-query result for `call_id`. `None` means the document was deleted.
    pub fn on_signaling_snapshot(&self, call_id: String, document_json: Option<String>) {
        let document = match document_json.as_deref().map(CallDocument::parse).transpose() {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!(%call_id, %e, "signaling: snapshot dropped");
                return;
            }
        };
        let _ = self.core_tx.send(snapshot_msg(&call_id, document));
    }
}

impl FfiApp {
    /// Replaces the engine backend for calls started afterwards.
    pub fn set_engine_factory_for_tests(&self, factory: Arc<dyn EngineFactory>) {
        self.engine_factory.set_override_for_tests(factory);
    }
}
