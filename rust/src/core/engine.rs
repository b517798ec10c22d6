// Ownership of the media engine handle.

use std::sync::Arc;
use std::time::Duration;

use flume::Sender;
use huddle_media::{EngineEvent, EngineEventSink, EngineFactory, MediaEngine};

use super::error::CallError;
use crate::updates::{CoreMsg, InternalEvent};

/// Forwards engine callbacks into the actor, tagged with the engine instance.
pub(super) struct ActorEngineSink {
    tx: Sender<CoreMsg>,
    generation: u64,
}

impl EngineEventSink for ActorEngineSink {
    fn on_event(&self, event: EngineEvent) {
        let _ = self.tx.send(CoreMsg::Internal(Box::new(InternalEvent::Engine {
            generation: self.generation,
            event,
        })));
    }
}

/// The only place an engine is created or handed off for release.
///
/// `initialized` is tracked separately from the handle, but both are cleared
/// together by [`EngineLifecycle::take_for_release`].
pub(super) struct EngineLifecycle {
    factory: Arc<dyn EngineFactory>,
    events: Sender<CoreMsg>,
    handle: Option<Arc<dyn MediaEngine>>,
    initialized: bool,
    generation: u64,
}

impl EngineLifecycle {
    pub(super) fn new(factory: Arc<dyn EngineFactory>, events: Sender<CoreMsg>) -> Self {
        Self {
            factory,
            events,
            handle: None,
            initialized: false,
            generation: 0,
        }
    }

    pub(super) fn generation(&self) -> u64 {
        self.generation
    }

    pub(super) fn handle(&self) -> Option<Arc<dyn MediaEngine>> {
        self.handle.clone()
    }

    pub(super) fn ensure_engine(&mut self) -> Result<Arc<dyn MediaEngine>, CallError> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }
        let generation = self.generation + 1;
        let sink = Arc::new(ActorEngineSink {
            tx: self.events.clone(),
            generation,
        });
        let engine = self
            .factory
            .create(sink)
            .map_err(CallError::from_engine_setup)?;
        self.generation = generation;
        self.initialized = false;
        self.handle = Some(engine.clone());
        tracing::info!(generation, "engine: created");
        Ok(engine)
    }

    /// Configures a fresh engine for voice calls and leaves every audio stream
    /// muted until the call is connected.
    pub(super) fn initialize_once(
        &mut self,
        app_id: &str,
        speakerphone: bool,
    ) -> Result<(), CallError> {
        if self.initialized {
            return Ok(());
        }
        let Some(engine) = self.handle.clone() else {
            return Err(CallError::EngineCreation("no engine handle".to_string()));
        };
        engine
            .initialize(app_id)
            .and_then(|_| engine.enable_audio())
            .and_then(|_| engine.configure_voice_audio())
            .and_then(|_| engine.set_default_audio_route_to_speakerphone(speakerphone))
            .and_then(|_| engine.mute_local_audio_stream(true))
            .and_then(|_| engine.mute_all_remote_audio_streams(true))
            .map_err(CallError::from_engine_setup)?;
        self.initialized = true;
        tracing::info!(generation = self.generation, "engine: initialized");
        Ok(())
    }

    pub(super) fn take_for_release(&mut self) -> Option<Arc<dyn MediaEngine>> {
        self.initialized = false;
        self.handle.take()
    }
}

/// Mute, give the leave time to settle, then release. Failures are collected;
/// the handle is already detached from the lifecycle so nothing can get stuck.
pub(super) async fn release_engine(
    engine: Arc<dyn MediaEngine>,
    grace: Duration,
    errors: &mut Vec<CallError>,
) {
    force_mute(engine.as_ref(), errors);
    tokio::time::sleep(grace).await;
    if let Err(e) = engine.release() {
        tracing::warn!(%e, "engine: release failed");
        errors.push(CallError::cleanup("release", e));
    }
}

pub(super) fn force_mute(engine: &dyn MediaEngine, errors: &mut Vec<CallError>) {
    if let Err(e) = engine.mute_local_audio_stream(true) {
        errors.push(CallError::cleanup("mute_local", e));
    }
    if let Err(e) = engine.mute_all_remote_audio_streams(true) {
        errors.push(CallError::cleanup("mute_remote", e));
    }
}
