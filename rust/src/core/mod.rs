mod call_control;
pub(crate) mod cleanup;
mod config;
mod engine;
mod error;
mod ring_timeout;
mod session;
pub(crate) mod signaling;
mod sync;
mod timers;
pub(crate) mod token;

#[cfg(test)]
mod tests;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use flume::Sender;
use huddle_media::{EngineEvent, EngineFactory, MediaEngine};
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::actions::AppAction;
use crate::state::{now_seconds, AppState, CallPhase, CallRole, EnginePhase, SignalingPhase};
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

use cleanup::CleanupState;
use engine::EngineLifecycle;
use session::CallSession;
use signaling::SignalingStore;
use timers::SessionTimers;
use token::TokenProvider;

pub(crate) use config::{load_call_config, CallConfig};
pub use error::CallError;

/// External systems the manager talks to.
pub(crate) struct Collaborators {
    pub engine_factory: Arc<dyn EngineFactory>,
    pub signaling: Arc<dyn SignalingStore>,
    pub tokens: Arc<dyn TokenProvider>,
}

/// Owns the call session and the engine handle. Runs on the actor thread; all
/// async work reports back through `core_sender`.
pub(crate) struct CallSessionManager {
    pub state: AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    config: CallConfig,
    runtime: Handle,

    engine: EngineLifecycle,
    signaling: Arc<dyn SignalingStore>,
    tokens: Arc<dyn TokenProvider>,

    session: Option<CallSession>,
    cleanup: CleanupState,
    next_seq: u64,
    timers: SessionTimers,
}

impl CallSessionManager {
    pub(crate) fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        config: CallConfig,
        shared_state: Arc<RwLock<AppState>>,
        runtime: Handle,
        collaborators: Collaborators,
    ) -> Self {
        let this = Self {
            state: AppState::empty(),
            rev: 0,
            update_sender,
            engine: EngineLifecycle::new(collaborators.engine_factory, core_sender.clone()),
            core_sender,
            shared_state,
            config,
            runtime,
            signaling: collaborators.signaling,
            tokens: collaborators.tokens,
            session: None,
            cleanup: CleanupState::Clean,
            next_seq: 0,
            timers: SessionTimers::default(),
        };

        // Ensure FfiApp.state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn emit_call_closed(&mut self, call_id: String, reason: String, duration_secs: u64) {
        let rev = self.next_rev();
        // Keep snapshot rev in sync with the update stream.
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::CallClosed {
            rev,
            call_id,
            reason,
            duration_secs,
        });
    }

    /// Mirror the session into `state.active_call` and emit.
    fn publish_call(&mut self) {
        let closing = self.cleanup.in_flight();
        self.state.active_call = self.session.as_ref().map(|s| s.snapshot(closing));
        self.emit_state();
    }

    fn toast(&mut self, msg: impl Into<String>) {
        // Stays in state until the UI clears it.
        self.state.toast = Some(msg.into());
        self.emit_state();
    }

    pub(crate) fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(action) => {
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action);
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            // Session
            AppAction::PlaceCall {
                call_id,
                channel_id,
                caller_name,
                callee_name,
            } => self.handle_place_call_action(call_id, channel_id, caller_name, callee_name),
            AppAction::StartSession {
                call_id,
                channel_id,
                role,
            } => self.handle_start_session_action(call_id, channel_id, role),
            AppAction::AcceptCall { call_id } => self.handle_accept_call_action(&call_id),
            AppAction::DeclineCall { call_id } => self.handle_decline_call_action(&call_id),
            AppAction::EndSession => self.handle_end_session_action(),

            // In-call controls
            AppAction::ToggleMute => self.handle_toggle_mute_action(),
            AppAction::ToggleSpeaker => self.handle_toggle_speaker_action(),

            // UI
            AppAction::ClearToast => {
                if self.state.toast.take().is_some() {
                    self.emit_state();
                }
            }
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::Engine { generation, event } => {
                self.handle_engine_event(generation, event)
            }
            InternalEvent::SignalingSnapshot { call_id, document } => {
                self.handle_signaling_snapshot(call_id, document)
            }
            InternalEvent::TokenFetched { seq, result } => self.handle_token_fetched(seq, result),
            InternalEvent::CleanupFinished { seq, report } => {
                self.handle_cleanup_finished(seq, report)
            }
            InternalEvent::DebounceElapsed { token } => self.handle_debounce_elapsed(token),
            InternalEvent::RingTimeoutElapsed { token } => self.handle_ring_timeout(token),
            InternalEvent::DurationTick { token } => self.handle_duration_tick(token),
            InternalEvent::AudioUnmuteDue { token } => self.handle_audio_unmute_due(token),
        }
    }
}
