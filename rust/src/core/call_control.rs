// Call actions: starting, answering and hanging up a session, plus in-call controls.

use rand::Rng;

use super::cleanup::CleanupTrigger;
use super::signaling::{CallDocument, CallDocumentUpdate, SignalingStatus};
use super::token::{SessionToken, TokenFetchError};
use super::*;

impl CallSessionManager {
    fn session_start_blocked(&mut self) -> bool {
        if self.cleanup.in_flight() {
            self.toast("Previous call is still ending");
            return true;
        }
        if self.session.is_some() {
            self.toast("Already in a call");
            return true;
        }
        false
    }

    pub(super) fn handle_place_call_action(
        &mut self,
        call_id: String,
        channel_id: String,
        caller_name: String,
        callee_name: String,
    ) {
        if self.session_start_blocked() {
            return;
        }
        if call_id.trim().is_empty() || channel_id.trim().is_empty() {
            self.toast("Call id and channel are required");
            return;
        }
        self.open_session(call_id.clone(), channel_id.clone(), CallRole::Caller);
        if let Some(sess) = self.session.as_mut() {
            sess.peer_name = Some(callee_name.clone()).filter(|n| !n.is_empty());
        }
        if !self.subscribe_signaling() {
            return;
        }
        let doc = CallDocument::ringing(&channel_id, &caller_name, &callee_name);
        if let Err(e) = self.signaling.create_call(&call_id, &doc) {
            self.fail_setup(e.into());
            return;
        }
        // Our own write; the echoed snapshot is a duplicate.
        self.apply_signaling_phase(SignalingPhase::Ringing);
        self.start_engine();
    }

    pub(super) fn handle_start_session_action(
        &mut self,
        call_id: String,
        channel_id: String,
        role: CallRole,
    ) {
        if self.session_start_blocked() {
            return;
        }
        if call_id.trim().is_empty() || channel_id.trim().is_empty() {
            self.toast("Call id and channel are required");
            return;
        }
        self.open_session(call_id, channel_id, role);
        if !self.subscribe_signaling() {
            return;
        }
        self.start_engine();
    }

    fn open_session(&mut self, call_id: String, channel_id: String, role: CallRole) {
        self.next_seq += 1;
        // Positive i32 range keeps the uid valid for SDKs that use signed ids.
        let local_uid = rand::thread_rng().gen_range(1..=i32::MAX as u32);
        tracing::info!(%call_id, %channel_id, ?role, seq = self.next_seq, local_uid, "call: session opened");
        self.state.setup_error = None;
        self.session = Some(CallSession::new(
            self.next_seq,
            call_id,
            channel_id,
            role,
            local_uid,
            self.config.default_speakerphone(),
        ));
        self.publish_call();
    }

    fn subscribe_signaling(&mut self) -> bool {
        let Some(call_id) = self.session.as_ref().map(|s| s.call_id.clone()) else {
            return false;
        };
        match self.signaling.subscribe(&call_id, self.core_sender.clone()) {
            Ok(id) => {
                if let Some(sess) = self.session.as_mut() {
                    sess.subscription = Some(id);
                }
                true
            }
            Err(e) => {
                self.fail_setup(e.into());
                false
            }
        }
    }

    fn start_engine(&mut self) {
        let app_id = self.config.app_id();
        let speakerphone = self.config.default_speakerphone();
        let setup = self
            .engine
            .ensure_engine()
            .and_then(|_| self.engine.initialize_once(&app_id, speakerphone));
        if let Err(e) = setup {
            self.fail_setup(e);
            return;
        }

        let Some(sess) = self.session.as_mut() else {
            return;
        };
        sess.engine_phase = EnginePhase::Initializing;
        let seq = sess.seq;
        let channel_id = sess.channel_id.clone();
        let uid = sess.local_uid;
        self.publish_call();

        let tokens = self.tokens.clone();
        let tx = self.core_sender.clone();
        let timeout = self.config.token_timeout();
        self.runtime.spawn(async move {
            let result =
                match tokio::time::timeout(timeout, tokens.fetch_token(&channel_id, uid)).await {
                    Ok(result) => result,
                    Err(_) => Err(TokenFetchError {
                        http_status: None,
                        message: format!("timed out after {}ms", timeout.as_millis()),
                    }),
                };
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::TokenFetched {
                seq,
                result,
            })));
        });
    }

    pub(super) fn handle_token_fetched(
        &mut self,
        seq: u64,
        result: Result<SessionToken, TokenFetchError>,
    ) {
        if self.cleanup.in_flight() {
            tracing::debug!(seq, "token: result during cleanup dropped");
            return;
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if sess.seq != seq {
            tracing::debug!(seq, current = sess.seq, "token: stale result dropped");
            return;
        }
        let token = match result {
            Ok(token) => token,
            Err(e) => {
                self.fail_setup(e.into());
                return;
            }
        };
        let Some(engine) = self.engine.handle() else {
            self.fail_setup(CallError::EngineCreation(
                "engine released before join".to_string(),
            ));
            return;
        };

        sess.engine_phase = EnginePhase::Joining;
        let call_id = sess.call_id.clone();
        let channel_id = sess.channel_id.clone();
        let uid = sess.local_uid;
        self.publish_call();

        tracing::info!(%call_id, %channel_id, uid, "engine: joining");
        match engine.join_channel(&token.token, &channel_id, uid) {
            Ok(()) => {}
            Err(e) if e.is_join_in_progress() => {
                // The engine is already transitioning; let the connection settle.
                tracing::info!(%call_id, %e, "engine: join already in progress");
            }
            Err(e) => self.fail_setup(CallError::from_engine_join(e)),
        }
    }

    pub(super) fn handle_accept_call_action(&mut self, call_id: &str) {
        if self.cleanup.in_flight() {
            return;
        }
        let Some(sess) = self.session.as_ref() else {
            self.toast("No call to accept");
            return;
        };
        if sess.call_id != call_id {
            self.toast("Call not found");
            return;
        }
        if sess.role != CallRole::Callee {
            tracing::warn!(call_id, "accept: only the callee can accept");
            return;
        }
        if sess.signaling_phase != Some(SignalingPhase::Ringing) {
            return;
        }
        let update = CallDocumentUpdate::status(SignalingStatus::Accepted);
        if let Err(e) = self.signaling.update_call(call_id, &update) {
            tracing::warn!(call_id, %e, "accept: write failed");
            self.toast(format!("Accept failed: {e}"));
            return;
        }
        self.apply_signaling_phase(SignalingPhase::Accepted);
    }

    pub(super) fn handle_decline_call_action(&mut self, call_id: &str) {
        let update = CallDocumentUpdate::status(SignalingStatus::Declined);
        let active_role = self
            .session
            .as_ref()
            .filter(|s| s.call_id == call_id)
            .map(|s| s.role);

        match active_role {
            Some(CallRole::Callee) => {
                if self.cleanup.in_flight() {
                    return;
                }
                if let Err(e) = self.signaling.update_call(call_id, &update) {
                    tracing::warn!(call_id, %e, "decline: write failed");
                }
                self.begin_cleanup(CleanupTrigger::Declined);
            }
            Some(CallRole::Caller) => {
                tracing::warn!(call_id, "decline: caller must end the call instead");
            }
            None => {
                // Declined from the incoming-call screen before any session started.
                if let Err(e) = self.signaling.update_call(call_id, &update) {
                    tracing::warn!(call_id, %e, "decline: write failed");
                    self.toast(format!("Decline failed: {e}"));
                }
            }
        }
    }

    pub(super) fn handle_end_session_action(&mut self) {
        if self.cleanup.in_flight() {
            tracing::debug!("end: cleanup already running");
            return;
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        sess.refresh_duration(Instant::now());
        let duration = sess.started_at.map(|_| sess.duration_secs);
        let call_id = sess.call_id.clone();
        let update = CallDocumentUpdate::ended(now_seconds(), duration);
        if let Err(e) = self.signaling.update_call(&call_id, &update) {
            tracing::warn!(%call_id, %e, "end: write failed");
        }
        self.begin_cleanup(CleanupTrigger::UserHangup);
    }

    pub(super) fn handle_toggle_mute_action(&mut self) {
        if self.cleanup.in_flight() {
            return;
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        sess.is_muted = !sess.is_muted;
        // Before audio opens the engine stays muted; the flag is applied on open.
        if sess.audio_open {
            if let Some(engine) = self.engine.handle() {
                if let Err(e) = engine.mute_local_audio_stream(sess.is_muted) {
                    tracing::warn!(call_id = %sess.call_id, %e, "audio: mute toggle failed");
                }
            }
        }
        self.publish_call();
    }

    pub(super) fn handle_toggle_speaker_action(&mut self) {
        if self.cleanup.in_flight() {
            return;
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        sess.is_speaker_on = !sess.is_speaker_on;
        if let Some(engine) = self.engine.handle() {
            if let Err(e) = engine.set_enable_speakerphone(sess.is_speaker_on) {
                tracing::warn!(call_id = %sess.call_id, %e, "audio: speaker toggle failed");
            }
        }
        self.publish_call();
    }

    /// Aborts the session after a setup error. The caller's document is marked
    /// ended so the callee stops ringing.
    pub(super) fn fail_setup(&mut self, err: CallError) {
        tracing::warn!(%err, "call: setup failed");
        self.state.setup_error = err.setup_failure();
        self.state.toast = Some(match &err {
            CallError::PermissionDenied(_) => {
                "Microphone permission is required for calls".to_string()
            }
            _ => format!("Call setup failed: {err}"),
        });

        let created_by_us = self
            .session
            .as_ref()
            .filter(|s| s.role == CallRole::Caller && s.signaling_phase.is_some())
            .map(|s| s.call_id.clone());
        if let Some(call_id) = created_by_us {
            let update = CallDocumentUpdate::ended(now_seconds(), None);
            if let Err(e) = self.signaling.update_call(&call_id, &update) {
                tracing::warn!(%call_id, %e, "call: marking failed call ended failed");
            }
        }

        if !self.begin_cleanup(CleanupTrigger::SetupFailed) {
            self.emit_state();
        }
    }
}
