// Folding engine callbacks and signaling snapshots into the call phase.

use huddle_media::{codes, ConnectionState, UserOfflineReason};

use super::cleanup::CleanupTrigger;
use super::signaling::CallDocument;
use super::*;

impl CallSessionManager {
    pub(super) fn handle_engine_event(&mut self, generation: u64, event: EngineEvent) {
        if generation != self.engine.generation() || self.engine.handle().is_none() {
            tracing::debug!(generation, event = event.tag(), "engine: stale event dropped");
            return;
        }
        if self.cleanup.in_flight() {
            tracing::debug!(event = event.tag(), "engine: event during cleanup dropped");
            return;
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };

        match event {
            EngineEvent::JoinChannelSuccess {
                channel_id,
                uid,
                elapsed_ms,
            } => {
                tracing::info!(call_id = %sess.call_id, %channel_id, uid, elapsed_ms, "engine: joined");
                sess.pending.engine_phase = Some(EnginePhase::Joined);
                self.arm_debounce();
            }
            EngineEvent::UserJoined { uid, .. } => {
                if uid == sess.local_uid {
                    return;
                }
                match sess.known_remote_uid() {
                    None => {
                        tracing::info!(call_id = %sess.call_id, uid, "engine: peer joined");
                        sess.pending.remote_uid = Some(Some(uid));
                        self.arm_debounce();
                    }
                    Some(existing) if existing != uid => {
                        tracing::warn!(call_id = %sess.call_id, uid, existing, "engine: extra participant ignored");
                    }
                    Some(_) => {}
                }
            }
            EngineEvent::UserOffline { uid, reason } => {
                if sess.known_remote_uid() != Some(uid) {
                    return;
                }
                tracing::info!(call_id = %sess.call_id, uid, ?reason, "engine: peer offline");
                if reason == UserOfflineReason::Quit {
                    self.begin_cleanup(CleanupTrigger::PeerLeft);
                } else {
                    sess.pending.remote_uid = Some(None);
                    self.arm_debounce();
                }
            }
            EngineEvent::LeaveChannel { duration_secs } => {
                tracing::warn!(call_id = %sess.call_id, duration_secs, "engine: left channel unexpectedly");
                self.begin_cleanup(CleanupTrigger::EngineLeft);
            }
            EngineEvent::ConnectionStateChanged { state, reason } => {
                if state == ConnectionState::Failed {
                    tracing::warn!(call_id = %sess.call_id, ?reason, "engine: connection failed");
                    self.begin_cleanup(CleanupTrigger::ConnectionFailed);
                } else {
                    tracing::debug!(call_id = %sess.call_id, ?state, ?reason, "engine: connection state");
                }
            }
            EngineEvent::Error { code, message } => {
                let joining = matches!(
                    sess.engine_phase,
                    EnginePhase::Idle | EnginePhase::Initializing | EnginePhase::Joining
                ) && sess.pending.engine_phase != Some(EnginePhase::Joined);
                if code == codes::ERR_JOIN_CHANNEL_REJECTED {
                    tracing::info!(call_id = %sess.call_id, code, "engine: join already in progress");
                } else if joining {
                    tracing::warn!(call_id = %sess.call_id, code, %message, "engine: join error");
                    self.fail_setup(CallError::EngineJoin { code, message });
                } else {
                    tracing::warn!(call_id = %sess.call_id, code, %message, "engine: error");
                }
            }
            EngineEvent::TokenPrivilegeWillExpire { .. } => {
                tracing::warn!(call_id = %sess.call_id, "engine: token about to expire");
                self.toast("Call credentials are about to expire");
            }
        }
    }

    fn arm_debounce(&mut self) {
        let delay = self.config.debounce();
        self.timers
            .debounce
            .arm(&self.runtime, delay, self.core_sender.clone(), |token| {
                InternalEvent::DebounceElapsed { token }
            });
    }

    pub(super) fn handle_debounce_elapsed(&mut self, token: u64) {
        if !self.timers.debounce.accept(token) || self.cleanup.in_flight() {
            return;
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let changed = sess.fold_pending();
        let connected_now = sess.recompute(now_seconds(), Instant::now());
        if connected_now {
            self.on_first_connected();
        }
        if changed || connected_now {
            self.publish_call();
        }
    }

    pub(super) fn handle_signaling_snapshot(
        &mut self,
        call_id: String,
        document: Option<CallDocument>,
    ) {
        if self.cleanup.in_flight() {
            tracing::debug!(%call_id, "signaling: snapshot during cleanup dropped");
            return;
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if sess.call_id != call_id {
            tracing::debug!(%call_id, "signaling: snapshot for other call dropped");
            return;
        }
        let Some(doc) = document else {
            tracing::info!(%call_id, "signaling: call document removed");
            self.begin_cleanup(CleanupTrigger::CallRemoved);
            return;
        };
        if doc.channel_id != sess.channel_id {
            tracing::warn!(%call_id, doc_channel = %doc.channel_id, "signaling: channel mismatch");
        }
        if sess.peer_name.is_none() {
            let name = match sess.role {
                CallRole::Caller => &doc.callee_name,
                CallRole::Callee => &doc.caller_name,
            };
            if !name.is_empty() {
                sess.peer_name = Some(name.clone());
            }
        }
        self.apply_signaling_phase(doc.status.into());
    }

    /// Applies a remote status immediately; no debounce on this side.
    pub(super) fn apply_signaling_phase(&mut self, phase: SignalingPhase) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if sess.signaling_phase == Some(SignalingPhase::Accepted) && phase == SignalingPhase::Ringing
        {
            return;
        }
        let previous = sess.signaling_phase.replace(phase);
        tracing::debug!(call_id = %sess.call_id, ?previous, ?phase, "signaling: phase");

        match phase {
            SignalingPhase::Ringing => {
                if !sess.ring_timer_armed {
                    sess.ring_timer_armed = true;
                    self.arm_ring_timeout();
                }
            }
            SignalingPhase::Accepted => self.timers.ring.cancel(),
            SignalingPhase::Ended => {
                self.begin_cleanup(CleanupTrigger::RemoteEnded);
                return;
            }
            SignalingPhase::Declined => {
                self.begin_cleanup(CleanupTrigger::Declined);
                return;
            }
        }

        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if sess.recompute(now_seconds(), Instant::now()) {
            self.on_first_connected();
        }
        if previous != Some(phase) {
            self.publish_call();
        }
    }

    fn on_first_connected(&mut self) {
        if let Some(sess) = self.session.as_ref() {
            tracing::info!(call_id = %sess.call_id, seq = sess.seq, "call: connected");
        }
        let tx = self.core_sender.clone();
        self.timers.tick.start(
            &self.runtime,
            self.config.duration_tick(),
            tx.clone(),
            |token| InternalEvent::DurationTick { token },
        );
        self.timers.unmute.arm(
            &self.runtime,
            self.config.audio_unmute_delay(),
            tx,
            |token| InternalEvent::AudioUnmuteDue { token },
        );
    }

    pub(super) fn handle_duration_tick(&mut self, token: u64) {
        if !self.timers.tick.accept(token) || self.cleanup.in_flight() {
            return;
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if sess.refresh_duration(Instant::now()) {
            self.publish_call();
        }
    }

    /// Opens audio once the call has been connected for the settle delay.
    pub(super) fn handle_audio_unmute_due(&mut self, token: u64) {
        if !self.timers.unmute.accept(token) || self.cleanup.in_flight() {
            return;
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        if sess.call_phase != CallPhase::Connected {
            return;
        }
        let Some(engine) = self.engine.handle() else {
            return;
        };
        if let Err(e) = engine.mute_all_remote_audio_streams(false) {
            tracing::warn!(call_id = %sess.call_id, %e, "audio: unmute remote failed");
        }
        if !sess.is_muted {
            if let Err(e) = engine.mute_local_audio_stream(false) {
                tracing::warn!(call_id = %sess.call_id, %e, "audio: unmute local failed");
            }
        }
        sess.audio_open = true;
        tracing::info!(call_id = %sess.call_id, muted = sess.is_muted, "audio: open");
    }
}
