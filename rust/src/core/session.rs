// Per-call bookkeeping and the phase merge rule.

use tokio::time::Instant;

use super::cleanup::CleanupTrigger;
use super::signaling::SubscriptionId;
use crate::state::{CallPhase, CallRole, CallState, EnginePhase, SignalingPhase};

/// `Connected` only when the local engine has joined and the remote side has
/// accepted; `Ended` as soon as either source says the call is over.
pub(super) fn merge_call_phase(engine: EnginePhase, signaling: Option<SignalingPhase>) -> CallPhase {
    match (engine, signaling) {
        (_, Some(SignalingPhase::Declined)) => CallPhase::Ended {
            reason: CleanupTrigger::Declined.reason().to_string(),
        },
        (_, Some(SignalingPhase::Ended)) => CallPhase::Ended {
            reason: CleanupTrigger::RemoteEnded.reason().to_string(),
        },
        (EnginePhase::Leaving | EnginePhase::Released, _) => CallPhase::Ended {
            reason: CleanupTrigger::EngineLeft.reason().to_string(),
        },
        (EnginePhase::Joined, Some(SignalingPhase::Accepted)) => CallPhase::Connected,
        _ => CallPhase::Connecting,
    }
}

/// Engine-driven changes waiting for the debounce to elapse.
#[derive(Debug, Default)]
pub(super) struct PendingEngineUpdate {
    pub engine_phase: Option<EnginePhase>,
    // `Some(None)` clears the remote uid.
    pub remote_uid: Option<Option<u32>>,
}

impl PendingEngineUpdate {
    pub(super) fn is_empty(&self) -> bool {
        self.engine_phase.is_none() && self.remote_uid.is_none()
    }
}

#[derive(Debug)]
pub(super) struct CallSession {
    pub seq: u64,
    pub call_id: String,
    pub channel_id: String,
    pub role: CallRole,
    pub peer_name: Option<String>,
    pub local_uid: u32,
    pub remote_uid: Option<u32>,
    pub engine_phase: EnginePhase,
    pub signaling_phase: Option<SignalingPhase>,
    pub call_phase: CallPhase,
    pub started_at: Option<i64>,
    pub connected_at: Option<Instant>,
    pub duration_secs: u64,
    pub is_muted: bool,
    pub is_speaker_on: bool,
    pub ring_timer_armed: bool,
    pub audio_open: bool,
    pub subscription: Option<SubscriptionId>,
    pub pending: PendingEngineUpdate,
}

impl CallSession {
    pub(super) fn new(
        seq: u64,
        call_id: String,
        channel_id: String,
        role: CallRole,
        local_uid: u32,
        speakerphone: bool,
    ) -> Self {
        Self {
            seq,
            call_id,
            channel_id,
            role,
            peer_name: None,
            local_uid,
            remote_uid: None,
            engine_phase: EnginePhase::Idle,
            signaling_phase: None,
            call_phase: CallPhase::Connecting,
            started_at: None,
            connected_at: None,
            duration_secs: 0,
            is_muted: false,
            is_speaker_on: speakerphone,
            ring_timer_armed: false,
            audio_open: false,
            subscription: None,
            pending: PendingEngineUpdate::default(),
        }
    }

    /// Remote uid as it will be once pending engine updates are applied.
    pub(super) fn known_remote_uid(&self) -> Option<u32> {
        match self.pending.remote_uid {
            Some(uid) => uid,
            None => self.remote_uid,
        }
    }

    pub(super) fn fold_pending(&mut self) -> bool {
        let pending = std::mem::take(&mut self.pending);
        let mut changed = false;
        if let Some(phase) = pending.engine_phase {
            changed |= self.engine_phase != phase;
            self.engine_phase = phase;
        }
        if let Some(uid) = pending.remote_uid {
            changed |= self.remote_uid != uid;
            self.remote_uid = uid;
        }
        changed
    }

    /// Re-derive `call_phase`. Returns true exactly once per session: when the
    /// call becomes connected for the first time.
    pub(super) fn recompute(&mut self, now_unix: i64, now: Instant) -> bool {
        let merged = merge_call_phase(self.engine_phase, self.signaling_phase);
        self.call_phase = self.call_phase.advance(merged);
        if self.call_phase == CallPhase::Connected && self.started_at.is_none() {
            self.started_at = Some(now_unix);
            self.connected_at = Some(now);
            return true;
        }
        false
    }

    pub(super) fn end(&mut self, reason: &str) {
        self.call_phase = self.call_phase.advance(CallPhase::Ended {
            reason: reason.to_string(),
        });
    }

    pub(super) fn end_reason(&self) -> String {
        match &self.call_phase {
            CallPhase::Ended { reason } => reason.clone(),
            _ => String::new(),
        }
    }

    pub(super) fn refresh_duration(&mut self, now: Instant) -> bool {
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let secs = now.saturating_duration_since(connected_at).as_secs();
        if secs == self.duration_secs {
            return false;
        }
        self.duration_secs = secs;
        true
    }

    pub(super) fn snapshot(&self, is_closing: bool) -> CallState {
        CallState {
            call_id: self.call_id.clone(),
            channel_id: self.channel_id.clone(),
            role: self.role,
            peer_name: self.peer_name.clone(),
            phase: self.call_phase.clone(),
            engine_phase: self.engine_phase,
            signaling_phase: self.signaling_phase,
            local_uid: self.local_uid,
            remote_uid: self.remote_uid,
            started_at: self.started_at,
            duration_secs: self.duration_secs,
            is_muted: self.is_muted,
            is_speaker_on: self.is_speaker_on,
            is_closing,
        }
    }
}
