#[derive(uniffi::Record, Clone, Debug)]
pub struct AppState {
    pub rev: u64,
    pub active_call: Option<CallState>,
    /// Last session setup failure, kept until the next session starts so the UI
    /// can offer a retry.
    pub setup_error: Option<SetupFailure>,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            active_call: None,
            setup_error: None,
            toast: None,
        }
    }
}

#[derive(uniffi::Record, Clone, Debug, PartialEq)]
pub struct CallState {
    pub call_id: String,
    pub channel_id: String,
    pub role: CallRole,
    pub peer_name: Option<String>,
    pub phase: CallPhase,
    pub engine_phase: EnginePhase,
    pub signaling_phase: Option<SignalingPhase>,
    pub local_uid: u32,
    pub remote_uid: Option<u32>,
    /// Unix seconds at which the call first became connected.
    pub started_at: Option<i64>,
    pub duration_secs: u64,
    pub is_muted: bool,
    pub is_speaker_on: bool,
    /// Teardown is running; the call screen should stop accepting input.
    pub is_closing: bool,
}

#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// The single call state shown to the user. Derived from the engine and
/// signaling phases; it only moves forward.
#[derive(uniffi::Enum, Clone, Debug, PartialEq, Eq)]
pub enum CallPhase {
    Connecting,
    Connected,
    Ended { reason: String },
}

impl CallPhase {
    fn rank(&self) -> u8 {
        match self {
            CallPhase::Connecting => 0,
            CallPhase::Connected => 1,
            CallPhase::Ended { .. } => 2,
        }
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, CallPhase::Ended { .. })
    }

    /// Returns the later of `self` and `next`. An `Ended` phase keeps its
    /// original reason.
    pub fn advance(&self, next: CallPhase) -> CallPhase {
        if next.rank() > self.rank() {
            next
        } else {
            self.clone()
        }
    }
}

#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Initializing,
    Joining,
    Joined,
    Leaving,
    Released,
}

impl EnginePhase {
    /// Phases in which the process-wide engine is held by a session.
    pub fn holds_engine(&self) -> bool {
        matches!(
            self,
            EnginePhase::Initializing
                | EnginePhase::Joining
                | EnginePhase::Joined
                | EnginePhase::Leaving
        )
    }
}

#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingPhase {
    Ringing,
    Accepted,
    Ended,
    Declined,
}

impl SignalingPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SignalingPhase::Ended | SignalingPhase::Declined)
    }
}

#[derive(uniffi::Enum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupFailureKind {
    PermissionDenied,
    EngineCreation,
    TokenFetch,
    EngineJoin,
    Signaling,
}

#[derive(uniffi::Record, Clone, Debug, PartialEq, Eq)]
pub struct SetupFailure {
    pub kind: SetupFailureKind,
    pub message: String,
    pub http_status: Option<u16>,
    pub retryable: bool,
}

pub(crate) fn now_seconds() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
