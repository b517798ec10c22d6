use huddle_media::EngineEvent;

use crate::core::cleanup::TeardownReport;
use crate::core::signaling::CallDocument;
use crate::core::token::{SessionToken, TokenFetchError};
use crate::state::AppState;
use crate::AppAction;

#[derive(uniffi::Enum, Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
    /// Cleanup finished and the session is gone; the UI can leave the call screen.
    CallClosed {
        rev: u64,
        call_id: String,
        reason: String,
        duration_secs: u64,
    },
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
            AppUpdate::CallClosed { rev, .. } => *rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

#[derive(Debug)]
pub enum InternalEvent {
    // Engine callbacks, tagged with the engine instance that raised them.
    Engine {
        generation: u64,
        event: EngineEvent,
    },

    // Live query on the signaling document. `None` means the document is gone.
    SignalingSnapshot {
        call_id: String,
        document: Option<CallDocument>,
    },

    // Async results
    TokenFetched {
        seq: u64,
        result: Result<SessionToken, TokenFetchError>,
    },
    CleanupFinished {
        seq: u64,
        report: TeardownReport,
    },

    // Timers. `token` identifies the arming that produced the event.
    DebounceElapsed {
        token: u64,
    },
    RingTimeoutElapsed {
        token: u64,
    },
    DurationTick {
        token: u64,
    },
    AudioUnmuteDue {
        token: u64,
    },
}
