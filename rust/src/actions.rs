use crate::state::CallRole;

#[derive(uniffi::Enum, Debug, Clone)]
pub enum AppAction {
    // Session
    PlaceCall {
        call_id: String,
        channel_id: String,
        caller_name: String,
        callee_name: String,
    },
    StartSession {
        call_id: String,
        channel_id: String,
        role: CallRole,
    },
    AcceptCall {
        call_id: String,
    },
    DeclineCall {
        call_id: String,
    },
    EndSession,

    // In-call controls
    ToggleMute,
    ToggleSpeaker,

    // UI
    ClearToast,
}

impl AppAction {
    /// Log-safe action tag.
    pub fn tag(&self) -> &'static str {
        match self {
            // Session
            AppAction::PlaceCall { .. } => "PlaceCall",
            AppAction::StartSession { .. } => "StartSession",
            AppAction::AcceptCall { .. } => "AcceptCall",
            AppAction::DeclineCall { .. } => "DeclineCall",
            AppAction::EndSession => "EndSession",

            // In-call controls
            AppAction::ToggleMute => "ToggleMute",
            AppAction::ToggleSpeaker => "ToggleSpeaker",

            // UI
            AppAction::ClearToast => "ClearToast",
        }
    }
}
