/// Membership and connection callbacks emitted by the media engine.
///
/// Events arrive on the engine's own schedule and are not ordered with respect
/// to anything the application does, including its own calls into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    JoinChannelSuccess {
        channel_id: String,
        uid: u32,
        elapsed_ms: u32,
    },
    UserJoined {
        uid: u32,
        elapsed_ms: u32,
    },
    UserOffline {
        uid: u32,
        reason: UserOfflineReason,
    },
    LeaveChannel {
        duration_secs: u32,
    },
    ConnectionStateChanged {
        state: ConnectionState,
        reason: ConnectionChangeReason,
    },
    Error {
        code: i32,
        message: String,
    },
    TokenPrivilegeWillExpire {
        token: String,
    },
}

impl EngineEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            EngineEvent::JoinChannelSuccess { .. } => "JoinChannelSuccess",
            EngineEvent::UserJoined { .. } => "UserJoined",
            EngineEvent::UserOffline { .. } => "UserOffline",
            EngineEvent::LeaveChannel { .. } => "LeaveChannel",
            EngineEvent::ConnectionStateChanged { .. } => "ConnectionStateChanged",
            EngineEvent::Error { .. } => "Error",
            EngineEvent::TokenPrivilegeWillExpire { .. } => "TokenPrivilegeWillExpire",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOfflineReason {
    /// The remote user left the channel on purpose.
    Quit,
    /// No packets from the remote user for a while; they may come back.
    Dropped,
    BecomeAudience,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionChangeReason {
    Connecting,
    JoinSuccess,
    Interrupted,
    BannedByServer,
    JoinFailed,
    LeaveChannel,
    InvalidToken,
    TokenExpired,
    Lost,
    Other,
}
