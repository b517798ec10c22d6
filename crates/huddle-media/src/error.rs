use thiserror::Error;

/// Integer result codes reported by the engine SDK. Engine calls return `0` on
/// success and the negated code on failure.
pub mod codes {
    pub const OK: i32 = 0;
    pub const ERR_NOT_INITIALIZED: i32 = 7;
    pub const ERR_NO_PERMISSION: i32 = 9;
    /// Join rejected because the engine is already joining or inside a channel.
    pub const ERR_JOIN_CHANNEL_REJECTED: i32 = 17;
    pub const ERR_LEAVE_CHANNEL_REJECTED: i32 = 18;
    pub const ERR_INVALID_TOKEN: i32 = 110;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Microphone (or proximity sensor) access was refused by the platform.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("media engine is not initialized")]
    NotInitialized,

    #[error("media engine has been released")]
    Released,

    #[error("engine call `{op}` failed with code {code}")]
    Api { op: &'static str, code: i32 },
}

impl EngineError {
    /// Map an SDK return value to a `Result`. Negative and positive non-zero values
    /// are both treated as failures; the stored code is always positive.
    pub fn check(op: &'static str, ret: i32) -> Result<(), EngineError> {
        if ret == codes::OK {
            return Ok(());
        }
        let code = ret.saturating_abs();
        match code {
            codes::ERR_NO_PERMISSION => Err(EngineError::PermissionDenied(format!(
                "{op} refused by platform"
            ))),
            codes::ERR_NOT_INITIALIZED => Err(EngineError::NotInitialized),
            _ => Err(EngineError::Api { op, code }),
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            EngineError::PermissionDenied(_) => Some(codes::ERR_NO_PERMISSION),
            EngineError::NotInitialized => Some(codes::ERR_NOT_INITIALIZED),
            EngineError::Released => None,
            EngineError::Api { code, .. } => Some(*code),
        }
    }

    /// The engine refused a join because a previous join is still in progress.
    /// The pending join will complete on its own.
    pub fn is_join_in_progress(&self) -> bool {
        matches!(
            self,
            EngineError::Api {
                code: codes::ERR_JOIN_CHANNEL_REJECTED,
                ..
            }
        )
    }
}
