use huddle_media::EngineError;
use thiserror::Error;

use super::signaling::SignalingError;
use super::token::TokenFetchError;
use crate::state::{SetupFailure, SetupFailureKind};

/// Failures the orchestration distinguishes. Setup-phase variants abort the
/// session; `Cleanup` is only ever logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("media engine could not be created: {0}")]
    EngineCreation(String),

    #[error(transparent)]
    TokenFetch(#[from] TokenFetchError),

    #[error("joining channel failed with code {code}: {message}")]
    EngineJoin { code: i32, message: String },

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("cleanup step `{step}` failed: {message}")]
    Cleanup { step: &'static str, message: String },
}

impl CallError {
    pub(super) fn from_engine_setup(err: EngineError) -> Self {
        match err {
            EngineError::PermissionDenied(msg) => CallError::PermissionDenied(msg),
            other => CallError::EngineCreation(other.to_string()),
        }
    }

    pub(super) fn from_engine_join(err: EngineError) -> Self {
        match err {
            EngineError::PermissionDenied(msg) => CallError::PermissionDenied(msg),
            other => CallError::EngineJoin {
                code: other.code().unwrap_or(-1),
                message: other.to_string(),
            },
        }
    }

    pub(super) fn cleanup(step: &'static str, err: impl std::fmt::Display) -> Self {
        CallError::Cleanup {
            step,
            message: err.to_string(),
        }
    }

    /// UI-facing description of a setup failure. `None` for errors that never
    /// abort setup.
    pub(super) fn setup_failure(&self) -> Option<SetupFailure> {
        let (kind, http_status, retryable) = match self {
            CallError::PermissionDenied(_) => (SetupFailureKind::PermissionDenied, None, false),
            CallError::EngineCreation(_) => (SetupFailureKind::EngineCreation, None, true),
            CallError::TokenFetch(e) => (SetupFailureKind::TokenFetch, e.http_status, true),
            CallError::EngineJoin { .. } => (SetupFailureKind::EngineJoin, None, true),
            CallError::Signaling(_) => (SetupFailureKind::Signaling, None, true),
            CallError::Cleanup { .. } => return None,
        };
        Some(SetupFailure {
            kind,
            message: self.to_string(),
            http_status,
            retryable,
        })
    }
}
