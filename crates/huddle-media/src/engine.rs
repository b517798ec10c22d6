use std::sync::Arc;

use crate::error::EngineError;
use crate::events::EngineEvent;

/// Receives engine callbacks. Implementations must not block: callbacks are
/// delivered from engine-owned threads.
pub trait EngineEventSink: Send + Sync + 'static {
    fn on_event(&self, event: EngineEvent);
}

/// Handle to one created media engine instance.
///
/// Every call is synchronous from the caller's point of view; the outcome of a
/// join or leave is reported later through the [`EngineEventSink`] that was
/// supplied when the engine was created.
///
/// Engines always run the communication channel profile and join as a
/// publishing broadcaster that subscribes to all remote audio.
pub trait MediaEngine: Send + Sync + 'static {
    fn initialize(&self, app_id: &str) -> Result<(), EngineError>;
    fn enable_audio(&self) -> Result<(), EngineError>;
    /// Speech-standard audio profile in the chatroom scenario.
    fn configure_voice_audio(&self) -> Result<(), EngineError>;
    fn set_default_audio_route_to_speakerphone(&self, enabled: bool) -> Result<(), EngineError>;
    fn set_enable_speakerphone(&self, enabled: bool) -> Result<(), EngineError>;
    fn join_channel(&self, token: &str, channel_id: &str, uid: u32) -> Result<(), EngineError>;
    fn leave_channel(&self) -> Result<(), EngineError>;
    fn mute_local_audio_stream(&self, muted: bool) -> Result<(), EngineError>;
    fn mute_all_remote_audio_streams(&self, muted: bool) -> Result<(), EngineError>;
    fn release(&self) -> Result<(), EngineError>;
}

/// Creates engine instances. Creation is where the platform checks microphone
/// (and proximity) permissions, so a refusal surfaces here as
/// [`EngineError::PermissionDenied`].
pub trait EngineFactory: Send + Sync + 'static {
    fn create(&self, sink: Arc<dyn EngineEventSink>) -> Result<Arc<dyn MediaEngine>, EngineError>;
}
