// Platform-supplied media engine and signaling store, plus the in-process
// fallbacks used when the platform has registered neither.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use flume::Sender;
use huddle_media::loopback::{shared_hub, LoopbackEngineFactory};
use huddle_media::{
    ConnectionChangeReason, ConnectionState, EngineError, EngineEvent, EngineEventSink,
    EngineFactory, MediaEngine, UserOfflineReason,
};
use parking_lot::Mutex;

use crate::core::signaling::{
    CallDocument, CallDocumentUpdate, InMemorySignalingStore, SignalingError, SignalingStore,
    SubscriptionId,
};
use crate::updates::CoreMsg;

/// Native voice engine exposed by the app. Every method returns the SDK result
/// code: `0` on success, the (possibly negated) error code otherwise.
#[uniffi::export(callback_interface)]
pub trait PlatformMediaEngine: Send + Sync + 'static {
    /// Creates the native engine. Must return `9` when microphone access is refused.
    fn create(&self) -> i32;
    fn initialize(&self, app_id: String) -> i32;
    fn enable_audio(&self) -> i32;
    fn configure_voice_audio(&self) -> i32;
    fn set_default_audio_route_to_speakerphone(&self, enabled: bool) -> i32;
    fn set_enable_speakerphone(&self, enabled: bool) -> i32;
    fn join_channel(&self, token: String, channel_id: String, uid: u32) -> i32;
    fn leave_channel(&self) -> i32;
    fn mute_local_audio_stream(&self, muted: bool) -> i32;
    fn mute_all_remote_audio_streams(&self, muted: bool) -> i32;
    fn release(&self) -> i32;
}

#[derive(uniffi::Record, Clone, Debug)]
pub struct SignalingWriteResult {
    pub ok: bool,
    /// Set when the call document does not exist (updates) or already exists (creates).
    pub conflict: bool,
    pub error_message: Option<String>,
}

/// Realtime call-document store. Documents travel as JSON; live snapshots are
/// pushed back through `FfiApp::on_signaling_snapshot`.
#[uniffi::export(callback_interface)]
pub trait PlatformSignalingStore: Send + Sync + 'static {
    /// Starts a live query on `call_id` and returns its listener id.
    fn subscribe(&self, call_id: String) -> u64;
    fn unsubscribe(&self, call_id: String, subscription_id: u64);
    fn create_call(&self, call_id: String, document_json: String) -> SignalingWriteResult;
    fn update_call(&self, call_id: String, update_json: String) -> SignalingWriteResult;
}

/// Engine callbacks as delivered by the platform, using the SDK's integer codes
/// for reasons and states.
#[derive(uniffi::Enum, Clone, Debug)]
pub enum EngineEventRecord {
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
        reason: u32,
    },
    LeaveChannel {
        duration_secs: u32,
    },
    ConnectionStateChanged {
        state: u32,
        reason: u32,
    },
    Error {
        code: i32,
        message: String,
    },
    TokenPrivilegeWillExpire {
        token: String,
    },
}

fn offline_reason(code: u32) -> UserOfflineReason {
    match code {
        0 => UserOfflineReason::Quit,
        2 => UserOfflineReason::BecomeAudience,
        _ => UserOfflineReason::Dropped,
    }
}

fn connection_state(code: u32) -> ConnectionState {
    match code {
        2 => ConnectionState::Connecting,
        3 => ConnectionState::Connected,
        4 => ConnectionState::Reconnecting,
        5 => ConnectionState::Failed,
        _ => ConnectionState::Disconnected,
    }
}

fn connection_reason(code: u32) -> ConnectionChangeReason {
    match code {
        0 => ConnectionChangeReason::Connecting,
        1 => ConnectionChangeReason::JoinSuccess,
        2 => ConnectionChangeReason::Interrupted,
        3 => ConnectionChangeReason::BannedByServer,
        4 => ConnectionChangeReason::JoinFailed,
        5 => ConnectionChangeReason::LeaveChannel,
        8 => ConnectionChangeReason::InvalidToken,
        9 => ConnectionChangeReason::TokenExpired,
        14 => ConnectionChangeReason::Lost,
        _ => ConnectionChangeReason::Other,
    }
}

impl From<EngineEventRecord> for EngineEvent {
    fn from(record: EngineEventRecord) -> Self {
        match record {
            EngineEventRecord::JoinChannelSuccess {
                channel_id,
                uid,
                elapsed_ms,
            } => EngineEvent::JoinChannelSuccess {
                channel_id,
                uid,
                elapsed_ms,
            },
            EngineEventRecord::UserJoined { uid, elapsed_ms } => {
                EngineEvent::UserJoined { uid, elapsed_ms }
            }
            EngineEventRecord::UserOffline { uid, reason } => EngineEvent::UserOffline {
                uid,
                reason: offline_reason(reason),
            },
            EngineEventRecord::LeaveChannel { duration_secs } => {
                EngineEvent::LeaveChannel { duration_secs }
            }
            EngineEventRecord::ConnectionStateChanged { state, reason } => {
                EngineEvent::ConnectionStateChanged {
                    state: connection_state(state),
                    reason: connection_reason(reason),
                }
            }
            EngineEventRecord::Error { code, message } => EngineEvent::Error { code, message },
            EngineEventRecord::TokenPrivilegeWillExpire { token } => {
                EngineEvent::TokenPrivilegeWillExpire { token }
            }
        }
    }
}

/// Sink of the engine instance currently owned by the core, if any.
pub type SharedEngineSink = Arc<RwLock<Option<Arc<dyn EngineEventSink>>>>;

fn write_slot<T>(slot: &RwLock<T>, value: T) {
    match slot.write() {
        Ok(mut g) => *g = value,
        Err(poison) => *poison.into_inner() = value,
    }
}

fn read_slot<T: Clone>(slot: &RwLock<T>) -> T {
    match slot.read() {
        Ok(g) => g.clone(),
        Err(poison) => poison.into_inner().clone(),
    }
}

pub(crate) fn forward_engine_event(slot: &SharedEngineSink, event: EngineEvent) {
    match read_slot(slot.as_ref()) {
        Some(sink) => sink.on_event(event),
        None => tracing::debug!(event = event.tag(), "bridge: engine event without engine"),
    }
}

struct PlatformEngine {
    platform: Arc<dyn PlatformMediaEngine>,
    sink: Arc<dyn EngineEventSink>,
    slot: SharedEngineSink,
}

impl MediaEngine for PlatformEngine {
    fn initialize(&self, app_id: &str) -> Result<(), EngineError> {
        EngineError::check("initialize", self.platform.initialize(app_id.to_string()))
    }

    fn enable_audio(&self) -> Result<(), EngineError> {
        EngineError::check("enable_audio", self.platform.enable_audio())
    }

    fn configure_voice_audio(&self) -> Result<(), EngineError> {
        EngineError::check("configure_voice_audio", self.platform.configure_voice_audio())
    }

    fn set_default_audio_route_to_speakerphone(&self, enabled: bool) -> Result<(), EngineError> {
        EngineError::check(
            "set_default_audio_route_to_speakerphone",
            self.platform.set_default_audio_route_to_speakerphone(enabled),
        )
    }

    fn set_enable_speakerphone(&self, enabled: bool) -> Result<(), EngineError> {
        EngineError::check(
            "set_enable_speakerphone",
            self.platform.set_enable_speakerphone(enabled),
        )
    }

    fn join_channel(&self, token: &str, channel_id: &str, uid: u32) -> Result<(), EngineError> {
        EngineError::check(
            "join_channel",
            self.platform
                .join_channel(token.to_string(), channel_id.to_string(), uid),
        )
    }

    fn leave_channel(&self) -> Result<(), EngineError> {
        EngineError::check("leave_channel", self.platform.leave_channel())
    }

    fn mute_local_audio_stream(&self, muted: bool) -> Result<(), EngineError> {
        EngineError::check(
            "mute_local_audio_stream",
            self.platform.mute_local_audio_stream(muted),
        )
    }

    fn mute_all_remote_audio_streams(&self, muted: bool) -> Result<(), EngineError> {
        EngineError::check(
            "mute_all_remote_audio_streams",
            self.platform.mute_all_remote_audio_streams(muted),
        )
    }

    fn release(&self) -> Result<(), EngineError> {
        // Later callbacks belong to no engine.
        let ours = read_slot(self.slot.as_ref()).is_some_and(|s| Arc::ptr_eq(&s, &self.sink));
        if ours {
            write_slot(self.slot.as_ref(), None);
        }
        EngineError::check("release", self.platform.release())
    }
}

/// Picks the engine backend at creation time: a test override, the registered
/// platform engine, or the in-process loopback.
pub(crate) struct SwitchingEngineFactory {
    platform: RwLock<Option<Arc<dyn PlatformMediaEngine>>>,
    override_for_tests: RwLock<Option<Arc<dyn EngineFactory>>>,
    sink_slot: SharedEngineSink,
    prefer_loopback: bool,
    loopback: LoopbackEngineFactory,
}

impl SwitchingEngineFactory {
    pub(crate) fn new(sink_slot: SharedEngineSink, prefer_loopback: bool) -> Self {
        Self {
            platform: RwLock::new(None),
            override_for_tests: RwLock::new(None),
            sink_slot,
            prefer_loopback,
            loopback: LoopbackEngineFactory::new(shared_hub()),
        }
    }

    pub(crate) fn set_platform(&self, platform: Arc<dyn PlatformMediaEngine>) {
        write_slot(&self.platform, Some(platform));
    }

    pub(crate) fn set_override_for_tests(&self, factory: Arc<dyn EngineFactory>) {
        write_slot(&self.override_for_tests, Some(factory));
    }
}

impl EngineFactory for SwitchingEngineFactory {
    fn create(&self, sink: Arc<dyn EngineEventSink>) -> Result<Arc<dyn MediaEngine>, EngineError> {
        if let Some(factory) = read_slot(&self.override_for_tests) {
            return factory.create(sink);
        }
        let platform = read_slot(&self.platform).filter(|_| !self.prefer_loopback);
        let Some(platform) = platform else {
            tracing::info!("engine: using loopback backend");
            return self.loopback.create(sink);
        };

        EngineError::check("create", platform.create())?;
        write_slot(self.sink_slot.as_ref(), Some(sink.clone()));
        Ok(Arc::new(PlatformEngine {
            platform,
            sink,
            slot: self.sink_slot.clone(),
        }))
    }
}

fn write_result(
    call_id: &str,
    result: SignalingWriteResult,
    conflict: fn(String) -> SignalingError,
) -> Result<(), SignalingError> {
    if result.ok {
        return Ok(());
    }
    if result.conflict {
        return Err(conflict(call_id.to_string()));
    }
    Err(SignalingError::Backend(
        result
            .error_message
            .unwrap_or_else(|| "signaling write failed".to_string()),
    ))
}

struct PlatformSignaling {
    platform: Arc<dyn PlatformSignalingStore>,
}

impl SignalingStore for PlatformSignaling {
    fn subscribe(
        &self,
        call_id: &str,
        _tx: Sender<CoreMsg>,
    ) -> Result<SubscriptionId, SignalingError> {
        Ok(self.platform.subscribe(call_id.to_string()))
    }

    fn unsubscribe(&self, call_id: &str, id: SubscriptionId) {
        self.platform.unsubscribe(call_id.to_string(), id);
    }

    fn create_call(&self, call_id: &str, document: &CallDocument) -> Result<(), SignalingError> {
        let json = document.to_json()?;
        let result = self.platform.create_call(call_id.to_string(), json);
        write_result(call_id, result, SignalingError::AlreadyExists)
    }

    fn update_call(
        &self,
        call_id: &str,
        update: &CallDocumentUpdate,
    ) -> Result<(), SignalingError> {
        let json = update.to_json()?;
        let result = self.platform.update_call(call_id.to_string(), json);
        write_result(call_id, result, SignalingError::NotFound)
    }
}

/// Routes to the platform store once one is registered; until then every app
/// in the process shares one in-memory store. A call stays on the backend it
/// subscribed on until it unsubscribes.
pub(crate) struct SwitchingSignalingStore {
    platform: RwLock<Option<Arc<PlatformSignaling>>>,
    fallback: InMemorySignalingStore,
    pinned: Mutex<HashMap<String, Arc<dyn SignalingStore>>>,
}

impl SwitchingSignalingStore {
    pub(crate) fn new() -> Self {
        Self {
            platform: RwLock::new(None),
            fallback: InMemorySignalingStore::shared(),
            pinned: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn set_platform(&self, platform: Arc<dyn PlatformSignalingStore>) {
        write_slot(&self.platform, Some(Arc::new(PlatformSignaling { platform })));
    }

    fn current(&self) -> Arc<dyn SignalingStore> {
        match read_slot(&self.platform) {
            Some(platform) => platform,
            None => Arc::new(self.fallback.clone()),
        }
    }

    fn backend(&self, call_id: &str) -> Arc<dyn SignalingStore> {
        if let Some(pinned) = self.pinned.lock().get(call_id) {
            return pinned.clone();
        }
        self.current()
    }
}

impl SignalingStore for SwitchingSignalingStore {
    fn subscribe(
        &self,
        call_id: &str,
        tx: Sender<CoreMsg>,
    ) -> Result<SubscriptionId, SignalingError> {
        let backend = self.backend(call_id);
        let id = backend.subscribe(call_id, tx)?;
        self.pinned.lock().insert(call_id.to_string(), backend);
        Ok(id)
    }

    fn unsubscribe(&self, call_id: &str, id: SubscriptionId) {
        let backend = self
            .pinned
            .lock()
            .remove(call_id)
            .unwrap_or_else(|| self.current());
        backend.unsubscribe(call_id, id)
    }

    fn create_call(&self, call_id: &str, document: &CallDocument) -> Result<(), SignalingError> {
        self.backend(call_id).create_call(call_id, document)
    }

    fn update_call(
        &self,
        call_id: &str,
        update: &CallDocumentUpdate,
    ) -> Result<(), SignalingError> {
        self.backend(call_id).update_call(call_id, update)
    }
}
