//! In-process engine. Engines created against the same [`LoopbackHub`] and joined
//! to the same channel id observe each other's membership, which is enough to run
//! both ends of a call inside one process.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;

use crate::engine::{EngineEventSink, EngineFactory, MediaEngine};
use crate::error::{codes, EngineError};
use crate::events::{ConnectionChangeReason, ConnectionState, EngineEvent, UserOfflineReason};

/// Every call made against a loopback engine, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOp {
    Create,
    Initialize { app_id: String },
    EnableAudio,
    ConfigureVoiceAudio,
    SetDefaultRouteToSpeakerphone(bool),
    SetEnableSpeakerphone(bool),
    JoinChannel { channel_id: String, uid: u32 },
    LeaveChannel,
    MuteLocalAudio(bool),
    MuteAllRemoteAudio(bool),
    Release,
}

#[derive(Debug, Clone, Default)]
pub struct OpLog {
    ops: Arc<Mutex<Vec<EngineOp>>>,
}

impl OpLog {
    fn record(&self, op: EngineOp) {
        self.ops.lock().push(op);
    }

    pub fn snapshot(&self) -> Vec<EngineOp> {
        self.ops.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&EngineOp) -> bool) -> usize {
        self.ops.lock().iter().filter(|op| pred(op)).count()
    }

    pub fn contains(&self, op: &EngineOp) -> bool {
        self.ops.lock().iter().any(|o| o == op)
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackScript {
    /// Refuse engine creation as if the microphone permission was denied.
    pub deny_permission: bool,
    /// Fail `join_channel` with this SDK code.
    pub join_error_code: Option<i32>,
    /// Deliver callbacks to this engine's sink. When false, tests feed events by hand.
    pub auto_events: bool,
    /// Reject `leave_channel` with `ERR_LEAVE_CHANNEL_REJECTED`.
    pub fail_leave: bool,
    /// Panic inside `release`, after recording it.
    pub panic_on_release: bool,
}

impl Default for LoopbackScript {
    fn default() -> Self {
        Self {
            deny_permission: false,
            join_error_code: None,
            auto_events: true,
            fail_leave: false,
            panic_on_release: false,
        }
    }
}

struct Member {
    engine_id: u64,
    uid: u32,
    auto_events: bool,
    sink: Arc<dyn EngineEventSink>,
}

type Delivery = (Arc<dyn EngineEventSink>, EngineEvent);

#[derive(Default)]
struct HubState {
    next_engine_id: u64,
    channels: HashMap<String, Vec<Member>>,
}

#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl std::fmt::Debug for LoopbackHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackHub")
            .field("channels", &state.channels.len())
            .finish_non_exhaustive()
    }
}

/// Process-wide hub used when the platform has not registered a native engine.
pub fn shared_hub() -> LoopbackHub {
    static HUB: OnceLock<LoopbackHub> = OnceLock::new();
    HUB.get_or_init(LoopbackHub::new).clone()
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uids currently joined to `channel_id`.
    pub fn members(&self, channel_id: &str) -> Vec<u32> {
        let state = self.state.lock();
        state
            .channels
            .get(channel_id)
            .map(|m| m.iter().map(|m| m.uid).collect())
            .unwrap_or_default()
    }

    fn next_engine_id(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_engine_id += 1;
        state.next_engine_id
    }

    fn join(&self, channel_id: &str, joiner: Member) -> Vec<Delivery> {
        let mut state = self.state.lock();
        let members = state.channels.entry(channel_id.to_string()).or_default();

        let mut out = Vec::new();
        for existing in members.iter() {
            if existing.auto_events {
                out.push((
                    existing.sink.clone(),
                    EngineEvent::UserJoined {
                        uid: joiner.uid,
                        elapsed_ms: 0,
                    },
                ));
            }
            if joiner.auto_events {
                out.push((
                    joiner.sink.clone(),
                    EngineEvent::UserJoined {
                        uid: existing.uid,
                        elapsed_ms: 0,
                    },
                ));
            }
        }
        members.push(joiner);
        out
    }

    fn leave(&self, engine_id: u64) -> Vec<Delivery> {
        let mut state = self.state.lock();
        let mut out = Vec::new();
        let mut emptied = None;
        for (channel_id, members) in state.channels.iter_mut() {
            let Some(pos) = members.iter().position(|m| m.engine_id == engine_id) else {
                continue;
            };
            let leaver = members.remove(pos);
            for remaining in members.iter().filter(|m| m.auto_events) {
                out.push((
                    remaining.sink.clone(),
                    EngineEvent::UserOffline {
                        uid: leaver.uid,
                        reason: UserOfflineReason::Quit,
                    },
                ));
            }
            if members.is_empty() {
                emptied = Some(channel_id.clone());
            }
            break;
        }
        if let Some(channel_id) = emptied {
            state.channels.remove(&channel_id);
        }
        out
    }
}

fn deliver(deliveries: Vec<Delivery>) {
    // Sinks are invoked outside the hub lock.
    for (sink, event) in deliveries {
        sink.on_event(event);
    }
}

#[derive(Debug, Default)]
struct EngineState {
    initialized: bool,
    released: bool,
    channel: Option<(String, u32)>,
    joined_at: Option<Instant>,
}

pub struct LoopbackEngine {
    id: u64,
    hub: LoopbackHub,
    sink: Arc<dyn EngineEventSink>,
    auto_events: bool,
    join_error_code: Option<i32>,
    fail_leave: bool,
    panic_on_release: bool,
    log: OpLog,
    state: Mutex<EngineState>,
}

impl std::fmt::Debug for LoopbackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackEngine")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl LoopbackEngine {
    /// Push an event to this engine's sink as if the SDK had raised it.
    pub fn inject(&self, event: EngineEvent) {
        self.sink.on_event(event);
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    pub fn joined_channel(&self) -> Option<String> {
        self.state.lock().channel.as_ref().map(|(c, _)| c.clone())
    }

    fn live(&self) -> Result<(), EngineError> {
        if self.state.lock().released {
            return Err(EngineError::Released);
        }
        Ok(())
    }

    fn emit(&self, event: EngineEvent) {
        if self.auto_events {
            self.sink.on_event(event);
        }
    }
}

impl MediaEngine for LoopbackEngine {
    fn initialize(&self, app_id: &str) -> Result<(), EngineError> {
        self.live()?;
        self.log.record(EngineOp::Initialize {
            app_id: app_id.to_string(),
        });
        self.state.lock().initialized = true;
        Ok(())
    }

    fn enable_audio(&self) -> Result<(), EngineError> {
        self.live()?;
        self.log.record(EngineOp::EnableAudio);
        Ok(())
    }

    fn configure_voice_audio(&self) -> Result<(), EngineError> {
        self.live()?;
        self.log.record(EngineOp::ConfigureVoiceAudio);
        Ok(())
    }

    fn set_default_audio_route_to_speakerphone(&self, enabled: bool) -> Result<(), EngineError> {
        self.live()?;
        self.log
            .record(EngineOp::SetDefaultRouteToSpeakerphone(enabled));
        Ok(())
    }

    fn set_enable_speakerphone(&self, enabled: bool) -> Result<(), EngineError> {
        self.live()?;
        self.log.record(EngineOp::SetEnableSpeakerphone(enabled));
        Ok(())
    }

    fn join_channel(&self, _token: &str, channel_id: &str, uid: u32) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            if state.released {
                return Err(EngineError::Released);
            }
            if !state.initialized {
                return Err(EngineError::NotInitialized);
            }
            if state.channel.is_some() {
                return Err(EngineError::Api {
                    op: "join_channel",
                    code: codes::ERR_JOIN_CHANNEL_REJECTED,
                });
            }
            if let Some(code) = self.join_error_code {
                return Err(EngineError::Api {
                    op: "join_channel",
                    code,
                });
            }
            state.channel = Some((channel_id.to_string(), uid));
            state.joined_at = Some(Instant::now());
        }
        self.log.record(EngineOp::JoinChannel {
            channel_id: channel_id.to_string(),
            uid,
        });
        tracing::debug!(engine = self.id, channel_id, uid, "loopback: joined");

        self.emit(EngineEvent::ConnectionStateChanged {
            state: ConnectionState::Connected,
            reason: ConnectionChangeReason::JoinSuccess,
        });
        self.emit(EngineEvent::JoinChannelSuccess {
            channel_id: channel_id.to_string(),
            uid,
            elapsed_ms: 0,
        });
        deliver(self.hub.join(
            channel_id,
            Member {
                engine_id: self.id,
                uid,
                auto_events: self.auto_events,
                sink: self.sink.clone(),
            },
        ));
        Ok(())
    }

    fn leave_channel(&self) -> Result<(), EngineError> {
        let joined_at = {
            let mut state = self.state.lock();
            if state.released {
                return Err(EngineError::Released);
            }
            if self.fail_leave {
                self.log.record(EngineOp::LeaveChannel);
                return Err(EngineError::Api {
                    op: "leave_channel",
                    code: codes::ERR_LEAVE_CHANNEL_REJECTED,
                });
            }
            if state.channel.take().is_none() {
                // Leaving while not in a channel is a no-op for the SDK as well.
                self.log.record(EngineOp::LeaveChannel);
                return Ok(());
            }
            state.joined_at.take()
        };
        self.log.record(EngineOp::LeaveChannel);
        deliver(self.hub.leave(self.id));
        let duration_secs = joined_at
            .map(|t| t.elapsed().as_secs() as u32)
            .unwrap_or_default();
        self.emit(EngineEvent::LeaveChannel { duration_secs });
        self.emit(EngineEvent::ConnectionStateChanged {
            state: ConnectionState::Disconnected,
            reason: ConnectionChangeReason::LeaveChannel,
        });
        Ok(())
    }

    fn mute_local_audio_stream(&self, muted: bool) -> Result<(), EngineError> {
        self.live()?;
        self.log.record(EngineOp::MuteLocalAudio(muted));
        Ok(())
    }

    fn mute_all_remote_audio_streams(&self, muted: bool) -> Result<(), EngineError> {
        self.live()?;
        self.log.record(EngineOp::MuteAllRemoteAudio(muted));
        Ok(())
    }

    fn release(&self) -> Result<(), EngineError> {
        self.log.record(EngineOp::Release);
        if self.panic_on_release {
            panic!("loopback engine {} panicked in release", self.id);
        }
        let was_joined = {
            let mut state = self.state.lock();
            if state.released {
                return Ok(());
            }
            state.released = true;
            state.initialized = false;
            state.joined_at = None;
            state.channel.take().is_some()
        };
        if was_joined {
            deliver(self.hub.leave(self.id));
        }
        tracing::debug!(engine = self.id, "loopback: released");
        Ok(())
    }
}

pub struct LoopbackEngineFactory {
    hub: LoopbackHub,
    script: Mutex<LoopbackScript>,
    log: OpLog,
    last: Mutex<Option<Arc<LoopbackEngine>>>,
}

impl std::fmt::Debug for LoopbackEngineFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackEngineFactory")
            .field("hub", &self.hub)
            .field("script", &*self.script.lock())
            .finish_non_exhaustive()
    }
}

impl LoopbackEngineFactory {
    pub fn new(hub: LoopbackHub) -> Self {
        Self::with_script(hub, LoopbackScript::default())
    }

    pub fn with_script(hub: LoopbackHub, script: LoopbackScript) -> Self {
        Self {
            hub,
            script: Mutex::new(script),
            log: OpLog::default(),
            last: Mutex::new(None),
        }
    }

    pub fn set_script(&self, script: LoopbackScript) {
        *self.script.lock() = script;
    }

    /// Operations recorded across every engine this factory created.
    pub fn log(&self) -> OpLog {
        self.log.clone()
    }

    pub fn last_engine(&self) -> Option<Arc<LoopbackEngine>> {
        self.last.lock().clone()
    }
}

impl EngineFactory for LoopbackEngineFactory {
    fn create(&self, sink: Arc<dyn EngineEventSink>) -> Result<Arc<dyn MediaEngine>, EngineError> {
        let script = self.script.lock().clone();
        if script.deny_permission {
            return Err(EngineError::PermissionDenied(
                "microphone access denied".to_string(),
            ));
        }
        self.log.record(EngineOp::Create);
        let engine = Arc::new(LoopbackEngine {
            id: self.hub.next_engine_id(),
            hub: self.hub.clone(),
            sink,
            auto_events: script.auto_events,
            join_error_code: script.join_error_code,
            fail_leave: script.fail_leave,
            panic_on_release: script.panic_on_release,
            log: self.log.clone(),
            state: Mutex::new(EngineState::default()),
        });
        *self.last.lock() = Some(engine.clone());
        Ok(engine)
    }
}
