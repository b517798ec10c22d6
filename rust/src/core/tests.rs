use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use flume::Receiver;
use huddle_media::loopback::{
    EngineOp, LoopbackEngine, LoopbackEngineFactory, LoopbackHub, LoopbackScript, OpLog,
};
use huddle_media::{
    codes, ConnectionChangeReason, ConnectionState, EngineEvent, UserOfflineReason,
};
use tokio::runtime::Handle;
use tokio::time::Instant;

use super::cleanup::{CleanupState, CleanupTrigger};
use super::signaling::{
    CallDocument, CallDocumentUpdate, InMemorySignalingStore, SignalingStatus, SignalingStore,
};
use super::token::{SessionToken, StaticTokenProvider, TokenFetchError, TokenProvider};
use super::*;
use crate::state::{CallState, SetupFailureKind};

fn test_config() -> CallConfig {
    CallConfig {
        app_id: Some("test-app".into()),
        disable_network: Some(true),
        ..CallConfig::default()
    }
}

fn quiet() -> LoopbackScript {
    LoopbackScript {
        auto_events: false,
        ..LoopbackScript::default()
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn place_call(call_id: &str, channel_id: &str) -> AppAction {
    AppAction::PlaceCall {
        call_id: call_id.into(),
        channel_id: channel_id.into(),
        caller_name: "Ann".into(),
        callee_name: "Bo".into(),
    }
}

fn join_as_callee(call_id: &str, channel_id: &str) -> AppAction {
    AppAction::StartSession {
        call_id: call_id.into(),
        channel_id: channel_id.into(),
        role: CallRole::Callee,
    }
}

fn set_status(store: &InMemorySignalingStore, call_id: &str, status: SignalingStatus) {
    store
        .update_call(call_id, &CallDocumentUpdate::status(status))
        .expect("document exists");
}

struct FailingTokens;

#[async_trait]
impl TokenProvider for FailingTokens {
    async fn fetch_token(
        &self,
        _channel_id: &str,
        _participant_id: u32,
    ) -> Result<SessionToken, TokenFetchError> {
        Err(TokenFetchError {
            http_status: Some(503),
            message: "unavailable".into(),
        })
    }
}

struct HangingTokens;

#[async_trait]
impl TokenProvider for HangingTokens {
    async fn fetch_token(
        &self,
        _channel_id: &str,
        _participant_id: u32,
    ) -> Result<SessionToken, TokenFetchError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(SessionToken {
            token: "late".into(),
            expires_in_secs: None,
        })
    }
}

/// One app instance driven by hand: messages are only handled when pumped.
struct Peer {
    core: CallSessionManager,
    core_rx: Receiver<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    seen: Vec<AppUpdate>,
    factory: Arc<LoopbackEngineFactory>,
}

impl Peer {
    fn new(hub: &LoopbackHub, store: &InMemorySignalingStore, script: LoopbackScript) -> Self {
        Self::with_tokens(hub, store, script, Arc::new(StaticTokenProvider::default()))
    }

    fn with_tokens(
        hub: &LoopbackHub,
        store: &InMemorySignalingStore,
        script: LoopbackScript,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded();
        let factory = Arc::new(LoopbackEngineFactory::with_script(hub.clone(), script));
        let core = CallSessionManager::new(
            update_tx,
            core_tx,
            test_config(),
            Arc::new(RwLock::new(AppState::empty())),
            Handle::current(),
            Collaborators {
                engine_factory: factory.clone(),
                signaling: Arc::new(store.clone()),
                tokens,
            },
        );
        Self {
            core,
            core_rx,
            update_rx,
            seen: Vec::new(),
            factory,
        }
    }

    fn dispatch(&mut self, action: AppAction) {
        self.core.handle_message(CoreMsg::Action(action));
        self.collect_updates();
    }

    fn pump(&mut self) {
        while let Ok(msg) = self.core_rx.try_recv() {
            self.core.handle_message(msg);
        }
        self.collect_updates();
    }

    fn collect_updates(&mut self) {
        self.seen.extend(self.update_rx.drain());
    }

    async fn settle(&mut self, total: Duration) {
        advance(&mut [self], total).await;
    }

    fn active(&self) -> Option<CallState> {
        self.core.state.active_call.clone()
    }

    fn call(&self) -> CallState {
        self.active().expect("active call")
    }

    fn engine(&self) -> Arc<LoopbackEngine> {
        self.factory.last_engine().expect("engine created")
    }

    fn ops(&self) -> OpLog {
        self.factory.log()
    }

    fn full_states(&self) -> usize {
        self.seen
            .iter()
            .filter(|u| matches!(u, AppUpdate::FullState(_)))
            .count()
    }

    fn closed_reasons(&self) -> Vec<String> {
        self.seen
            .iter()
            .filter_map(|u| match u {
                AppUpdate::CallClosed { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Let virtual time pass in small steps, handling every peer's queue in between.
async fn advance(peers: &mut [&mut Peer], total: Duration) {
    let deadline = Instant::now() + total;
    loop {
        for peer in peers.iter_mut() {
            peer.pump();
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        tokio::time::sleep(left.min(ms(5))).await;
    }
}

/// Places a call over a quiet engine and drives it to `Connected` by hand.
async fn connected_quiet_caller(
    hub: &LoopbackHub,
    store: &InMemorySignalingStore,
) -> (Peer, Arc<LoopbackEngine>) {
    let mut caller = Peer::new(hub, store, quiet());
    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(50)).await;
    let engine = caller.engine();
    engine.inject(EngineEvent::JoinChannelSuccess {
        channel_id: "room-1".into(),
        uid: caller.call().local_uid,
        elapsed_ms: 3,
    });
    engine.inject(EngineEvent::UserJoined {
        uid: 99,
        elapsed_ms: 0,
    });
    caller.settle(ms(150)).await;
    set_status(store, "call-1", SignalingStatus::Accepted);
    caller.pump();
    assert_eq!(caller.call().phase, CallPhase::Connected);
    (caller, engine)
}

#[tokio::test(start_paused = true)]
async fn caller_and_callee_connect_after_accept() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(&hub, &store, LoopbackScript::default());
    let mut callee = Peer::new(&hub, &store, LoopbackScript::default());

    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(200)).await;
    let call = caller.call();
    assert_eq!(call.phase, CallPhase::Connecting);
    assert_eq!(call.engine_phase, EnginePhase::Joined);
    assert_eq!(call.signaling_phase, Some(SignalingPhase::Ringing));
    assert_eq!(call.peer_name.as_deref(), Some("Bo"));

    callee.dispatch(join_as_callee("call-1", "room-1"));
    advance(&mut [&mut caller, &mut callee], ms(300)).await;
    assert_eq!(callee.call().phase, CallPhase::Connecting);
    assert_eq!(callee.call().peer_name.as_deref(), Some("Ann"));
    assert_eq!(callee.call().remote_uid, Some(caller.call().local_uid));
    assert_eq!(caller.call().remote_uid, Some(callee.call().local_uid));

    callee.dispatch(AppAction::AcceptCall {
        call_id: "call-1".into(),
    });
    advance(&mut [&mut caller, &mut callee], ms(50)).await;
    for peer in [&caller, &callee] {
        assert_eq!(peer.call().phase, CallPhase::Connected);
        assert!(peer.call().started_at.is_some());
    }
    assert!(!caller.ops().contains(&EngineOp::MuteLocalAudio(false)));

    advance(&mut [&mut caller, &mut callee], ms(600)).await;
    for peer in [&caller, &callee] {
        assert!(peer.ops().contains(&EngineOp::MuteLocalAudio(false)));
        assert!(peer.ops().contains(&EngineOp::MuteAllRemoteAudio(false)));
    }

    advance(&mut [&mut caller, &mut callee], ms(2_000)).await;
    assert_eq!(caller.call().duration_secs, 2);
    assert_eq!(callee.call().duration_secs, 2);

    caller.dispatch(AppAction::EndSession);
    let closing = caller.call();
    assert!(closing.is_closing);
    assert_eq!(
        closing.phase,
        CallPhase::Ended {
            reason: "user_hangup".into()
        }
    );
    let doc = store.document("call-1").unwrap();
    assert_eq!(doc.status, SignalingStatus::Ended);
    assert_eq!(doc.duration, Some(2));
    assert!(doc.ended_at.is_some());

    advance(&mut [&mut caller, &mut callee], ms(3_000)).await;
    assert!(caller.active().is_none());
    assert!(callee.active().is_none());
    assert_eq!(caller.closed_reasons(), vec!["user_hangup".to_string()]);
    assert_eq!(callee.closed_reasons(), vec!["remote_ended".to_string()]);
    for peer in [&caller, &callee] {
        assert_eq!(peer.ops().count(|op| *op == EngineOp::Release), 1);
        assert_eq!(peer.ops().count(|op| *op == EngineOp::LeaveChannel), 1);
        assert!(peer.engine().is_released());
    }
    assert!(hub.members("room-1").is_empty());
    assert_eq!(store.subscriber_count("call-1"), 0);
}

#[tokio::test(start_paused = true)]
async fn connects_at_accept_when_engine_joined_first() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(&hub, &store, quiet());
    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(50)).await;

    let engine = caller.engine();
    engine.inject(EngineEvent::JoinChannelSuccess {
        channel_id: "room-1".into(),
        uid: 42,
        elapsed_ms: 5,
    });
    caller.settle(ms(2_000)).await;
    assert_eq!(caller.call().engine_phase, EnginePhase::Joined);
    assert_eq!(caller.call().phase, CallPhase::Connecting);
    assert!(caller.call().started_at.is_none());

    set_status(&store, "call-1", SignalingStatus::Accepted);
    caller.pump();
    let call = caller.call();
    assert_eq!(call.phase, CallPhase::Connected);
    assert!(call.started_at.is_some());
    assert_eq!(call.duration_secs, 0);

    caller.settle(ms(1_000)).await;
    engine.inject(EngineEvent::UserJoined {
        uid: 99,
        elapsed_ms: 0,
    });
    caller.settle(ms(150)).await;
    assert_eq!(caller.call().remote_uid, Some(99));

    // Duration counts from the accept, not from the engine join.
    caller.settle(ms(900)).await;
    assert_eq!(caller.call().duration_secs, 2);
}

#[tokio::test(start_paused = true)]
async fn connects_when_accept_arrives_before_engine_join() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(&hub, &store, quiet());
    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(50)).await;

    set_status(&store, "call-1", SignalingStatus::Accepted);
    caller.settle(ms(500)).await;
    assert_eq!(caller.call().phase, CallPhase::Connecting);
    assert_eq!(caller.call().engine_phase, EnginePhase::Joining);

    caller.engine().inject(EngineEvent::JoinChannelSuccess {
        channel_id: "room-1".into(),
        uid: caller.call().local_uid,
        elapsed_ms: 5,
    });
    caller.settle(ms(150)).await;
    assert_eq!(caller.call().phase, CallPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn engine_burst_is_published_once() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(&hub, &store, quiet());
    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(50)).await;
    set_status(&store, "call-1", SignalingStatus::Accepted);
    caller.pump();

    let before = caller.full_states();
    let engine = caller.engine();
    engine.inject(EngineEvent::JoinChannelSuccess {
        channel_id: "room-1".into(),
        uid: caller.call().local_uid,
        elapsed_ms: 5,
    });
    engine.inject(EngineEvent::UserJoined {
        uid: 99,
        elapsed_ms: 1,
    });

    caller.settle(ms(50)).await;
    assert_eq!(caller.full_states(), before);
    assert_eq!(caller.call().phase, CallPhase::Connecting);

    caller.settle(ms(100)).await;
    assert_eq!(caller.full_states(), before + 1);
    let call = caller.call();
    assert_eq!(call.phase, CallPhase::Connected);
    assert_eq!(call.remote_uid, Some(99));
}

#[tokio::test(start_paused = true)]
async fn started_at_survives_repeated_connect_signals() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let (mut caller, engine) = connected_quiet_caller(&hub, &store).await;
    let started_at = caller.call().started_at;
    assert!(started_at.is_some());

    caller.settle(ms(1_500)).await;
    engine.inject(EngineEvent::JoinChannelSuccess {
        channel_id: "room-1".into(),
        uid: caller.call().local_uid,
        elapsed_ms: 1,
    });
    set_status(&store, "call-1", SignalingStatus::Accepted);
    caller.settle(ms(700)).await;

    assert_eq!(caller.call().started_at, started_at);
    assert_eq!(caller.call().duration_secs, 2);
}

#[tokio::test(start_paused = true)]
async fn remote_end_while_joining_discards_join() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(&hub, &store, quiet());
    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(50)).await;
    assert_eq!(caller.call().engine_phase, EnginePhase::Joining);

    let engine = caller.engine();
    set_status(&store, "call-1", SignalingStatus::Ended);
    caller.pump();
    let call = caller.call();
    assert!(call.is_closing);
    assert_eq!(
        call.phase,
        CallPhase::Ended {
            reason: "remote_ended".into()
        }
    );

    // The join completes after the remote side gave up.
    engine.inject(EngineEvent::JoinChannelSuccess {
        channel_id: "room-1".into(),
        uid: call.local_uid,
        elapsed_ms: 900,
    });
    engine.inject(EngineEvent::UserJoined {
        uid: 99,
        elapsed_ms: 0,
    });
    caller.settle(ms(3_000)).await;

    assert!(caller.active().is_none());
    assert_eq!(caller.closed_reasons(), vec!["remote_ended".to_string()]);
    let ops = caller.ops();
    assert!(!ops.contains(&EngineOp::MuteLocalAudio(false)));
    assert!(!ops.contains(&EngineOp::MuteAllRemoteAudio(false)));
    assert_eq!(ops.count(|op| *op == EngineOp::LeaveChannel), 0);
    assert_eq!(ops.count(|op| *op == EngineOp::Release), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_end_session_releases_once() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(&hub, &store, LoopbackScript::default());
    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(200)).await;

    caller.dispatch(AppAction::EndSession);
    caller.dispatch(AppAction::EndSession);
    caller.pump();
    caller.dispatch(AppAction::EndSession);
    caller.settle(ms(3_000)).await;

    assert_eq!(caller.ops().count(|op| *op == EngineOp::Release), 1);
    assert_eq!(caller.ops().count(|op| *op == EngineOp::LeaveChannel), 1);
    assert_eq!(caller.closed_reasons(), vec!["user_hangup".to_string()]);
    assert!(caller.active().is_none());
}

#[tokio::test(start_paused = true)]
async fn cleanup_guard_rejects_reentry() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let (mut caller, _engine) = connected_quiet_caller(&hub, &store).await;

    let triggers = [
        CleanupTrigger::UserHangup,
        CleanupTrigger::RemoteEnded,
        CleanupTrigger::RingTimeout,
        CleanupTrigger::SetupFailed,
    ];
    let started: Vec<bool> = triggers
        .into_iter()
        .map(|t| caller.core.begin_cleanup(t))
        .collect();
    assert_eq!(started, vec![true, false, false, false]);

    caller.settle(ms(3_000)).await;
    assert_eq!(caller.ops().count(|op| *op == EngineOp::Release), 1);
    assert_eq!(caller.closed_reasons(), vec!["user_hangup".to_string()]);
    assert!(!caller.core.begin_cleanup(CleanupTrigger::UserHangup));
}

#[tokio::test(start_paused = true)]
async fn ring_timeout_ends_unanswered_call() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(&hub, &store, LoopbackScript::default());
    caller.dispatch(place_call("call-1", "room-1"));

    caller.settle(ms(29_900)).await;
    assert_eq!(caller.call().phase, CallPhase::Connecting);
    assert_eq!(
        store.document("call-1").unwrap().status,
        SignalingStatus::Ringing
    );

    caller.settle(ms(200)).await;
    assert_eq!(
        store.document("call-1").unwrap().status,
        SignalingStatus::Ended
    );
    caller.settle(ms(3_000)).await;
    assert_eq!(caller.closed_reasons(), vec!["ring_timeout".to_string()]);
    assert_eq!(caller.ops().count(|op| *op == EngineOp::Release), 1);

    // Nothing else fires later.
    caller.settle(ms(60_000)).await;
    assert_eq!(caller.closed_reasons().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn accept_just_before_timeout_keeps_call() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(&hub, &store, LoopbackScript::default());
    caller.dispatch(place_call("call-1", "room-1"));

    caller.settle(ms(29_900)).await;
    set_status(&store, "call-1", SignalingStatus::Accepted);
    caller.settle(ms(5_000)).await;

    assert!(caller.closed_reasons().is_empty());
    assert_eq!(caller.call().phase, CallPhase::Connected);
    assert_eq!(
        store.document("call-1").unwrap().status,
        SignalingStatus::Accepted
    );
}

#[tokio::test(start_paused = true)]
async fn permission_denial_is_reported_without_retry() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(
        &hub,
        &store,
        LoopbackScript {
            deny_permission: true,
            ..LoopbackScript::default()
        },
    );
    caller.dispatch(place_call("call-1", "room-1"));

    let failure = caller.core.state.setup_error.clone().expect("setup error");
    assert_eq!(failure.kind, SetupFailureKind::PermissionDenied);
    assert!(!failure.retryable);
    assert!(caller.core.state.toast.is_some());
    // The callee must not keep ringing for a call that never started.
    assert_eq!(
        store.document("call-1").unwrap().status,
        SignalingStatus::Ended
    );

    caller.settle(ms(500)).await;
    assert!(caller.active().is_none());
    assert_eq!(caller.closed_reasons(), vec!["setup_failed".to_string()]);
    assert!(caller.core.state.setup_error.is_some());
    assert!(caller.ops().snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn token_failure_aborts_callee_session() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    store
        .create_call("call-1", &CallDocument::ringing("room-1", "Ann", "Bo"))
        .unwrap();
    let mut callee =
        Peer::with_tokens(&hub, &store, LoopbackScript::default(), Arc::new(FailingTokens));
    callee.dispatch(join_as_callee("call-1", "room-1"));
    callee.settle(ms(100)).await;

    let failure = callee.core.state.setup_error.clone().expect("setup error");
    assert_eq!(failure.kind, SetupFailureKind::TokenFetch);
    assert_eq!(failure.http_status, Some(503));
    assert!(failure.retryable);

    callee.settle(ms(3_000)).await;
    assert_eq!(callee.closed_reasons(), vec!["setup_failed".to_string()]);
    assert_eq!(callee.ops().count(|op| *op == EngineOp::Release), 1);
    assert_eq!(
        callee
            .ops()
            .count(|op| matches!(op, EngineOp::JoinChannel { .. })),
        0
    );
    // The caller owns the document; a failing callee leaves it alone.
    assert_eq!(
        store.document("call-1").unwrap().status,
        SignalingStatus::Ringing
    );
}

#[tokio::test(start_paused = true)]
async fn slow_token_endpoint_times_out() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller =
        Peer::with_tokens(&hub, &store, LoopbackScript::default(), Arc::new(HangingTokens));
    caller.dispatch(place_call("call-1", "room-1"));

    caller.settle(ms(9_900)).await;
    assert!(caller.core.state.setup_error.is_none());
    caller.settle(ms(200)).await;
    let failure = caller.core.state.setup_error.clone().expect("setup error");
    assert_eq!(failure.kind, SetupFailureKind::TokenFetch);
    assert_eq!(failure.http_status, None);
    assert!(failure.message.contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn join_in_progress_code_is_not_fatal() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(
        &hub,
        &store,
        LoopbackScript {
            join_error_code: Some(codes::ERR_JOIN_CHANNEL_REJECTED),
            ..LoopbackScript::default()
        },
    );
    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(500)).await;

    assert!(caller.core.state.setup_error.is_none());
    let call = caller.call();
    assert_eq!(call.engine_phase, EnginePhase::Joining);
    assert!(!call.is_closing);
}

#[tokio::test(start_paused = true)]
async fn join_failure_aborts_session() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(
        &hub,
        &store,
        LoopbackScript {
            join_error_code: Some(codes::ERR_INVALID_TOKEN),
            ..LoopbackScript::default()
        },
    );
    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(3_000)).await;

    let failure = caller.core.state.setup_error.clone().expect("setup error");
    assert_eq!(failure.kind, SetupFailureKind::EngineJoin);
    assert_eq!(caller.closed_reasons(), vec!["setup_failed".to_string()]);
    assert_eq!(caller.ops().count(|op| *op == EngineOp::Release), 1);
}

#[tokio::test(start_paused = true)]
async fn engine_error_while_joining_aborts_setup() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(&hub, &store, quiet());
    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(50)).await;
    set_status(&store, "call-1", SignalingStatus::Accepted);
    caller.pump();
    assert_eq!(caller.call().engine_phase, EnginePhase::Joining);

    caller.engine().inject(EngineEvent::Error {
        code: codes::ERR_INVALID_TOKEN,
        message: "invalid token".into(),
    });
    caller.settle(ms(3_000)).await;

    let failure = caller.core.state.setup_error.clone().expect("setup error");
    assert_eq!(failure.kind, SetupFailureKind::EngineJoin);
    assert!(failure.retryable);
    assert_eq!(caller.closed_reasons(), vec!["setup_failed".to_string()]);
    assert_eq!(caller.ops().count(|op| *op == EngineOp::Release), 1);
    assert_eq!(
        store.document("call-1").unwrap().status,
        SignalingStatus::Ended
    );
}

#[tokio::test(start_paused = true)]
async fn engine_error_after_join_is_only_logged() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let (mut caller, engine) = connected_quiet_caller(&hub, &store).await;

    engine.inject(EngineEvent::Error {
        code: codes::ERR_INVALID_TOKEN,
        message: "renew failed".into(),
    });
    caller.settle(ms(500)).await;

    assert!(caller.core.state.setup_error.is_none());
    assert_eq!(caller.call().phase, CallPhase::Connected);
    assert!(caller.closed_reasons().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failing_teardown_still_closes_and_frees_the_manager() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(
        &hub,
        &store,
        LoopbackScript {
            fail_leave: true,
            panic_on_release: true,
            ..LoopbackScript::default()
        },
    );
    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(200)).await;
    assert_eq!(caller.call().engine_phase, EnginePhase::Joined);

    caller.dispatch(AppAction::EndSession);
    assert!(caller.core.cleanup.in_flight());
    caller.settle(ms(3_000)).await;

    assert_eq!(caller.core.cleanup, CleanupState::Clean);
    assert!(caller.active().is_none());
    assert_eq!(caller.closed_reasons(), vec!["user_hangup".to_string()]);
    assert_eq!(caller.ops().count(|op| *op == EngineOp::LeaveChannel), 1);
    assert_eq!(caller.ops().count(|op| *op == EngineOp::Release), 1);

    caller.factory.set_script(LoopbackScript::default());
    caller.dispatch(place_call("call-2", "room-2"));
    caller.settle(ms(200)).await;
    let call = caller.call();
    assert_eq!(call.call_id, "call-2");
    assert_eq!(call.engine_phase, EnginePhase::Joined);
    assert_eq!(
        store.document("call-2").unwrap().status,
        SignalingStatus::Ringing
    );
    assert!(caller.core.state.toast.is_none());
}

#[tokio::test(start_paused = true)]
async fn new_session_is_rejected_while_live_or_ending() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(&hub, &store, LoopbackScript::default());
    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(200)).await;
    let first_engine = caller.engine();

    caller.dispatch(join_as_callee("call-2", "room-2"));
    assert_eq!(
        caller.core.state.toast.as_deref(),
        Some("Already in a call")
    );
    assert_eq!(caller.call().call_id, "call-1");

    caller.dispatch(AppAction::EndSession);
    caller.dispatch(place_call("call-3", "room-3"));
    assert_eq!(
        caller.core.state.toast.as_deref(),
        Some("Previous call is still ending")
    );
    assert!(store.document("call-3").is_none());

    caller.settle(ms(3_000)).await;
    caller.dispatch(AppAction::ClearToast);
    assert!(caller.core.state.toast.is_none());

    caller.dispatch(place_call("call-3", "room-3"));
    caller.settle(ms(200)).await;
    assert_eq!(caller.call().call_id, "call-3");
    assert_eq!(caller.ops().count(|op| *op == EngineOp::Create), 2);

    // Callbacks from the released engine do not touch the new call.
    first_engine.inject(EngineEvent::UserJoined {
        uid: 5,
        elapsed_ms: 0,
    });
    caller.settle(ms(200)).await;
    assert_eq!(caller.call().remote_uid, None);
}

#[tokio::test(start_paused = true)]
async fn token_expiry_notice_only_warns() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let (mut caller, engine) = connected_quiet_caller(&hub, &store).await;

    engine.inject(EngineEvent::TokenPrivilegeWillExpire {
        token: "tok".into(),
    });
    caller.pump();
    assert!(caller
        .core
        .state
        .toast
        .as_deref()
        .is_some_and(|t| t.contains("expire")));
    assert_eq!(caller.call().phase, CallPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn peer_drop_clears_uid_but_quit_ends_call() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let (mut caller, engine) = connected_quiet_caller(&hub, &store).await;
    assert_eq!(caller.call().remote_uid, Some(99));

    engine.inject(EngineEvent::UserOffline {
        uid: 99,
        reason: UserOfflineReason::Dropped,
    });
    caller.settle(ms(200)).await;
    assert_eq!(caller.call().remote_uid, None);
    assert_eq!(caller.call().phase, CallPhase::Connected);

    engine.inject(EngineEvent::UserJoined {
        uid: 77,
        elapsed_ms: 0,
    });
    caller.settle(ms(200)).await;
    assert_eq!(caller.call().remote_uid, Some(77));

    // Someone we never tracked.
    engine.inject(EngineEvent::UserOffline {
        uid: 99,
        reason: UserOfflineReason::Quit,
    });
    caller.pump();
    assert_eq!(caller.call().phase, CallPhase::Connected);

    engine.inject(EngineEvent::UserOffline {
        uid: 77,
        reason: UserOfflineReason::Quit,
    });
    caller.pump();
    assert_eq!(
        caller.call().phase,
        CallPhase::Ended {
            reason: "peer_left".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn connection_failure_ends_call() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let (mut caller, engine) = connected_quiet_caller(&hub, &store).await;

    engine.inject(EngineEvent::ConnectionStateChanged {
        state: ConnectionState::Reconnecting,
        reason: ConnectionChangeReason::Interrupted,
    });
    caller.pump();
    assert_eq!(caller.call().phase, CallPhase::Connected);

    engine.inject(EngineEvent::ConnectionStateChanged {
        state: ConnectionState::Failed,
        reason: ConnectionChangeReason::Lost,
    });
    caller.settle(ms(3_000)).await;
    assert_eq!(caller.closed_reasons(), vec!["connection_failed".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn unexpected_engine_leave_ends_call() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let (mut caller, engine) = connected_quiet_caller(&hub, &store).await;

    engine.inject(EngineEvent::LeaveChannel { duration_secs: 4 });
    caller.pump();
    assert_eq!(
        caller.call().phase,
        CallPhase::Ended {
            reason: "engine_left".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn removed_document_ends_call() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(&hub, &store, LoopbackScript::default());
    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(200)).await;

    store.remove_call("call-1");
    caller.settle(ms(3_000)).await;
    assert_eq!(caller.closed_reasons(), vec!["call_removed".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn mute_before_audio_opens_keeps_microphone_closed() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(&hub, &store, LoopbackScript::default());
    caller.dispatch(place_call("call-1", "room-1"));
    caller.settle(ms(200)).await;

    caller.dispatch(AppAction::ToggleMute);
    assert!(caller.call().is_muted);

    set_status(&store, "call-1", SignalingStatus::Accepted);
    caller.settle(ms(600)).await;
    assert!(caller.ops().contains(&EngineOp::MuteAllRemoteAudio(false)));
    assert!(!caller.ops().contains(&EngineOp::MuteLocalAudio(false)));

    caller.dispatch(AppAction::ToggleMute);
    assert!(!caller.call().is_muted);
    assert!(caller.ops().contains(&EngineOp::MuteLocalAudio(false)));

    caller.dispatch(AppAction::ToggleSpeaker);
    assert!(caller.call().is_speaker_on);
    assert!(caller.ops().contains(&EngineOp::SetEnableSpeakerphone(true)));
}

#[tokio::test(start_paused = true)]
async fn callee_decline_ends_call_on_both_sides() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    let mut caller = Peer::new(&hub, &store, LoopbackScript::default());
    let mut callee = Peer::new(&hub, &store, LoopbackScript::default());

    caller.dispatch(place_call("call-1", "room-1"));
    callee.dispatch(join_as_callee("call-1", "room-1"));
    advance(&mut [&mut caller, &mut callee], ms(300)).await;

    callee.dispatch(AppAction::DeclineCall {
        call_id: "call-1".into(),
    });
    advance(&mut [&mut caller, &mut callee], ms(3_000)).await;

    assert_eq!(
        store.document("call-1").unwrap().status,
        SignalingStatus::Declined
    );
    assert_eq!(callee.closed_reasons(), vec!["declined".to_string()]);
    assert_eq!(caller.closed_reasons(), vec!["declined".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn decline_without_session_only_writes_status() {
    let hub = LoopbackHub::new();
    let store = InMemorySignalingStore::new();
    store
        .create_call("call-1", &CallDocument::ringing("room-1", "Ann", "Bo"))
        .unwrap();
    let mut callee = Peer::new(&hub, &store, LoopbackScript::default());

    callee.dispatch(AppAction::DeclineCall {
        call_id: "call-1".into(),
    });
    assert_eq!(
        store.document("call-1").unwrap().status,
        SignalingStatus::Declined
    );
    assert!(callee.active().is_none());
    assert!(callee.ops().snapshot().is_empty());
}
