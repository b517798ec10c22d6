// Teardown. Every path that ends a call goes through `begin_cleanup`.

use super::engine::{force_mute, release_engine};
use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CleanupTrigger {
    UserHangup,
    RemoteEnded,
    Declined,
    RingTimeout,
    PeerLeft,
    EngineLeft,
    ConnectionFailed,
    CallRemoved,
    SetupFailed,
}

impl CleanupTrigger {
    pub(super) fn reason(self) -> &'static str {
        match self {
            CleanupTrigger::UserHangup => "user_hangup",
            CleanupTrigger::RemoteEnded => "remote_ended",
            CleanupTrigger::Declined => "declined",
            CleanupTrigger::RingTimeout => "ring_timeout",
            CleanupTrigger::PeerLeft => "peer_left",
            CleanupTrigger::EngineLeft => "engine_left",
            CleanupTrigger::ConnectionFailed => "connection_failed",
            CleanupTrigger::CallRemoved => "call_removed",
            CleanupTrigger::SetupFailed => "setup_failed",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) enum CleanupState {
    #[default]
    Clean,
    InFlight {
        seq: u64,
    },
}

impl CleanupState {
    pub(super) fn in_flight(&self) -> bool {
        matches!(self, CleanupState::InFlight { .. })
    }
}

struct TeardownPlan {
    engine: Option<Arc<dyn MediaEngine>>,
    leave: bool,
    settle: Duration,
    grace: Duration,
}

#[derive(Debug, Default)]
pub struct TeardownReport {
    pub left_channel: bool,
    pub released: bool,
    pub errors: Vec<CallError>,
}

async fn run_teardown(plan: TeardownPlan) -> TeardownReport {
    let mut report = TeardownReport::default();
    let Some(engine) = plan.engine else {
        return report;
    };
    force_mute(engine.as_ref(), &mut report.errors);
    if plan.leave {
        match engine.leave_channel() {
            Ok(()) => report.left_channel = true,
            Err(e) => report.errors.push(CallError::cleanup("leave_channel", e)),
        }
        tokio::time::sleep(plan.settle).await;
    }
    let before = report.errors.len();
    release_engine(engine, plan.grace, &mut report.errors).await;
    report.released = !report.errors[before..]
        .iter()
        .any(|e| matches!(e, CallError::Cleanup { step: "release", .. }));
    report
}

impl CallSessionManager {
    /// Starts the teardown of the current session. Returns false when there is
    /// nothing to tear down or a teardown is already running.
    pub(super) fn begin_cleanup(&mut self, trigger: CleanupTrigger) -> bool {
        if self.cleanup.in_flight() {
            tracing::debug!(trigger = trigger.reason(), "cleanup: already in flight");
            return false;
        }
        let Some(sess) = self.session.as_mut() else {
            return false;
        };
        let seq = sess.seq;
        self.cleanup = CleanupState::InFlight { seq };
        tracing::info!(call_id = %sess.call_id, seq, trigger = trigger.reason(), "cleanup: begin");

        self.timers.cancel_all();
        sess.fold_pending();
        if let Some(id) = sess.subscription.take() {
            self.signaling.unsubscribe(&sess.call_id, id);
        }

        let leave = sess.engine_phase == EnginePhase::Joined;
        if sess.engine_phase.holds_engine() {
            sess.engine_phase = EnginePhase::Leaving;
        }
        sess.end(trigger.reason());
        sess.audio_open = false;

        let plan = TeardownPlan {
            engine: self.engine.take_for_release(),
            leave,
            settle: self.config.leave_settle(),
            grace: self.config.release_grace(),
        };
        self.publish_call();

        let tx = self.core_sender.clone();
        let runtime = self.runtime.clone();
        self.runtime.spawn(async move {
            // A panicking engine binding must not leave the guard set.
            let report = match runtime.spawn(run_teardown(plan)).await {
                Ok(report) => report,
                Err(e) => TeardownReport {
                    errors: vec![CallError::cleanup("teardown", e)],
                    ..TeardownReport::default()
                },
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::CleanupFinished { seq, report },
            )));
        });
        true
    }

    pub(super) fn handle_cleanup_finished(&mut self, seq: u64, report: TeardownReport) {
        if self.cleanup != (CleanupState::InFlight { seq }) {
            tracing::warn!(seq, "cleanup: stale completion");
            return;
        }
        for e in &report.errors {
            tracing::warn!(seq, %e, "cleanup: step failed");
        }
        let Some(mut sess) = self.session.take() else {
            self.cleanup = CleanupState::Clean;
            return;
        };
        sess.engine_phase = EnginePhase::Released;
        self.cleanup = CleanupState::Clean;
        tracing::info!(
            call_id = %sess.call_id,
            seq,
            left = report.left_channel,
            released = report.released,
            "cleanup: done"
        );

        let reason = sess.end_reason();
        self.state.active_call = None;
        self.emit_state();
        self.emit_call_closed(sess.call_id, reason, sess.duration_secs);
    }
}
