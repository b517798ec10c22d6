use super::cleanup::CleanupTrigger;
use super::signaling::CallDocumentUpdate;
use super::*;

impl CallSessionManager {
    pub(super) fn arm_ring_timeout(&mut self) {
        let timeout = self.config.ring_timeout();
        if let Some(sess) = self.session.as_ref() {
            tracing::info!(call_id = %sess.call_id, timeout_ms = timeout.as_millis() as u64, "ring: timer armed");
        }
        self.timers
            .ring
            .arm(&self.runtime, timeout, self.core_sender.clone(), |token| {
                InternalEvent::RingTimeoutElapsed { token }
            });
    }

    /// Nobody answered: resolve the call for both peers.
    pub(super) fn handle_ring_timeout(&mut self, token: u64) {
        if !self.timers.ring.accept(token) || self.cleanup.in_flight() {
            return;
        }
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        if sess.signaling_phase != Some(SignalingPhase::Ringing) {
            return;
        }
        tracing::info!(call_id = %sess.call_id, "ring: timed out");
        let call_id = sess.call_id.clone();
        let update = CallDocumentUpdate::ended(now_seconds(), None);
        if let Err(e) = self.signaling.update_call(&call_id, &update) {
            tracing::warn!(%call_id, %e, "ring: marking call ended failed");
        }
        self.begin_cleanup(CleanupTrigger::RingTimeout);
    }
}
