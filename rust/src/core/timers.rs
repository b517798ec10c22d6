use std::time::Duration;

use flume::Sender;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::updates::{CoreMsg, InternalEvent};

/// A one-shot timer that posts back into the actor.
///
/// Re-arming aborts the previous task and bumps the token, so a message that was
/// already queued by the old task is rejected by [`DelayedTask::accept`].
#[derive(Debug, Default)]
pub(super) struct DelayedTask {
    token: u64,
    handle: Option<JoinHandle<()>>,
}

impl DelayedTask {
    pub(super) fn arm(
        &mut self,
        runtime: &Handle,
        delay: Duration,
        tx: Sender<CoreMsg>,
        event: fn(u64) -> InternalEvent,
    ) {
        self.cancel();
        self.token += 1;
        let token = self.token;
        self.handle = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(event(token))));
        }));
    }

    pub(super) fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(super) fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// True if `token` belongs to the live arming. Disarms the task.
    pub(super) fn accept(&mut self, token: u64) -> bool {
        if self.handle.is_some() && token == self.token {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

/// Periodic timer; the first tick fires one period after `start`.
#[derive(Debug, Default)]
pub(super) struct RepeatingTask {
    token: u64,
    handle: Option<JoinHandle<()>>,
}

impl RepeatingTask {
    pub(super) fn start(
        &mut self,
        runtime: &Handle,
        period: Duration,
        tx: Sender<CoreMsg>,
        event: fn(u64) -> InternalEvent,
    ) {
        self.cancel();
        self.token += 1;
        let token = self.token;
        self.handle = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if tx
                    .send(CoreMsg::Internal(Box::new(event(token))))
                    .is_err()
                {
                    break;
                }
            }
        }));
    }

    pub(super) fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub(super) fn accept(&self, token: u64) -> bool {
        self.handle.is_some() && token == self.token
    }
}

#[derive(Debug, Default)]
pub(super) struct SessionTimers {
    pub debounce: DelayedTask,
    pub ring: DelayedTask,
    pub unmute: DelayedTask,
    pub tick: RepeatingTask,
}

impl SessionTimers {
    pub(super) fn cancel_all(&mut self) {
        self.debounce.cancel();
        self.ring.cancel();
        self.unmute.cancel();
        self.tick.cancel();
    }
}
