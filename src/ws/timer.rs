//! One-shot and periodic timers backed by `tokio::time`.
//!
//! Each timer runs in its own task and is stopped through a [`CancellationToken`].
//! Cancellation does not retract an expiry that was already delivered, so owners tag
//! every timer with an id and ignore expiries whose id no longer matches their slot.

use std::future::Future;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Handle to a running timer task. Dropping the handle cancels the timer.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run `on_expiry` once after `duration`, unless cancelled first.
pub(crate) fn after<F>(duration: Duration, on_expiry: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    spawn_with_token(move |token| async move {
        tokio::select! {
            () = token.cancelled() => {}
            () = time::sleep(duration) => on_expiry(),
        }
    })
}

/// Run `on_tick` every `period`, the first time one full period from now.
pub(crate) fn every<F>(period: Duration, mut on_tick: F) -> TimerHandle
where
    F: FnMut() + Send + 'static,
{
    spawn_with_token(move |token| async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => on_tick(),
            }
        }
    })
}

fn spawn_with_token<F, Fut>(task: F) -> TimerHandle
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    tokio::spawn(task(token.clone()));
    TimerHandle { token }
}

/// Holds at most one live timer; arming always cancels the previous one first.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    current: Option<(u64, TimerHandle)>,
}

impl TimerSlot {
    pub(crate) fn arm(&mut self, id: u64, handle: TimerHandle) {
        self.cancel();
        self.current = Some((id, handle));
    }

    pub(crate) fn cancel(&mut self) {
        if let Some((_, handle)) = self.current.take() {
            handle.cancel();
        }
    }

    /// Whether an expiry tagged `id` belongs to the timer currently armed here.
    pub(crate) fn is_current(&self, id: u64) -> bool {
        matches!(self.current, Some((current, _)) if current == id)
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.current.is_some()
    }
}
