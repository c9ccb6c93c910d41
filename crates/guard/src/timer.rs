use crate::clock::{ActivityTimestamp, Clock};
use crate::store::ActivityStore;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

/// Receives the single "inactivity deadline reached" signal.
pub trait DeadlineSink: Send + Sync {
    fn deadline_reached(&self);
}

/// Owns at most one pending inactivity deadline.
///
/// Every arm (`reset`, `schedule_remaining`) supersedes the previous deadline, and a
/// superseded deadline never reaches the sink even if its sleep has already elapsed.
/// Cloning yields another handle to the same deadline.
#[derive(Clone)]
pub struct ActivityTimer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    timeout: Duration,
    clock: Arc<dyn Clock>,
    store: Arc<dyn ActivityStore>,
    sink: Weak<dyn DeadlineSink>,
    slot: Mutex<TimerSlot>,
}

#[derive(Default)]
struct TimerSlot {
    generation: u64,
    pending: Option<PendingDeadline>,
}

struct PendingDeadline {
    due: Instant,
    task: JoinHandle<()>,
}

impl ActivityTimer {
    pub fn new(
        timeout: Duration,
        clock: Arc<dyn Clock>,
        store: Arc<dyn ActivityStore>,
        sink: Weak<dyn DeadlineSink>,
    ) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                timeout,
                clock,
                store,
                sink,
                slot: Mutex::new(TimerSlot::default()),
            }),
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Records `now` as the last activity and arms a fresh deadline `timeout` from now.
    ///
    /// A failed store write is logged; the in-memory deadline is armed regardless.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn reset(&self) {
        let now = self.inner.clock.now();
        if let Err(e) = self.inner.store.save(now) {
            warn!("Failed to persist activity timestamp: {}", e);
        }
        self.arm(self.inner.timeout);
    }

    /// [`reset`](Self::reset) that hands back the timestamp it overwrote, for [`revert`](Self::revert).
    pub(crate) fn reset_replacing(&self) -> Option<ActivityTimestamp> {
        let previous = self.inner.store.load();
        self.reset();
        previous
    }

    /// Undoes a reset that raced with a lock: drops the deadline and puts `previous` back.
    pub(crate) fn revert(&self, previous: Option<ActivityTimestamp>) {
        self.cancel();
        let restored = match previous {
            Some(timestamp) => self.inner.store.save(timestamp),
            None => self.inner.store.clear(),
        };
        if let Err(e) = restored {
            warn!("Failed to restore activity timestamp: {}", e);
        }
    }

    /// Arms a deadline `remaining` from now without touching the stored timestamp.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn schedule_remaining(&self, remaining: Duration) {
        self.arm(remaining);
    }

    /// Drops the pending deadline, if any, without writing a timestamp.
    pub fn cancel(&self) {
        let mut slot = self.inner.lock_slot();
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(pending) = slot.pending.take() {
            pending.task.abort();
            debug!("Inactivity deadline cancelled");
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.lock_slot().pending.is_some()
    }

    /// Budget left on the pending deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .lock_slot()
            .pending
            .as_ref()
            .map(|pending| pending.due.saturating_duration_since(Instant::now()))
    }

    fn arm(&self, delay: Duration) {
        let mut slot = self.inner.lock_slot();
        slot.generation = slot.generation.wrapping_add(1);
        let generation = slot.generation;
        if let Some(previous) = slot.pending.take() {
            previous.task.abort();
        }

        // The task may first be polled later; the deadline counts from now.
        let due = Instant::now() + delay;
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            sleep_until(due).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(generation);
            }
        });
        slot.pending = Some(PendingDeadline { due, task });
        debug!("Inactivity deadline armed in {:?}", delay);
    }
}

impl TimerInner {
    fn lock_slot(&self) -> MutexGuard<'_, TimerSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self, generation: u64) {
        {
            let mut slot = self.lock_slot();
            if slot.generation != generation || slot.pending.is_none() {
                return;
            }
            slot.pending = None;
        }

        debug!("Inactivity deadline reached");
        if let Some(sink) = self.sink.upgrade() {
            sink.deadline_reached();
        }
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = slot.pending.take() {
            pending.task.abort();
        }
    }
}
