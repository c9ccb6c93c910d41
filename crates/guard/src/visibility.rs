use crate::clock::{ActivityTimestamp, Clock};
use crate::store::ActivityStore;
use crate::timer::ActivityTimer;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Foreground,
    Background,
}

/// Result of comparing the stored activity timestamp with the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The inactivity budget ran out; the caller must lock.
    Expired { elapsed: Duration },
    /// Deadline re-armed with what is left of the budget.
    Resumed { remaining: Duration },
    /// Nothing was stored; a full budget was started.
    Fresh,
}

/// Suspends the inactivity deadline while the host is hidden and settles the
/// elapsed time against the persisted timestamp when it comes back.
///
/// Deferred callbacks may be throttled or never run while hidden, so the deadline
/// is cancelled on the way out and recomputed from durable state on the way in.
pub struct VisibilityCoordinator {
    timer: ActivityTimer,
    store: Arc<dyn ActivityStore>,
    clock: Arc<dyn Clock>,
    background_since: Mutex<Option<ActivityTimestamp>>,
}

impl VisibilityCoordinator {
    pub fn new(timer: ActivityTimer, store: Arc<dyn ActivityStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            timer,
            store,
            clock,
            background_since: Mutex::new(None),
        }
    }

    pub fn backgrounded(&self) {
        self.timer.cancel();
        let now = self.clock.now();
        *self.background_since.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        debug!("Host went to background at {}", now.as_millis());
    }

    pub fn foregrounded(&self) -> Reconciliation {
        // The marker is only reported; the decision comes from the store.
        if let Some(since) = self
            .background_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            debug!(
                "Host back in foreground after {:?} in background",
                since.elapsed_until(self.clock.now())
            );
        }
        self.reconcile()
    }

    /// Arms the deadline for whatever budget the stored timestamp leaves, or reports
    /// that the budget is gone.
    pub fn reconcile(&self) -> Reconciliation {
        let timeout = self.timer.timeout();
        let Some(stored) = self.store.load() else {
            self.timer.reset();
            return Reconciliation::Fresh;
        };

        let elapsed = stored.elapsed_until(self.clock.now());
        if elapsed >= timeout {
            self.timer.cancel();
            debug!("Inactivity budget exhausted ({:?} since last activity)", elapsed);
            Reconciliation::Expired { elapsed }
        } else {
            let remaining = timeout - elapsed;
            self.timer.schedule_remaining(remaining);
            Reconciliation::Resumed { remaining }
        }
    }

    #[must_use]
    pub fn background_since(&self) -> Option<ActivityTimestamp> {
        *self.background_since.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
