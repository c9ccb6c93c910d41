use crate::backend::GuardBackend;
use crate::clock::{ActivityTimestamp, Clock, SystemClock};
use crate::config::GuardConfig;
use crate::error::{GuardError, GuardResult, PinError};
use crate::gate::{PinVerificationGate, SubmitOutcome, complete_unlock};
use crate::listener::{InteractionKind, InteractionListener, Pulse};
use crate::state::{LockEvent, LockSnapshot, LockState, LockStateMachine, PinConfigurationStatus, Transition};
use crate::store::{ActivityStore, FileActivityStore};
use crate::timer::{ActivityTimer, DeadlineSink};
use crate::visibility::{Reconciliation, Visibility, VisibilityCoordinator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Raw signals from the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    Interaction(InteractionKind),
    Visibility(Visibility),
}

/// Inactivity lock for one authenticated session.
///
/// Construct once per login, call [`start`](Self::start), feed it host signals and PIN
/// submissions, and [`logout`](Self::logout) or [`dispose`](Self::dispose) when the
/// session ends. Clones share the same session.
#[derive(Clone)]
pub struct SessionGuardian {
    shared: Arc<Shared>,
}

struct Shared {
    id: Uuid,
    config: GuardConfig,
    backend: Arc<dyn GuardBackend>,
    store: Arc<dyn ActivityStore>,
    clock: Arc<dyn Clock>,
    machine: Arc<LockStateMachine>,
    timer: ActivityTimer,
    visibility: VisibilityCoordinator,
    listener: InteractionListener,
    gate: PinVerificationGate,
    me: Weak<Shared>,
    tasks: Mutex<Tasks>,
    last_heartbeat: Mutex<Option<ActivityTimestamp>>,
    disposed: AtomicBool,
}

#[derive(Default)]
struct Tasks {
    pin_poll: Option<JoinHandle<()>>,
    signals: Option<JoinHandle<()>>,
}

impl SessionGuardian {
    /// Guardian persisting activity at `config.store_path` and reading the system clock.
    pub fn new(config: GuardConfig, backend: Arc<dyn GuardBackend>) -> Self {
        let store = Arc::new(FileActivityStore::new(config.store_path.clone()));
        Self::with_parts(config, backend, store, Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: GuardConfig,
        backend: Arc<dyn GuardBackend>,
        store: Arc<dyn ActivityStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shared = Arc::new_cyclic(|me: &Weak<Shared>| {
            let sink: Weak<dyn DeadlineSink> = me.clone();
            let machine = Arc::new(LockStateMachine::new());
            let timer = ActivityTimer::new(
                config.inactivity_timeout(),
                Arc::clone(&clock),
                Arc::clone(&store),
                sink,
            );
            let visibility = VisibilityCoordinator::new(timer.clone(), Arc::clone(&store), Arc::clone(&clock));
            let listener = InteractionListener::new(
                timer.clone(),
                Arc::clone(&machine),
                Arc::clone(&clock),
                config.activity_debounce(),
            );
            let gate = PinVerificationGate::new(
                Arc::clone(&backend),
                Arc::clone(&machine),
                timer.clone(),
                config.min_pin_length,
                config.max_pin_length,
            );

            Shared {
                id: Uuid::new_v4(),
                config,
                backend,
                store,
                clock,
                machine,
                timer,
                visibility,
                listener,
                gate,
                me: me.clone(),
                tasks: Mutex::new(Tasks::default()),
                last_heartbeat: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }
        });
        Self { shared }
    }

    /// Fetches the PIN status and settles the initial state from the stored activity.
    ///
    /// If the user was away longer than the timeout the session starts locked.
    pub async fn start(&self) -> LockSnapshot {
        let shared = &self.shared;
        match shared.backend.get_pin_status().await {
            Ok(status) => shared.machine.set_pin_status(status),
            Err(e) => warn!("Could not fetch PIN status at start: {}", e),
        }

        match shared.visibility.reconcile() {
            Reconciliation::Expired { elapsed } => {
                info!("Session {} idle for {:?} before start", shared.id, elapsed);
                shared.lock_for_inactivity("start");
            }
            Reconciliation::Resumed { remaining } => {
                info!("Session {} started, {:?} until lock", shared.id, remaining);
            }
            Reconciliation::Fresh => {
                info!("Session {} started with a fresh inactivity budget", shared.id);
            }
        }
        shared.machine.snapshot()
    }

    /// Stops every timer and background task. Lock state stays readable.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.timer.cancel();
        let mut tasks = self.shared.lock_tasks();
        if let Some(task) = tasks.pin_poll.take() {
            task.abort();
        }
        if let Some(task) = tasks.signals.take() {
            task.abort();
        }
        debug!("Session {} disposed", self.shared.id);
    }

    /// Ends the session: disposes the guardian, tells the backend and forgets the
    /// stored activity. Backend failures are logged and otherwise ignored.
    pub async fn logout(&self) {
        self.dispose();
        if let Err(e) = self.shared.backend.logout().await {
            warn!("Logout request failed: {}", e);
        }
        if let Err(e) = self.shared.store.clear() {
            warn!("Failed to clear stored activity: {}", e);
        }
        info!("Session {} logged out", self.shared.id);
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.shared.id
    }

    #[must_use]
    pub fn snapshot(&self) -> LockSnapshot {
        self.shared.machine.snapshot()
    }

    #[must_use]
    pub fn state(&self) -> LockState {
        self.shared.machine.state()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LockSnapshot> {
        self.shared.machine.subscribe()
    }

    #[must_use]
    pub fn pin_status(&self) -> Option<PinConfigurationStatus> {
        self.shared.machine.pin_status()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Budget left before the session locks; `None` while locked or suspended.
    #[must_use]
    pub fn time_until_lock(&self) -> Option<Duration> {
        if self.state().is_locked() {
            return None;
        }
        self.shared.timer.remaining()
    }

    /// Submits a PIN typed on the lock screen.
    ///
    /// # Errors
    ///
    /// See [`PinVerificationGate::submit`]. A disposed guardian answers
    /// [`PinError::NotLocked`].
    pub async fn submit_pin(&self, pin: &str) -> Result<SubmitOutcome, PinError> {
        if self.is_disposed() {
            return Err(PinError::NotLocked);
        }
        let outcome = self.shared.gate.submit(pin).await?;
        if outcome == SubmitOutcome::Unlocked {
            self.shared.listener.clear();
            self.shared.mark_heartbeat();
        }
        Ok(outcome)
    }

    pub fn interaction(&self, kind: InteractionKind) -> Pulse {
        if self.is_disposed() {
            return Pulse::IgnoredWhileLocked;
        }
        self.shared.interaction(kind)
    }

    pub fn backgrounded(&self) {
        if !self.is_disposed() {
            self.shared.visibility.backgrounded();
        }
    }

    /// Returns `None` when nothing was reconciled (locked or disposed).
    pub fn foregrounded(&self) -> Option<Reconciliation> {
        if self.is_disposed() {
            return None;
        }
        self.shared.foregrounded()
    }

    /// Push notification from the PIN provisioning flow.
    ///
    /// Takes effect immediately instead of waiting for the next poll.
    pub fn notify_pin_status(&self, status: PinConfigurationStatus) {
        if self.is_disposed() {
            return;
        }
        if self.shared.apply_pin_status(status) {
            self.shared.stop_pin_poll();
        }
    }

    /// Forwards host signals from `signals` until the channel closes.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::AlreadyAttached`] on a second call for the same session and
    /// [`GuardError::Disposed`] after [`dispose`](Self::dispose).
    pub fn attach(&self, mut signals: mpsc::Receiver<HostSignal>) -> GuardResult<()> {
        if self.is_disposed() {
            return Err(GuardError::Disposed);
        }
        let mut tasks = self.shared.lock_tasks();
        if tasks.signals.is_some() {
            return Err(GuardError::AlreadyAttached);
        }

        let me = Arc::downgrade(&self.shared);
        tasks.signals = Some(tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(shared) = me.upgrade() else {
                    break;
                };
                shared.handle_signal(signal);
            }
            debug!("Host signal channel closed");
        }));
        Ok(())
    }
}

impl Shared {
    fn lock_tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_signal(&self, signal: HostSignal) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        match signal {
            HostSignal::Interaction(kind) => {
                self.interaction(kind);
            }
            HostSignal::Visibility(Visibility::Background) => self.visibility.backgrounded(),
            HostSignal::Visibility(Visibility::Foreground) => {
                self.foregrounded();
            }
        }
    }

    fn interaction(&self, kind: InteractionKind) -> Pulse {
        let pulse = self.listener.on_interaction(kind);
        if pulse == Pulse::Accepted {
            self.maybe_heartbeat();
        }
        pulse
    }

    fn foregrounded(&self) -> Option<Reconciliation> {
        if self.machine.state().is_locked() {
            return None;
        }
        let reconciliation = self.visibility.foregrounded();
        if let Reconciliation::Expired { elapsed } = reconciliation {
            info!("Inactivity budget ran out in background ({:?})", elapsed);
            self.lock_for_inactivity("foreground");
        }
        Some(reconciliation)
    }

    fn lock_for_inactivity(&self, cause: &str) {
        if let Transition::Locked(state) = self.machine.apply(LockEvent::IdleTimeout) {
            self.timer.cancel();
            self.listener.clear();
            info!("Session {} locked by {}", self.id, cause);
            if state == LockState::NoPinConfigured {
                self.start_pin_poll();
            }
        }
    }

    /// Records the status and unlocks if a PIN has just been provisioned.
    fn apply_pin_status(&self, status: PinConfigurationStatus) -> bool {
        self.machine.set_pin_status(status);
        if status.pin_enabled && self.machine.apply(LockEvent::PinProvisioned) == Transition::Unlocked {
            info!("PIN provisioned, session {} unlocked", self.id);
            complete_unlock(&self.timer, &self.backend);
            self.mark_heartbeat();
            return true;
        }
        false
    }

    fn start_pin_poll(&self) {
        let me = self.me.clone();
        let period = self.config.pin_poll_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = me.upgrade() else {
                    break;
                };
                if shared.machine.state() != LockState::NoPinConfigured {
                    break;
                }
                match shared.backend.get_pin_status().await {
                    Ok(status) => {
                        if shared.apply_pin_status(status) {
                            break;
                        }
                    }
                    Err(e) => debug!("PIN status poll failed: {}", e),
                }
            }
        });

        if let Some(previous) = self.lock_tasks().pin_poll.replace(task) {
            previous.abort();
        }
        debug!("Polling PIN status every {:?}", period);
    }

    fn stop_pin_poll(&self) {
        if let Some(task) = self.lock_tasks().pin_poll.take() {
            task.abort();
        }
    }

    /// The unlock path sends its own heartbeat; pulses right after it are throttled.
    fn mark_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Some(self.clock.now());
    }

    fn maybe_heartbeat(&self) {
        let now = self.clock.now();
        {
            let mut last = self.last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = *last {
                if previous.elapsed_until(now) < self.config.heartbeat_interval() {
                    return;
                }
            }
            *last = Some(now);
        }

        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            if let Err(e) = backend.update_activity().await {
                debug!("Activity heartbeat failed: {}", e);
            }
        });
    }
}

impl DeadlineSink for Shared {
    fn deadline_reached(&self) {
        if !self.disposed.load(Ordering::Acquire) {
            self.lock_for_inactivity("deadline");
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in [tasks.pin_poll.take(), tasks.signals.take()].into_iter().flatten() {
            task.abort();
        }
    }
}
