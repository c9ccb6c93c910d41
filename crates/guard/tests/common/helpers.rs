#![allow(dead_code)]
use async_trait::async_trait;
use idlelock_guard::{
    ActivityStore, ActivityTimestamp, BackendError, GuardBackend, GuardConfig, ManualClock, MemoryActivityStore,
    PinConfigurationStatus, SessionGuardian, VerifyFailure,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const TIMEOUT: Duration = Duration::from_secs(300);

pub const PIN_ENABLED: PinConfigurationStatus = PinConfigurationStatus {
    pin_enabled: true,
    has_pin: true,
};

pub const NO_PIN: PinConfigurationStatus = PinConfigurationStatus {
    pin_enabled: false,
    has_pin: false,
};

/// Backend double answering from queued responses and counting every call.
pub struct ScriptedBackend {
    pin_status: Mutex<Result<PinConfigurationStatus, BackendError>>,
    verify_responses: Mutex<VecDeque<Result<(), VerifyFailure>>>,
    verify_hold: Mutex<Option<Arc<Notify>>>,
    activity_fails: AtomicBool,
    logout_fails: AtomicBool,
    pub status_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
    pub activity_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(status: PinConfigurationStatus) -> Self {
        Self {
            pin_status: Mutex::new(Ok(status)),
            verify_responses: Mutex::new(VecDeque::new()),
            verify_hold: Mutex::new(None),
            activity_fails: AtomicBool::new(false),
            logout_fails: AtomicBool::new(false),
            status_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            activity_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_pin_status(&self, status: PinConfigurationStatus) {
        *self.pin_status.lock().unwrap() = Ok(status);
    }

    pub fn fail_pin_status(&self, message: &str) {
        *self.pin_status.lock().unwrap() = Err(BackendError(message.to_string()));
    }

    /// Calls are still counted while failing.
    pub fn fail_update_activity(&self, fail: bool) {
        self.activity_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_logout(&self, fail: bool) {
        self.logout_fails.store(fail, Ordering::SeqCst);
    }

    pub fn push_verify(&self, response: Result<(), VerifyFailure>) {
        self.verify_responses.lock().unwrap().push_back(response);
    }

    /// Makes every following `verify_pin` wait until the returned handle is notified.
    pub fn hold_verify(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.verify_hold.lock().unwrap() = Some(Arc::clone(&notify));
        notify
    }

    pub fn verify_count(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn activity_count(&self) -> usize {
        self.activity_calls.load(Ordering::SeqCst)
    }

    pub fn status_count(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn logout_count(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GuardBackend for ScriptedBackend {
    async fn get_pin_status(&self) -> Result<PinConfigurationStatus, BackendError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.pin_status.lock().unwrap().clone()
    }

    async fn verify_pin(&self, _pin: &str) -> Result<(), VerifyFailure> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let hold = self.verify_hold.lock().unwrap().clone();
        if let Some(notify) = hold {
            notify.notified().await;
        }
        self.verify_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(VerifyFailure::Transport("no scripted response".to_string())))
    }

    async fn update_activity(&self) -> Result<(), BackendError> {
        self.activity_calls.fetch_add(1, Ordering::SeqCst);
        if self.activity_fails.load(Ordering::SeqCst) {
            return Err(BackendError("activity endpoint unavailable".to_string()));
        }
        Ok(())
    }

    async fn logout(&self) -> Result<(), BackendError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.logout_fails.load(Ordering::SeqCst) {
            return Err(BackendError("logout endpoint unavailable".to_string()));
        }
        Ok(())
    }
}

pub struct TestContext {
    pub guardian: SessionGuardian,
    pub backend: Arc<ScriptedBackend>,
    pub store: Arc<MemoryActivityStore>,
    pub clock: Arc<ManualClock>,
}

impl TestContext {
    pub fn new(status: PinConfigurationStatus) -> Self {
        Self::build(status, test_config(), MemoryActivityStore::default(), 0)
    }

    pub fn with_config(status: PinConfigurationStatus, config: GuardConfig) -> Self {
        Self::build(status, config, MemoryActivityStore::default(), 0)
    }

    /// Context whose store already holds `stored` and whose clock reads `now_ms`.
    pub fn with_stored_activity(status: PinConfigurationStatus, stored: i64, now_ms: i64) -> Self {
        Self::build(
            status,
            test_config(),
            MemoryActivityStore::with_timestamp(ActivityTimestamp(stored)),
            now_ms,
        )
    }

    fn build(status: PinConfigurationStatus, config: GuardConfig, store: MemoryActivityStore, now_ms: i64) -> Self {
        let backend = Arc::new(ScriptedBackend::new(status));
        let store = Arc::new(store);
        let clock = Arc::new(ManualClock::new(now_ms));
        let guardian = SessionGuardian::with_parts(config, backend.clone(), store.clone(), clock.clone());
        Self {
            guardian,
            backend,
            store,
            clock,
        }
    }

    /// Starts a guardian with PIN unlock enabled and locks it through the idle timeout.
    pub async fn locked() -> Self {
        let ctx = Self::new(PIN_ENABLED);
        ctx.guardian.start().await;
        ctx.advance(TIMEOUT).await;
        ctx
    }

    /// Moves the wall clock and the runtime clock forward together.
    pub async fn advance(&self, by: Duration) {
        self.clock.advance(by);
        tokio::time::advance(by).await;
        settle().await;
    }

    pub fn stored(&self) -> Option<ActivityTimestamp> {
        self.store.load()
    }
}

pub fn test_config() -> GuardConfig {
    GuardConfig {
        inactivity_timeout_ms: TIMEOUT.as_millis() as u64,
        activity_debounce_ms: 1000,
        heartbeat_interval_ms: 60_000,
        pin_poll_interval_ms: 2000,
        ..GuardConfig::default()
    }
}

/// Lets spawned tasks run to their next await point.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
