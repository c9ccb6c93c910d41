//! The authoritative lock state and the only place it changes.
//!
//! | Current state | Event | Next state |
//! |---------------|-------|------------|
//! | Unlocked | idle timeout, PIN enabled | AwaitingPin (new episode) |
//! | Unlocked | idle timeout, no PIN | NoPinConfigured (new episode) |
//! | AwaitingPin / AccountLocked | PIN accepted | Unlocked |
//! | AwaitingPin / AccountLocked | PIN rejected | AwaitingPin |
//! | AwaitingPin / AccountLocked | account locked | AccountLocked |
//! | AwaitingPin / AccountLocked | server unreachable | unchanged, message set |
//! | NoPinConfigured | PIN provisioned | Unlocked |
//!
//! Every other combination is ignored, so a second lock trigger inside one
//! episode is a no-op. `AccountLocked` never expires on its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};

pub const INVALID_PIN_MESSAGE: &str = "Invalid PIN. Please try again.";
pub const ACCOUNT_LOCKED_MESSAGE: &str = "Account locked after too many failed attempts.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    AwaitingPin,
    NoPinConfigured,
    AccountLocked {
        /// Server-supplied and advisory; the server decides when the lock ends.
        locked_until: Option<DateTime<Utc>>,
    },
}

impl LockState {
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        !matches!(self, LockState::Unlocked)
    }

    /// States in which a PIN submission is forwarded to the server.
    #[must_use]
    pub const fn accepts_pin(&self) -> bool {
        matches!(self, LockState::AwaitingPin | LockState::AccountLocked { .. })
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LockState::Unlocked => "unlocked",
            LockState::AwaitingPin => "awaiting_pin",
            LockState::NoPinConfigured => "no_pin_configured",
            LockState::AccountLocked { .. } => "account_locked",
        }
    }
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockState::Unlocked => write!(f, "Unlocked"),
            LockState::AwaitingPin => write!(f, "Locked (enter PIN)"),
            LockState::NoPinConfigured => write!(f, "Locked (no PIN configured)"),
            LockState::AccountLocked { locked_until: Some(until) } => {
                write!(f, "Account locked until {}", until.to_rfc3339())
            }
            LockState::AccountLocked { locked_until: None } => write!(f, "Account locked"),
        }
    }
}

/// Attempts left as last reported by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinAttemptState {
    pub attempts_remaining: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinConfigurationStatus {
    pub pin_enabled: bool,
    pub has_pin: bool,
}

/// What the presentation layer renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockSnapshot {
    pub state: LockState,
    pub attempts: PinAttemptState,
    /// Error annotation for the lock screen.
    pub message: Option<String>,
    /// Incremented every time a new lock episode begins.
    pub episode: u64,
}

impl Default for LockSnapshot {
    fn default() -> Self {
        Self {
            state: LockState::Unlocked,
            attempts: PinAttemptState::default(),
            message: None,
            episode: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// Inactivity budget exhausted (deadline, foreground reconciliation or start-up).
    IdleTimeout,
    PinAccepted,
    PinRejected { attempts_remaining: Option<u32> },
    AccountLocked { locked_until: Option<DateTime<Utc>> },
    /// Verification failed without a structured answer from the server.
    VerifyUnavailable,
    PinProvisioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A new lock episode started in the given state.
    Locked(LockState),
    /// The session left a lock episode.
    Unlocked,
    /// Still locked; state, attempts or message changed.
    Updated(LockState),
    /// Event did not apply in the current state.
    Ignored,
}

struct MachineInner {
    snapshot: LockSnapshot,
    /// `None` until the backend has answered at least once.
    pin_status: Option<PinConfigurationStatus>,
}

pub struct LockStateMachine {
    inner: Mutex<MachineInner>,
    tx: watch::Sender<LockSnapshot>,
}

impl Default for LockStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LockStateMachine {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LockSnapshot::default());
        Self {
            inner: Mutex::new(MachineInner {
                snapshot: LockSnapshot::default(),
                pin_status: None,
            }),
            tx,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> LockSnapshot {
        self.lock_inner().snapshot.clone()
    }

    #[must_use]
    pub fn state(&self) -> LockState {
        self.lock_inner().snapshot.state
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LockSnapshot> {
        self.tx.subscribe()
    }

    /// Last PIN status reported by the backend.
    #[must_use]
    pub fn pin_status(&self) -> Option<PinConfigurationStatus> {
        self.lock_inner().pin_status
    }

    pub fn set_pin_status(&self, status: PinConfigurationStatus) {
        self.lock_inner().pin_status = Some(status);
    }

    /// Applies an event regardless of which lock episode it belongs to.
    pub fn apply(&self, event: LockEvent) -> Transition {
        let mut inner = self.lock_inner();
        self.apply_locked(&mut inner, event)
    }

    /// Applies an event only if the episode it was issued in is still current.
    ///
    /// Returns `None` for a stale event: the session unlocked or moved on to a
    /// different lock episode while the event was in flight.
    pub fn apply_in_episode(&self, episode: u64, event: LockEvent) -> Option<Transition> {
        let mut inner = self.lock_inner();
        if inner.snapshot.episode != episode || !inner.snapshot.state.accepts_pin() {
            debug!("Discarding {:?} from lock episode {}", event, episode);
            return None;
        }
        Some(self.apply_locked(&mut inner, event))
    }

    fn apply_locked(&self, inner: &mut MachineInner, event: LockEvent) -> Transition {
        let current = inner.snapshot.state;
        let transition = match (current, event) {
            (LockState::Unlocked, LockEvent::IdleTimeout) => {
                // An unknown PIN status fails closed onto the PIN prompt.
                let next = match inner.pin_status {
                    Some(status) if !status.pin_enabled => LockState::NoPinConfigured,
                    _ => LockState::AwaitingPin,
                };
                inner.snapshot = LockSnapshot {
                    state: next,
                    attempts: PinAttemptState::default(),
                    message: None,
                    episode: inner.snapshot.episode.wrapping_add(1),
                };
                Transition::Locked(next)
            }
            (state, LockEvent::PinAccepted) if state.accepts_pin() => {
                enter_unlocked(&mut inner.snapshot);
                Transition::Unlocked
            }
            (LockState::NoPinConfigured, LockEvent::PinProvisioned) => {
                enter_unlocked(&mut inner.snapshot);
                Transition::Unlocked
            }
            (state, LockEvent::PinRejected { attempts_remaining }) if state.accepts_pin() => {
                inner.snapshot.state = LockState::AwaitingPin;
                if attempts_remaining.is_some() {
                    inner.snapshot.attempts.attempts_remaining = attempts_remaining;
                }
                inner.snapshot.message = Some(INVALID_PIN_MESSAGE.to_string());
                Transition::Updated(LockState::AwaitingPin)
            }
            (state, LockEvent::AccountLocked { locked_until }) if state.accepts_pin() => {
                let next = LockState::AccountLocked { locked_until };
                inner.snapshot.state = next;
                inner.snapshot.message = Some(ACCOUNT_LOCKED_MESSAGE.to_string());
                Transition::Updated(next)
            }
            (state, LockEvent::VerifyUnavailable) if state.accepts_pin() => {
                inner.snapshot.message = Some(INVALID_PIN_MESSAGE.to_string());
                Transition::Updated(state)
            }
            _ => Transition::Ignored,
        };

        match transition {
            Transition::Ignored => {}
            Transition::Locked(state) => {
                info!("Session locked ({}), episode {}", state.as_str(), inner.snapshot.episode);
                self.tx.send_replace(inner.snapshot.clone());
            }
            Transition::Unlocked => {
                info!("Session unlocked");
                self.tx.send_replace(inner.snapshot.clone());
            }
            Transition::Updated(state) => {
                debug!("Lock state updated: {}", state.as_str());
                self.tx.send_replace(inner.snapshot.clone());
            }
        }
        transition
    }

    fn lock_inner(&self) -> MutexGuard<'_, MachineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn enter_unlocked(snapshot: &mut LockSnapshot) {
    snapshot.state = LockState::Unlocked;
    snapshot.attempts = PinAttemptState::default();
    snapshot.message = None;
}
