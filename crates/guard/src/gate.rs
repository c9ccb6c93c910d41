use crate::backend::{GuardBackend, VerifyFailure};
use crate::error::PinError;
use crate::state::{LockEvent, LockState, LockStateMachine, Transition};
use crate::timer::ActivityTimer;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Unlocked,
    /// Still locked. The count is whatever the server reported last.
    Rejected { attempts_remaining: Option<u32> },
    AccountLocked { locked_until: Option<DateTime<Utc>> },
}

/// Checks that `pin` is between `min` and `max` ASCII digits.
///
/// # Errors
///
/// Returns [`PinError::InvalidFormat`] when it is not.
pub fn validate_pin(pin: &str, min: usize, max: usize) -> Result<(), PinError> {
    let len = pin.len();
    if len < min || len > max || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PinError::InvalidFormat { min, max });
    }
    Ok(())
}

/// Forwards PIN submissions to the backend, one at a time.
pub struct PinVerificationGate {
    backend: Arc<dyn GuardBackend>,
    machine: Arc<LockStateMachine>,
    timer: ActivityTimer,
    min_len: usize,
    max_len: usize,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when the submission finishes or is dropped mid-await.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PinVerificationGate {
    pub fn new(
        backend: Arc<dyn GuardBackend>,
        machine: Arc<LockStateMachine>,
        timer: ActivityTimer,
        min_len: usize,
        max_len: usize,
    ) -> Self {
        Self {
            backend,
            machine,
            timer,
            min_len,
            max_len,
            in_flight: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Submits a PIN for the current lock episode.
    ///
    /// Format problems, a second concurrent submission and submissions outside a PIN
    /// prompt are answered locally without contacting the server. On success the
    /// session is unlocked, the inactivity timer restarts and a best-effort activity
    /// heartbeat is sent.
    ///
    /// # Errors
    ///
    /// Returns a [`PinError`] when the submission was refused locally or its answer
    /// arrived after the lock episode ended.
    pub async fn submit(&self, pin: &str) -> Result<SubmitOutcome, PinError> {
        validate_pin(pin, self.min_len, self.max_len)?;

        let snapshot = self.machine.snapshot();
        if !snapshot.state.accepts_pin() {
            return Err(PinError::NotLocked);
        }
        let _flight = self.begin()?;

        let event = match self.backend.verify_pin(pin).await {
            Ok(()) => LockEvent::PinAccepted,
            Err(VerifyFailure::Rejected { attempts_remaining }) => {
                debug!("PIN rejected, attempts remaining: {:?}", attempts_remaining);
                LockEvent::PinRejected { attempts_remaining }
            }
            Err(VerifyFailure::AccountLocked { locked_until }) => {
                warn!("Account locked by server until {:?}", locked_until);
                LockEvent::AccountLocked { locked_until }
            }
            Err(VerifyFailure::Transport(msg)) => {
                warn!("PIN verification failed without a server verdict: {}", msg);
                LockEvent::VerifyUnavailable
            }
        };

        let transition = self
            .machine
            .apply_in_episode(snapshot.episode, event)
            .ok_or(PinError::Stale)?;

        match transition {
            Transition::Unlocked => {
                complete_unlock(&self.timer, &self.backend);
                Ok(SubmitOutcome::Unlocked)
            }
            Transition::Updated(LockState::AccountLocked { locked_until }) => {
                Ok(SubmitOutcome::AccountLocked { locked_until })
            }
            _ => Ok(SubmitOutcome::Rejected {
                attempts_remaining: self.machine.snapshot().attempts.attempts_remaining,
            }),
        }
    }

    fn begin(&self) -> Result<InFlight<'_>, PinError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| InFlight(&self.in_flight))
            .map_err(|_| PinError::InFlight)
    }
}

/// Entry side effects of every unlock: fresh inactivity budget plus a heartbeat.
///
/// Must only run after the state machine reported [`Transition::Unlocked`].
pub(crate) fn complete_unlock(timer: &ActivityTimer, backend: &Arc<dyn GuardBackend>) {
    timer.reset();
    info!("Inactivity timer restarted after unlock");

    let backend = Arc::clone(backend);
    tokio::spawn(async move {
        if let Err(e) = backend.update_activity().await {
            debug!("Activity heartbeat after unlock failed: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_validate_pin_bounds() {
        assert!(validate_pin("1234", 4, 6).is_ok());
        assert!(validate_pin("123456", 4, 6).is_ok());
        assert_eq!(validate_pin("12", 4, 6), Err(PinError::InvalidFormat { min: 4, max: 6 }));
        assert!(validate_pin("1234567", 4, 6).is_err());
        assert!(validate_pin("12a4", 4, 6).is_err());
        assert!(validate_pin("１２３４", 4, 6).is_err());
        assert!(validate_pin("", 4, 6).is_err());
    }
}
