use crate::common::{PIN_ENABLED, ScriptedBackend, TIMEOUT, TestContext, settle};
use chrono::{DateTime, Utc};
use idlelock_guard::state::{ACCOUNT_LOCKED_MESSAGE, INVALID_PIN_MESSAGE};
use idlelock_guard::{
    ActivityTimer, DeadlineSink, LockEvent, LockState, LockStateMachine, ManualClock, MemoryActivityStore, PinError,
    PinVerificationGate, SubmitOutcome, VerifyFailure,
};
use std::sync::{Arc, Weak};
use std::time::Duration;
mod common;

// ============================================================================
// Local validation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_short_pin_rejected_without_network() {
    let ctx = TestContext::locked().await;
    let before = ctx.guardian.snapshot();

    let result = ctx.guardian.submit_pin("12").await;
    assert_eq!(result, Err(PinError::InvalidFormat { min: 4, max: 6 }));
    assert_eq!(ctx.backend.verify_count(), 0);
    assert_eq!(ctx.guardian.snapshot(), before);
}

#[tokio::test(start_paused = true)]
async fn test_non_digit_pin_rejected_without_network() {
    let ctx = TestContext::locked().await;
    assert!(ctx.guardian.submit_pin("12a4").await.is_err());
    assert!(ctx.guardian.submit_pin("1234567").await.is_err());
    assert_eq!(ctx.backend.verify_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_submit_while_unlocked_is_refused() {
    let ctx = TestContext::new(PIN_ENABLED);
    ctx.guardian.start().await;
    assert_eq!(ctx.guardian.submit_pin("1234").await, Err(PinError::NotLocked));
    assert_eq!(ctx.backend.verify_count(), 0);
}

// ============================================================================
// Server verdicts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_wrong_pin_shows_server_attempts() {
    let ctx = TestContext::locked().await;
    ctx.backend.push_verify(Err(VerifyFailure::from_body(r#"{"attemptsRemaining":2}"#)));

    let outcome = ctx.guardian.submit_pin("0000").await.unwrap();
    assert_eq!(
        outcome,
        SubmitOutcome::Rejected {
            attempts_remaining: Some(2)
        }
    );

    let snapshot = ctx.guardian.snapshot();
    assert_eq!(snapshot.state, LockState::AwaitingPin);
    assert_eq!(snapshot.attempts.attempts_remaining, Some(2));
    assert_eq!(snapshot.message.as_deref(), Some(INVALID_PIN_MESSAGE));
}

#[tokio::test(start_paused = true)]
async fn test_account_lock_carries_server_timestamp() {
    let ctx = TestContext::locked().await;
    ctx.backend.push_verify(Err(VerifyFailure::from_body(
        r#"{"accountLocked":true,"lockedUntil":"2024-01-01T00:05:00Z"}"#,
    )));
    let until = "2024-01-01T00:05:00Z".parse::<DateTime<Utc>>().unwrap();

    let outcome = ctx.guardian.submit_pin("0000").await.unwrap();
    assert_eq!(
        outcome,
        SubmitOutcome::AccountLocked {
            locked_until: Some(until)
        }
    );

    let snapshot = ctx.guardian.snapshot();
    assert_eq!(
        snapshot.state,
        LockState::AccountLocked {
            locked_until: Some(until)
        }
    );
    assert_eq!(snapshot.message.as_deref(), Some(ACCOUNT_LOCKED_MESSAGE));

    // Advisory only: the lock outlives its timestamp until the server says otherwise.
    ctx.advance(Duration::from_secs(3600)).await;
    assert!(matches!(ctx.guardian.state(), LockState::AccountLocked { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_account_locked_state_still_accepts_pin() {
    let ctx = TestContext::locked().await;
    ctx.backend
        .push_verify(Err(VerifyFailure::AccountLocked { locked_until: None }));
    ctx.backend.push_verify(Ok(()));

    ctx.guardian.submit_pin("0000").await.unwrap();
    assert_eq!(ctx.guardian.submit_pin("1234").await, Ok(SubmitOutcome::Unlocked));
    assert_eq!(ctx.backend.verify_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_attempts_follow_latest_server_value() {
    let ctx = TestContext::locked().await;
    ctx.backend.push_verify(Err(VerifyFailure::Rejected {
        attempts_remaining: Some(4),
    }));
    ctx.backend
        .push_verify(Err(VerifyFailure::Transport("connection reset".to_string())));
    ctx.backend
        .push_verify(Err(VerifyFailure::Rejected { attempts_remaining: None }));
    ctx.backend.push_verify(Err(VerifyFailure::Rejected {
        attempts_remaining: Some(1),
    }));

    let mut seen = Vec::new();
    for _ in 0..4 {
        ctx.guardian.submit_pin("0000").await.unwrap();
        seen.push(ctx.guardian.snapshot().attempts.attempts_remaining);
    }
    assert_eq!(seen, vec![Some(4), Some(4), Some(4), Some(1)]);
    assert_eq!(ctx.guardian.state(), LockState::AwaitingPin);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_server_keeps_state() {
    let ctx = TestContext::locked().await;
    ctx.backend
        .push_verify(Err(VerifyFailure::Transport("timeout".to_string())));

    let outcome = ctx.guardian.submit_pin("1234").await.unwrap();
    assert_eq!(outcome, SubmitOutcome::Rejected { attempts_remaining: None });
    let snapshot = ctx.guardian.snapshot();
    assert_eq!(snapshot.state, LockState::AwaitingPin);
    assert_eq!(snapshot.message.as_deref(), Some(INVALID_PIN_MESSAGE));
}

// ============================================================================
// Unlock
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_correct_pin_unlocks_and_restarts_timer() {
    let ctx = TestContext::locked().await;
    ctx.backend.push_verify(Err(VerifyFailure::Rejected {
        attempts_remaining: Some(2),
    }));
    ctx.backend.push_verify(Ok(()));
    ctx.guardian.submit_pin("0000").await.unwrap();

    ctx.clock.set(900_000);
    assert_eq!(ctx.guardian.submit_pin("1234").await, Ok(SubmitOutcome::Unlocked));
    settle().await;

    let snapshot = ctx.guardian.snapshot();
    assert_eq!(snapshot.state, LockState::Unlocked);
    assert_eq!(snapshot.attempts.attempts_remaining, None);
    assert_eq!(snapshot.message, None);
    assert_eq!(ctx.stored().map(|ts| ts.as_millis()), Some(900_000));
    assert_eq!(ctx.guardian.time_until_lock(), Some(TIMEOUT));
    assert_eq!(ctx.backend.activity_count(), 1);

    ctx.advance(TIMEOUT).await;
    assert_eq!(ctx.guardian.state(), LockState::AwaitingPin);
    assert_eq!(ctx.guardian.snapshot().episode, 2);
}

#[tokio::test(start_paused = true)]
async fn test_second_submission_while_in_flight_is_refused() {
    let ctx = TestContext::locked().await;
    let release = ctx.backend.hold_verify();
    ctx.backend.push_verify(Ok(()));

    let guardian = ctx.guardian.clone();
    let first = tokio::spawn(async move { guardian.submit_pin("1234").await });
    settle().await;
    assert_eq!(ctx.backend.verify_count(), 1);

    assert_eq!(ctx.guardian.submit_pin("5678").await, Err(PinError::InFlight));
    assert_eq!(ctx.backend.verify_count(), 1);

    release.notify_one();
    assert_eq!(first.await.unwrap(), Ok(SubmitOutcome::Unlocked));
    settle().await;
    assert_eq!(ctx.backend.activity_count(), 1);
}

struct IgnoreDeadline;

impl DeadlineSink for IgnoreDeadline {
    fn deadline_reached(&self) {}
}

fn gate(machine: &Arc<LockStateMachine>, backend: &Arc<ScriptedBackend>, timer: &ActivityTimer) -> Arc<PinVerificationGate> {
    Arc::new(PinVerificationGate::new(
        backend.clone(),
        Arc::clone(machine),
        timer.clone(),
        4,
        6,
    ))
}

#[tokio::test(start_paused = true)]
async fn test_racing_successes_unlock_once() {
    let machine = Arc::new(LockStateMachine::new());
    machine.set_pin_status(PIN_ENABLED);
    machine.apply(LockEvent::IdleTimeout);

    let store = Arc::new(MemoryActivityStore::default());
    let sink: Weak<dyn DeadlineSink> = Weak::<IgnoreDeadline>::new();
    let timer = ActivityTimer::new(TIMEOUT, Arc::new(ManualClock::new(0)), store, sink);

    let slow = Arc::new(ScriptedBackend::new(PIN_ENABLED));
    let fast = Arc::new(ScriptedBackend::new(PIN_ENABLED));
    let release = slow.hold_verify();
    slow.push_verify(Ok(()));
    fast.push_verify(Ok(()));

    let slow_gate = gate(&machine, &slow, &timer);
    let fast_gate = gate(&machine, &fast, &timer);

    let retried = tokio::spawn({
        let slow_gate = Arc::clone(&slow_gate);
        async move { slow_gate.submit("1234").await }
    });
    settle().await;

    assert_eq!(fast_gate.submit("1234").await, Ok(SubmitOutcome::Unlocked));
    release.notify_one();
    assert_eq!(retried.await.unwrap(), Err(PinError::Stale));
    settle().await;

    assert_eq!(machine.state(), LockState::Unlocked);
    assert_eq!(fast.activity_count() + slow.activity_count(), 1);
}
