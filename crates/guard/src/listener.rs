use crate::clock::{ActivityTimestamp, Clock};
use crate::state::LockStateMachine;
use crate::timer::ActivityTimer;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    PointerMove,
    PointerDown,
    KeyDown,
    Scroll,
    TouchStart,
    Wheel,
    Click,
}

impl InteractionKind {
    pub const ALL: [InteractionKind; 7] = [
        InteractionKind::PointerMove,
        InteractionKind::PointerDown,
        InteractionKind::KeyDown,
        InteractionKind::Scroll,
        InteractionKind::TouchStart,
        InteractionKind::Wheel,
        InteractionKind::Click,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            InteractionKind::PointerMove => "pointer_move",
            InteractionKind::PointerDown => "pointer_down",
            InteractionKind::KeyDown => "key_down",
            InteractionKind::Scroll => "scroll",
            InteractionKind::TouchStart => "touch_start",
            InteractionKind::Wheel => "wheel",
            InteractionKind::Click => "click",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    /// The inactivity timer was reset.
    Accepted,
    /// Too soon after the previous accepted pulse.
    Debounced,
    /// The session is locked; only the PIN prompt counts as interaction.
    IgnoredWhileLocked,
}

/// Turns raw interaction signals into activity pulses for the timer.
pub struct InteractionListener {
    timer: ActivityTimer,
    machine: Arc<LockStateMachine>,
    clock: Arc<dyn Clock>,
    debounce: Duration,
    last_pulse: Mutex<Option<ActivityTimestamp>>,
}

impl InteractionListener {
    pub fn new(
        timer: ActivityTimer,
        machine: Arc<LockStateMachine>,
        clock: Arc<dyn Clock>,
        debounce: Duration,
    ) -> Self {
        Self {
            timer,
            machine,
            clock,
            debounce,
            last_pulse: Mutex::new(None),
        }
    }

    pub fn on_interaction(&self, kind: InteractionKind) -> Pulse {
        if self.machine.state().is_locked() {
            trace!("Ignoring {} while locked", kind.as_str());
            return Pulse::IgnoredWhileLocked;
        }

        let now = self.clock.now();
        {
            let mut last = self.last_pulse.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = *last {
                if previous.elapsed_until(now) < self.debounce {
                    return Pulse::Debounced;
                }
            }
            *last = Some(now);
        }

        let previous = self.timer.reset_replacing();
        // A deadline may have locked the session between the check and the reset.
        // The stored timestamp stays frozen for the whole lock episode.
        if self.machine.state().is_locked() {
            self.timer.revert(previous);
            return Pulse::IgnoredWhileLocked;
        }
        trace!("Activity pulse from {}", kind.as_str());
        Pulse::Accepted
    }

    /// Forgets the last accepted pulse so the next signal is never debounced.
    pub fn clear(&self) {
        *self.last_pulse.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
