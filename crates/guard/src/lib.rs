pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod guardian;
pub mod listener;
pub mod local;
pub mod state;
pub mod store;
pub mod timer;
pub mod visibility;

// Re-export commonly used types for easier access
pub use backend::{BackendError, GuardBackend, VerifyErrorBody, VerifyFailure};
pub use clock::{ActivityTimestamp, Clock, ManualClock, SystemClock};
pub use config::GuardConfig;
pub use error::{GuardError, GuardResult, PinError};
pub use gate::{PinVerificationGate, SubmitOutcome, validate_pin};
pub use guardian::{HostSignal, SessionGuardian};
pub use listener::{InteractionKind, InteractionListener, Pulse};
pub use local::{LocalPinBackend, LockoutPolicy};
pub use state::{
    LockEvent, LockSnapshot, LockState, LockStateMachine, PinAttemptState, PinConfigurationStatus, Transition,
};
pub use store::{ActivityStore, FileActivityStore, MemoryActivityStore};
pub use timer::{ActivityTimer, DeadlineSink};
pub use visibility::{Reconciliation, Visibility, VisibilityCoordinator};
