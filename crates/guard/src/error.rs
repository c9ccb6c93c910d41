/// Reasons a PIN submission never reached the server, or came back too late to matter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinError {
    /// Not 4–6 ASCII digits (bounds come from the configuration).
    InvalidFormat { min: usize, max: usize },
    /// Another submission is still waiting for the server.
    InFlight,
    /// The session is not showing a PIN prompt.
    NotLocked,
    /// The lock episode ended while the server was answering.
    Stale,
}

impl std::fmt::Display for PinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinError::InvalidFormat { min, max } => write!(f, "PIN must be {min} to {max} digits"),
            PinError::InFlight => write!(f, "A PIN verification is already in progress"),
            PinError::NotLocked => write!(f, "Session is not waiting for a PIN"),
            PinError::Stale => write!(f, "Session state changed before verification completed"),
        }
    }
}

impl std::error::Error for PinError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// Host signals are already being forwarded for this session.
    AlreadyAttached,
    /// The guardian was disposed.
    Disposed,
}

impl std::fmt::Display for GuardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardError::AlreadyAttached => write!(f, "Host signals are already attached to this session"),
            GuardError::Disposed => write!(f, "Session guardian has been disposed"),
        }
    }
}

impl std::error::Error for GuardError {}

pub type GuardResult<T> = Result<T, GuardError>;
