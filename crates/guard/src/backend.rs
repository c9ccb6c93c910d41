use crate::state::PinConfigurationStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The remote session service, seen through the four calls the guard needs.
#[async_trait]
pub trait GuardBackend: Send + Sync {
    async fn get_pin_status(&self) -> Result<PinConfigurationStatus, BackendError>;

    async fn verify_pin(&self, pin: &str) -> Result<(), VerifyFailure>;

    /// Refreshes the server-side last-activity marker. Callers treat failures as non-fatal.
    async fn update_activity(&self) -> Result<(), BackendError>;

    async fn logout(&self) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError(pub String);

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "backend request failed: {}", self.0)
    }
}

impl std::error::Error for BackendError {}

impl From<color_eyre::eyre::Error> for BackendError {
    fn from(err: color_eyre::eyre::Error) -> Self {
        BackendError(err.to_string())
    }
}

/// Why the server refused a PIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyFailure {
    Rejected { attempts_remaining: Option<u32> },
    AccountLocked { locked_until: Option<DateTime<Utc>> },
    /// No structured error body came back.
    Transport(String),
}

impl std::fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyFailure::Rejected {
                attempts_remaining: Some(n),
            } => write!(f, "PIN rejected, {n} attempts remaining"),
            VerifyFailure::Rejected {
                attempts_remaining: None,
            } => write!(f, "PIN rejected"),
            VerifyFailure::AccountLocked {
                locked_until: Some(until),
            } => write!(f, "account locked until {}", until.to_rfc3339()),
            VerifyFailure::AccountLocked { locked_until: None } => write!(f, "account locked"),
            VerifyFailure::Transport(msg) => write!(f, "PIN verification unavailable: {msg}"),
        }
    }
}

impl std::error::Error for VerifyFailure {}

/// Error body returned by the server for a failed PIN verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts_remaining: Option<u32>,
    #[serde(default)]
    pub account_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
}

impl VerifyFailure {
    /// Classifies a raw error response body.
    ///
    /// Anything that does not parse as a [`VerifyErrorBody`] is a transport failure.
    #[must_use]
    pub fn from_body(body: &str) -> Self {
        match serde_json::from_str::<VerifyErrorBody>(body) {
            Ok(parsed) => Self::from(parsed),
            Err(e) => VerifyFailure::Transport(format!("unrecognised error body: {e}")),
        }
    }
}

impl From<VerifyErrorBody> for VerifyFailure {
    fn from(body: VerifyErrorBody) -> Self {
        if body.account_locked {
            VerifyFailure::AccountLocked {
                locked_until: body.locked_until,
            }
        } else {
            VerifyFailure::Rejected {
                attempts_remaining: body.attempts_remaining,
            }
        }
    }
}

impl From<&VerifyFailure> for VerifyErrorBody {
    fn from(failure: &VerifyFailure) -> Self {
        match failure {
            VerifyFailure::Rejected { attempts_remaining } => VerifyErrorBody {
                attempts_remaining: *attempts_remaining,
                ..VerifyErrorBody::default()
            },
            VerifyFailure::AccountLocked { locked_until } => VerifyErrorBody {
                account_locked: true,
                locked_until: *locked_until,
                ..VerifyErrorBody::default()
            },
            VerifyFailure::Transport(_) => VerifyErrorBody::default(),
        }
    }
}
