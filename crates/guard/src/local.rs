//! A self-contained [`GuardBackend`] that keeps the PIN verifier on local disk.
//!
//! The PIN itself is never stored. An Argon2id key is derived from it and only an
//! HMAC-SHA256 tag keyed with that derived key is persisted; verification recomputes
//! the tag and compares in constant time. Failed attempts are counted here, which
//! makes this backend the attempt authority for sessions that use it.

use crate::backend::{BackendError, GuardBackend, VerifyFailure};
use crate::clock::{Clock, SystemClock};
use crate::gate::validate_pin;
use crate::state::PinConfigurationStatus;
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

type HmacSha256 = Hmac<Sha256>;

const VERIFIER_CONTEXT: &[u8] = b"idlelock-pin-verifier";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinKdfParams {
    pub salt: Vec<u8>,
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl PinKdfParams {
    /// Fresh random salt with the given Argon2 costs.
    ///
    /// # Errors
    ///
    /// Returns an error if the system random number generator fails.
    pub fn generate(m_cost_kib: u32, t_cost: u32, p_cost: u32) -> Result<Self> {
        let mut salt = vec![0u8; 16];
        getrandom::fill(&mut salt).map_err(|e| eyre!("Failed to get random bytes: {e}"))?;
        Ok(Self {
            salt,
            m_cost_kib,
            t_cost,
            p_cost,
        })
    }
}

struct KeyMaterial([u8; 32]);

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

fn derive_key(pin: &[u8], kdf: &PinKdfParams) -> Result<KeyMaterial> {
    let argon2 = Argon2::new(
        Algorithm::Argon2id,
        Version::V0x13,
        Params::new(kdf.m_cost_kib, kdf.t_cost, kdf.p_cost, Some(32)).map_err(|e| eyre!("{e}"))?,
    );
    let mut key = KeyMaterial([0u8; 32]);
    argon2
        .hash_password_into(pin, &kdf.salt, &mut key.0)
        .map_err(|e| eyre!("{e}"))?;
    Ok(key)
}

fn keyed_mac(key: &KeyMaterial) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(&key.0).map_err(|e| eyre!("{e}"))?;
    mac.update(VERIFIER_CONTEXT);
    Ok(mac)
}

fn compute_verifier(pin: &[u8], kdf: &PinKdfParams) -> Result<Vec<u8>> {
    let key = derive_key(pin, kdf)?;
    Ok(keyed_mac(&key)?.finalize().into_bytes().to_vec())
}

fn check_verifier(pin: &[u8], kdf: &PinKdfParams, verifier: &[u8]) -> Result<bool> {
    let key = derive_key(pin, kdf)?;
    Ok(keyed_mac(&key)?.verify_slice(verifier).is_ok())
}

/// Failed attempts allowed before the account is locked, and for how long.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_attempts: u32,
    pub lockout_duration: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_duration: Duration::minutes(5),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PinRecord {
    pin_enabled: bool,
    kdf: Option<PinKdfParams>,
    verifier: Option<Vec<u8>>,
    failed_attempts: u32,
    locked_until: Option<DateTime<Utc>>,
}

impl PinRecord {
    const fn has_pin(&self) -> bool {
        self.kdf.is_some() && self.verifier.is_some()
    }
}

pub struct LocalPinBackend {
    path: Option<PathBuf>,
    policy: LockoutPolicy,
    kdf_cost: (u32, u32, u32),
    pin_length: (usize, usize),
    clock: Arc<dyn Clock>,
    record: Mutex<PinRecord>,
    logged_in: AtomicBool,
    heartbeats: AtomicU64,
}

impl LocalPinBackend {
    /// Loads the PIN record at `path`, or starts empty if there is none yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let record = if path.exists() {
            let content = std::fs::read_to_string(&path).wrap_err("Failed to read PIN record")?;
            serde_json::from_str(&content).wrap_err("Failed to parse PIN record")?
        } else {
            PinRecord::default()
        };
        Ok(Self::from_parts(Some(path), record))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_parts(None, PinRecord::default())
    }

    fn from_parts(path: Option<PathBuf>, record: PinRecord) -> Self {
        Self {
            path,
            policy: LockoutPolicy::default(),
            kdf_cost: (19_456, 2, 1),
            pin_length: (4, 6),
            clock: Arc::new(SystemClock),
            record: Mutex::new(record),
            logged_in: AtomicBool::new(true),
            heartbeats: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: LockoutPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Overrides the Argon2 costs used for newly set PINs.
    #[must_use]
    pub const fn with_kdf_cost(mut self, m_cost_kib: u32, t_cost: u32, p_cost: u32) -> Self {
        self.kdf_cost = (m_cost_kib, t_cost, p_cost);
        self
    }

    /// Accepted PIN length range for [`set_pin`](Self::set_pin), inclusive.
    #[must_use]
    pub const fn with_pin_length(mut self, min: usize, max: usize) -> Self {
        self.pin_length = (min, max);
        self
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Stores a new PIN and enables PIN unlock. Resets the failed-attempt counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the PIN is outside the configured length, key derivation
    /// fails or the record cannot be written.
    pub async fn set_pin(&self, pin: &str) -> Result<()> {
        let (min, max) = self.pin_length;
        validate_pin(pin, min, max).map_err(|e| eyre!("{e}"))?;
        let (m, t, p) = self.kdf_cost;
        let kdf = PinKdfParams::generate(m, t, p)?;
        let pin_bytes = Zeroizing::new(pin.as_bytes().to_vec());
        let kdf_for_task = kdf.clone();
        let verifier = tokio::task::spawn_blocking(move || compute_verifier(&pin_bytes, &kdf_for_task))
            .await
            .wrap_err("PIN derivation task failed")??;

        let mut record = self.record.lock().await;
        record.kdf = Some(kdf);
        record.verifier = Some(verifier);
        record.pin_enabled = true;
        record.failed_attempts = 0;
        record.locked_until = None;
        self.persist(&record)?;
        info!("PIN configured");
        Ok(())
    }

    /// Removes the PIN and disables PIN unlock.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub async fn clear_pin(&self) -> Result<()> {
        let mut record = self.record.lock().await;
        *record = PinRecord::default();
        self.persist(&record)?;
        info!("PIN removed");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if enabling is requested without a PIN, or if the record
    /// cannot be written.
    pub async fn set_pin_enabled(&self, enabled: bool) -> Result<()> {
        let mut record = self.record.lock().await;
        if enabled && !record.has_pin() {
            return Err(eyre!("Cannot enable PIN unlock before a PIN is set"));
        }
        record.pin_enabled = enabled;
        self.persist(&record)
    }

    pub async fn failed_attempts(&self) -> u32 {
        self.record.lock().await.failed_attempts
    }

    /// End of the current lockout window, if one was imposed.
    pub async fn locked_until(&self) -> Option<DateTime<Utc>> {
        self.record.lock().await.locked_until
    }

    #[must_use]
    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now().to_datetime().unwrap_or_else(Utc::now)
    }

    fn persist(&self, record: &PinRecord) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(record)?;
        std::fs::write(path, content).wrap_err("Failed to write PIN record")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[async_trait]
impl GuardBackend for LocalPinBackend {
    async fn get_pin_status(&self) -> Result<PinConfigurationStatus, BackendError> {
        let record = self.record.lock().await;
        Ok(PinConfigurationStatus {
            pin_enabled: record.pin_enabled && record.has_pin(),
            has_pin: record.has_pin(),
        })
    }

    async fn verify_pin(&self, pin: &str) -> Result<(), VerifyFailure> {
        let mut record = self.record.lock().await;
        let now = self.now();

        if let Some(until) = record.locked_until {
            if now < until {
                return Err(VerifyFailure::AccountLocked {
                    locked_until: Some(until),
                });
            }
            debug!("Lockout window elapsed, resetting failed attempts");
            record.locked_until = None;
            record.failed_attempts = 0;
        }

        let (Some(kdf), Some(verifier)) = (record.kdf.clone(), record.verifier.clone()) else {
            return Err(VerifyFailure::Rejected {
                attempts_remaining: None,
            });
        };

        let pin_bytes = Zeroizing::new(pin.as_bytes().to_vec());
        let matches = tokio::task::spawn_blocking(move || check_verifier(&pin_bytes, &kdf, &verifier))
            .await
            .map_err(|e| VerifyFailure::Transport(e.to_string()))?
            .map_err(|e| VerifyFailure::Transport(e.to_string()))?;

        let outcome = if matches {
            record.failed_attempts = 0;
            Ok(())
        } else {
            record.failed_attempts = record.failed_attempts.saturating_add(1);
            if record.failed_attempts >= self.policy.max_attempts {
                let until = now + self.policy.lockout_duration;
                record.locked_until = Some(until);
                warn!("Too many failed PIN attempts, locked until {}", until.to_rfc3339());
                Err(VerifyFailure::AccountLocked {
                    locked_until: Some(until),
                })
            } else {
                Err(VerifyFailure::Rejected {
                    attempts_remaining: Some(self.policy.max_attempts - record.failed_attempts),
                })
            }
        };

        self.persist(&record)
            .map_err(|e| VerifyFailure::Transport(e.to_string()))?;
        outcome
    }

    async fn update_activity(&self) -> Result<(), BackendError> {
        if !self.is_logged_in() {
            return Err(BackendError("session is logged out".to_string()));
        }
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn logout(&self) -> Result<(), BackendError> {
        self.logged_in.store(false, Ordering::Release);
        info!("Local session logged out");
        Ok(())
    }
}
