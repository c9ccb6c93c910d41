use crate::{format_duration, prompt_secret};
use chrono::Utc;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use idlelock_guard::{ActivityStore, FileActivityStore, GuardBackend, GuardConfig, LocalPinBackend, validate_pin};
use std::path::Path;

pub async fn handle_set_pin_command(config: &GuardConfig, pin_path: &Path) -> Result<()> {
    let backend = LocalPinBackend::open(pin_path)?.with_pin_length(config.min_pin_length, config.max_pin_length);

    let pin = prompt_secret("New PIN: ")?;
    validate_pin(&pin, config.min_pin_length, config.max_pin_length).map_err(|e| eyre!("{e}"))?;
    let confirm = prompt_secret("Confirm PIN: ")?;
    if pin != confirm {
        return Err(eyre!("PINs do not match"));
    }

    backend.set_pin(&pin).await?;
    println!("✅ PIN saved to {}", pin_path.display());
    Ok(())
}

pub async fn handle_clear_pin_command(pin_path: &Path) -> Result<()> {
    let backend = LocalPinBackend::open(pin_path)?;
    backend.clear_pin().await?;
    println!("🗑️  PIN removed. Locked sessions will wait until a new PIN is set.");
    Ok(())
}

pub async fn handle_status_command(config: &GuardConfig, pin_path: &Path) -> Result<()> {
    let store = FileActivityStore::new(config.store_path.clone());
    let backend = LocalPinBackend::open(pin_path)?;
    let status = backend.get_pin_status().await?;
    let timeout = config.inactivity_timeout();

    println!("🔐 idlelock status");
    println!("══════════════════");
    println!("  📂 Activity store: {}", store.path().display());
    println!("  ⏱️  Inactivity timeout: {}", format_duration(timeout));

    match store.load() {
        Some(stored) => {
            let elapsed = stored.elapsed_until(Utc::now().into());
            let when = stored
                .to_datetime()
                .map_or_else(|| stored.as_millis().to_string(), |dt| dt.to_rfc3339());
            println!("  🕒 Last activity: {when} ({} ago)", format_duration(elapsed));
            if elapsed >= timeout {
                println!("  🔒 The next session starts locked");
            } else {
                println!("  🔓 {} left before lock", format_duration(timeout - elapsed));
            }
        }
        None => println!("  🕒 Last activity: none recorded"),
    }

    println!();
    println!("  PIN configured: {}", if status.has_pin { "yes" } else { "no" });
    println!("  PIN unlock enabled: {}", if status.pin_enabled { "yes" } else { "no" });
    let failed = backend.failed_attempts().await;
    if failed > 0 {
        println!("  ⚠️  Failed attempts: {failed}");
    }
    if let Some(until) = backend.locked_until().await {
        if until > Utc::now() {
            println!("  ⛔ Account locked until {}", until.to_rfc3339());
        }
    }
    Ok(())
}

pub fn handle_reset_command(config: &GuardConfig) -> Result<()> {
    let store = FileActivityStore::new(config.store_path.clone());
    store.clear()?;
    println!("✅ Stored activity cleared");
    Ok(())
}
