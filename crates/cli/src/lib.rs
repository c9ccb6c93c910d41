mod pin;
mod session;

use crate::pin::{handle_clear_pin_command, handle_reset_command, handle_set_pin_command, handle_status_command};
use crate::session::handle_run_command;
use clap::{Parser, Subcommand};
use color_eyre::Result;
use idlelock_guard::GuardConfig;
use idlelock_guard::config::default_config_path;
use std::path::PathBuf;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

#[derive(Parser, Debug)]
#[command(
    name = "idlelock",
    about = "Locks an authenticated session after a period of inactivity",
    long_about = "idlelock watches a session for user activity and locks it once the configured \
                  inactivity budget runs out. The last activity is persisted, so the budget \
                  survives restarts and time spent in the background.\n\n\
                  Features:\n\
                  • Single inactivity deadline, debounced activity pulses\n\
                  • Background/foreground reconciliation against the wall clock\n\
                  • PIN unlock with server-reported attempt counts and account lockout\n\
                  • Argon2id-derived local PIN verifier\n\n\
                  Quick start:\n\
                  1. idlelock set-pin          # Choose a 4-6 digit PIN\n\
                  2. idlelock run              # Start an interactive session\n\
                  3. idlelock status           # Show stored activity and PIN status"
)]
pub struct Cli {
    /// Path to the configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start an interactive session guarded by the inactivity lock
    Run,

    /// Set or replace the unlock PIN
    SetPin,

    /// Remove the unlock PIN
    ClearPin,

    /// Show the stored activity timestamp and PIN status
    Status,

    /// Forget the stored activity timestamp
    Reset,
}

/// Dispatches a parsed command line. Without a subcommand an interactive session is started.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command fails.
pub async fn handle_command(cli: Cli) -> Result<()> {
    init_tracing();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = GuardConfig::load(&config_path)?;
    let pin_path = pin_record_path(&config);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => handle_run_command(config, pin_path).await?,
        Commands::SetPin => handle_set_pin_command(&config, &pin_path).await?,
        Commands::ClearPin => handle_clear_pin_command(&pin_path).await?,
        Commands::Status => handle_status_command(&config, &pin_path).await?,
        Commands::Reset => handle_reset_command(&config)?,
    }
    Ok(())
}

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    });
}

/// The PIN record lives next to the activity store.
fn pin_record_path(config: &GuardConfig) -> PathBuf {
    config
        .store_path
        .parent()
        .map_or_else(|| PathBuf::from("pin.json"), |dir| dir.join("pin.json"))
}

fn prompt_secret(prompt: &str) -> Result<String> {
    use std::io::{Write, stdout};
    print!("{prompt}");
    stdout().flush()?;
    // Read without echo on Windows/Linux/macOS
    let pin = rpassword::prompt_password("")?;
    Ok(pin)
}

fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pin_record_sits_next_to_store() {
        let config = GuardConfig {
            store_path: PathBuf::from("/tmp/idlelock/activity.json"),
            ..GuardConfig::default()
        };
        assert_eq!(pin_record_path(&config), PathBuf::from("/tmp/idlelock/pin.json"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(299)), "4m 59s");
        assert_eq!(format_duration(Duration::from_secs(7260)), "2h 1m");
    }

    #[test]
    fn test_parse_global_config_flag() {
        let cli = Cli::try_parse_from(["idlelock", "status", "--config", "/tmp/guard.json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/guard.json")));
        assert!(matches!(cli.command, Some(Commands::Status)));

        let cli = Cli::try_parse_from(["idlelock"]).unwrap();
        assert!(cli.command.is_none());
    }
}
