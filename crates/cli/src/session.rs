use crate::format_duration;
use color_eyre::Result;
use idlelock_guard::{
    GuardBackend, GuardConfig, HostSignal, InteractionKind, LocalPinBackend, LockSnapshot, LockState, PinError,
    SessionGuardian, Visibility,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One line typed into an interactive session.
#[derive(Debug, PartialEq, Eq)]
enum SessionInput<'a> {
    Hide,
    Show,
    Status,
    Logout,
    Quit,
    /// `:set-pin <pin>` provisions a PIN from inside the session.
    SetPin(&'a str),
    Text(&'a str),
}

fn parse_input(line: &str) -> SessionInput<'_> {
    let line = line.trim();
    if let Some((":set-pin", pin)) = line.split_once(char::is_whitespace) {
        return SessionInput::SetPin(pin.trim());
    }
    match line {
        ":hide" => SessionInput::Hide,
        ":show" => SessionInput::Show,
        ":status" => SessionInput::Status,
        ":logout" => SessionInput::Logout,
        ":quit" | ":q" => SessionInput::Quit,
        text => SessionInput::Text(text),
    }
}

pub async fn handle_run_command(config: GuardConfig, pin_path: PathBuf) -> Result<()> {
    let backend = Arc::new(
        LocalPinBackend::open(&pin_path)?.with_pin_length(config.min_pin_length, config.max_pin_length),
    );
    let guardian = SessionGuardian::new(config, backend.clone());
    let (signals, receiver) = mpsc::channel(64);
    guardian.attach(receiver)?;

    let snapshot = guardian.start().await;
    info!("Session {} running", guardian.session_id());

    println!("🔐 idlelock session started");
    println!("Every line you type counts as activity. While locked, type your PIN.");
    println!("Commands: :hide  :show  :status  :set-pin <pin>  :logout  :quit");
    println!();
    print_snapshot(&snapshot, &guardian);

    let mut updates = guardian.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_input(&guardian, &backend, &signals, parse_input(&line)).await? {
                    break;
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                print_snapshot(&snapshot, &guardian);
            }
            result = &mut shutdown => {
                result?;
                info!("Shutdown signal received");
                println!("👋 Session ended");
                break;
            }
        }
    }

    guardian.dispose();
    Ok(())
}

/// Returns `false` once the session should end.
async fn handle_input(
    guardian: &SessionGuardian,
    backend: &LocalPinBackend,
    signals: &mpsc::Sender<HostSignal>,
    input: SessionInput<'_>,
) -> Result<bool> {
    match input {
        SessionInput::Hide => {
            send(signals, HostSignal::Visibility(Visibility::Background)).await;
            println!("🙈 Session hidden");
        }
        SessionInput::Show => {
            send(signals, HostSignal::Visibility(Visibility::Foreground)).await;
        }
        SessionInput::Status => print_snapshot(&guardian.snapshot(), guardian),
        SessionInput::Logout => {
            guardian.logout().await;
            println!("👋 Logged out");
            return Ok(false);
        }
        SessionInput::Quit => return Ok(false),
        SessionInput::SetPin(pin) => match provision_pin(guardian, backend, pin).await {
            Ok(()) => println!("✅ PIN saved"),
            Err(e) => println!("❌ {e}"),
        },
        SessionInput::Text("") => {}
        SessionInput::Text(text) => match guardian.state() {
            LockState::AwaitingPin | LockState::AccountLocked { .. } => submit(guardian, text).await,
            LockState::NoPinConfigured => {
                println!("No PIN is configured. Use :set-pin <pin> or `idlelock set-pin` to unlock.");
            }
            LockState::Unlocked => {
                send(signals, HostSignal::Interaction(InteractionKind::KeyDown)).await;
            }
        },
    }
    Ok(true)
}

/// Stores a PIN and pushes the new status to the guardian.
async fn provision_pin(guardian: &SessionGuardian, backend: &LocalPinBackend, pin: &str) -> Result<()> {
    backend.set_pin(pin).await?;
    guardian.notify_pin_status(backend.get_pin_status().await?);
    Ok(())
}

async fn submit(guardian: &SessionGuardian, pin: &str) {
    // Verdicts show up through the snapshot subscription.
    match guardian.submit_pin(pin).await {
        Ok(outcome) => debug!("PIN submission: {:?}", outcome),
        Err(PinError::Stale) => println!("Session changed while verifying, try again."),
        Err(e) => println!("❌ {e}"),
    }
}

async fn send(signals: &mpsc::Sender<HostSignal>, signal: HostSignal) {
    if signals.send(signal).await.is_err() {
        warn!("Host signal channel closed");
    }
}

fn print_snapshot(snapshot: &LockSnapshot, guardian: &SessionGuardian) {
    match snapshot.state {
        LockState::Unlocked => match guardian.time_until_lock() {
            Some(left) => println!("🔓 Unlocked, locks in {}", format_duration(left)),
            None => println!("🔓 Unlocked"),
        },
        state => {
            println!("🔒 {state}");
            if let Some(remaining) = snapshot.attempts.attempts_remaining {
                println!("   Attempts remaining: {remaining}");
            }
            if let Some(message) = &snapshot.message {
                println!("   {message}");
            }
        }
    }
}
