use clap::Parser;
use color_eyre::Result;
use idlelock_cli::{Cli, handle_command};
#[cfg(not(windows))]
use jemallocator::Jemalloc;
#[cfg(windows)]
use mimalloc::MiMalloc;

#[cfg(windows)]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    if let Err(err) = handle_command(cli).await {
        eprintln!("❌ Error: {err:?}");
        std::process::exit(1);
    }
    Ok(())
}
