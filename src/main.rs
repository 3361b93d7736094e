//! Tether - encrypted one-to-one chat over TCP
//!
//! Command line front end: identity management and a line-oriented chat.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use commands::{ChatCommand, CommandExecutor, FingerprintCommand, KeygenCommand};

/// Tether - encrypted one-to-one chat over TCP
///
/// Peers swap X25519 public keys on connect and exchange
/// XChaCha20-Poly1305 frames afterwards. Compare fingerprints out of band.
#[derive(Parser)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Encrypted one-to-one chat over TCP")]
#[command(long_about = None)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the identity file (or show the existing one)
    Keygen(KeygenCommand),

    /// Print the fingerprint of your public key
    Fingerprint(FingerprintCommand),

    /// Chat with one peer
    Chat(ChatCommand),
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    // Logs go to stderr so they never mix with the transcript.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Keygen(cmd) => cmd.execute(),
        Commands::Fingerprint(cmd) => cmd.execute(),
        Commands::Chat(cmd) => cmd.execute(),
    }
}
