//! Fingerprint command - display the identity fingerprint for verification.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use tether::chat::DEFAULT_IDENTITY_PATH;
use tether::crypto::Identity;

use super::CommandExecutor;

/// Display your fingerprint for out-of-band verification.
///
/// The channel itself does not authenticate peers. Compare this value with
/// what your peer sees after the handshake.
#[derive(Args, Debug)]
pub struct FingerprintCommand {
    /// Identity file
    #[arg(short, long, default_value = DEFAULT_IDENTITY_PATH)]
    pub identity: PathBuf,
}

impl CommandExecutor for FingerprintCommand {
    fn execute(&self) -> Result<()> {
        let identity = Identity::load(&self.identity)
            .with_context(|| format!("Failed to load identity from {}", self.identity.display()))?;

        let public_hex: String = identity
            .public_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();

        println!("Identity: {}", self.identity.display());
        println!();
        println!("Public key:");
        println!("  {}", public_hex);
        println!();
        println!("Fingerprint (SHA-256):");
        println!("  {}", identity.fingerprint());

        Ok(())
    }
}
