//! Key generation command.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use tether::chat::DEFAULT_IDENTITY_PATH;
use tether::crypto::Identity;

use super::CommandExecutor;

/// Create the long-term identity used for every connection.
#[derive(Args, Debug)]
pub struct KeygenCommand {
    /// Identity file (public key followed by secret key)
    #[arg(short, long, default_value = DEFAULT_IDENTITY_PATH)]
    pub identity: PathBuf,

    /// Replace an existing identity. Peers will see a new fingerprint.
    #[arg(long)]
    pub force: bool,
}

impl CommandExecutor for KeygenCommand {
    fn execute(&self) -> Result<()> {
        if self.identity.exists() && !self.force {
            let identity = Identity::load(&self.identity).with_context(|| {
                format!(
                    "{} exists but is not a valid identity (use --force to replace it)",
                    self.identity.display()
                )
            })?;

            println!("Identity already exists: {}", self.identity.display());
            println!();
            println!("Fingerprint:");
            println!("  {}", identity.fingerprint());
            return Ok(());
        }

        if self.identity.is_dir() {
            bail!("{} is a directory", self.identity.display());
        }

        let identity = Identity::generate();
        identity
            .save(&self.identity)
            .with_context(|| format!("Failed to save identity to {}", self.identity.display()))?;

        println!("Identity generated: {}", self.identity.display());
        println!();
        println!("Fingerprint:");
        println!("  {}", identity.fingerprint());
        println!();
        println!("Read the fingerprint to your peer over a channel you trust");
        println!("(phone call, in person) to rule out a man in the middle.");
        println!("Keep the identity file secret.");

        Ok(())
    }
}
