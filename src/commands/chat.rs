//! Chat command - line-oriented encrypted chat with one peer.
//!
//! Lines typed on stdin are sent as messages. The transcript goes to stdout
//! (`Me: ...` / `Peer: ...`); status and errors go to stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use tether::chat::{self, ChannelConfig, ChannelEvent, ChannelHandle, STATUS_SECURE};
use tether::crypto::{fingerprint, load_or_create, Identity, IdentityOrigin};

use super::CommandExecutor;

/// Chat with one peer over an encrypted channel.
///
/// Usage:
///   tether chat --listen 9000              Wait for a peer
///   tether chat --connect host:9000        Connect to a peer
#[derive(Args, Debug)]
pub struct ChatCommand {
    /// Port to listen on (0 picks a free port)
    #[arg(short, long, conflicts_with = "connect", required_unless_present = "connect")]
    pub listen: Option<u16>,

    /// Peer address as HOST:PORT
    #[arg(short, long)]
    pub connect: Option<String>,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Identity file (overrides the config)
    #[arg(short, long)]
    pub identity: Option<PathBuf>,

    /// Address to bind when listening (overrides the config)
    #[arg(long)]
    pub bind: Option<String>,

    /// Handshake timeout in seconds, 0 waits forever (overrides the config)
    #[arg(long)]
    pub handshake_timeout: Option<u64>,
}

/// Where the chat goes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Listen(u16),
    Connect { host: String, port: u16 },
}

impl CommandExecutor for ChatCommand {
    fn execute(&self) -> Result<()> {
        let config = self.build_config()?;
        let target = self.target()?;

        let loaded = load_or_create(&config.identity_path);
        match &loaded.origin {
            IdentityOrigin::Created => {
                eprintln!("Created identity {}", config.identity_path.display())
            }
            IdentityOrigin::Ephemeral(e) => {
                eprintln!("WARNING: could not save identity ({}).", e);
                eprintln!("         This session uses a temporary key; your fingerprint will change.");
            }
            IdentityOrigin::Loaded => {}
        }
        eprintln!("Your fingerprint: {}", loaded.identity.fingerprint());

        let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
        rt.block_on(run_chat(loaded.identity, config, target))
    }
}

impl ChatCommand {
    fn build_config(&self) -> Result<ChannelConfig> {
        let mut config = match &self.config {
            Some(path) => ChannelConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ChannelConfig::default(),
        };

        if let Some(identity) = &self.identity {
            config = config.with_identity_path(identity);
        }
        if let Some(bind) = &self.bind {
            config = config.with_bind_addr(bind);
        }
        if let Some(secs) = self.handshake_timeout {
            let timeout = (secs > 0).then(|| Duration::from_secs(secs));
            config = config.with_handshake_timeout(timeout);
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    fn target(&self) -> Result<Target> {
        match (self.listen, &self.connect) {
            (Some(port), None) => Ok(Target::Listen(port)),
            (None, Some(addr)) => parse_host_port(addr),
            _ => bail!("Specify exactly one of --listen or --connect"),
        }
    }
}

/// Split `HOST:PORT`. IPv6 hosts may be bracketed (`[::1]:9000`).
fn parse_host_port(addr: &str) -> Result<Target> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("Expected HOST:PORT, got '{}'", addr))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("Missing host in '{}'", addr);
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("Invalid port in '{}'", addr))?;

    Ok(Target::Connect {
        host: host.to_string(),
        port,
    })
}

async fn run_chat(identity: Identity, config: ChannelConfig, target: Target) -> Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel::<ChannelEvent>();
    let (channel, task) = chat::spawn(identity, config, events_tx);

    match &target {
        Target::Listen(port) => {
            let addr = channel
                .listen(*port)
                .await
                .with_context(|| format!("Failed to listen on port {}", port))?;
            eprintln!("Waiting for a peer on {}", addr);
        }
        Target::Connect { host, port } => {
            channel
                .connect(host, *port)
                .await
                .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) => send_line(&channel, &line).await,
                    None => break,
                }
            }
            event = events.recv() => {
                match event {
                    Some(event) => show_event(&channel, event).await,
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    channel.close().await;
    let _ = task.await;
    Ok(())
}

async fn send_line(channel: &ChannelHandle, line: &str) {
    let line = line.trim_end();
    if line.is_empty() {
        return;
    }
    // Failures are reported through the event stream.
    if channel.send(line).await.is_ok() {
        println!("Me: {}", line);
    }
}

async fn show_event(channel: &ChannelHandle, event: ChannelEvent) {
    match event {
        ChannelEvent::Message(message) => {
            println!("Peer: {}", String::from_utf8_lossy(&message));
        }
        ChannelEvent::Status(status) => {
            eprintln!("[{}]", status);
            if status == STATUS_SECURE {
                if let Some(peer) = channel.peer_key().await {
                    eprintln!("Peer fingerprint: {}", fingerprint(&peer));
                }
            }
        }
        ChannelEvent::Error(error) => eprintln!("[error] {}", error),
    }
}
