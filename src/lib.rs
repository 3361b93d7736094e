//! # Tether - a one-to-one encrypted channel
//!
//! Tether connects two peers over TCP and gives them an authenticated,
//! encrypted message channel.
//!
//! ## Overview
//!
//! - Each peer has a long-term X25519 identity stored in `identity.key`
//! - On connect, peers swap raw public keys and derive directional session
//!   keys (X25519 + HKDF-SHA256)
//! - Each message travels as one length-prefixed XChaCha20-Poly1305 frame
//!   with a fresh random nonce
//! - At most one peer holds the channel at a time; extra inbound connections
//!   are refused
//!
//! ## Security Model
//!
//! - **Confidentiality and integrity** per frame (AEAD)
//! - **No peer authentication**: compare fingerprints out of band
//! - **No replay protection** beyond TCP ordering
//!
//! ## Example Usage
//!
//! ```no_run
//! use tether::chat::{self, ChannelConfig, ChannelEvent};
//! use tether::crypto::Identity;
//! use tokio::sync::mpsc;
//!
//! # async fn run() -> Result<(), tether::chat::ChannelError> {
//! let (events_tx, mut events) = mpsc::unbounded_channel::<ChannelEvent>();
//! let (channel, _task) = chat::spawn(Identity::generate(), ChannelConfig::default(), events_tx);
//!
//! channel.connect("127.0.0.1", 9000).await?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ChannelEvent::Status(s) if s == chat::STATUS_SECURE => {
//!             channel.send("hello").await?;
//!         }
//!         ChannelEvent::Message(m) => println!("{}", String::from_utf8_lossy(&m)),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod crypto;

pub use chat::{ChannelConfig, ChannelError, ChannelEvent, ChannelHandle, ChannelHandler, ConnectionState};
pub use crypto::{Identity, Role};
