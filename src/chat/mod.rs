//! # Secure channel
//!
//! One-to-one encrypted messaging over TCP.
//!
//! ## Protocol
//!
//! 1. On connect both sides send their raw 32-byte X25519 public key.
//! 2. Each derives `rx`/`tx` session keys; the connecting side is the
//!    initiator.
//! 3. Every message is then one frame: `u32` little-endian length, then a
//!    24-byte nonce, then XChaCha20-Poly1305 ciphertext with its tag.
//!
//! Session keys live only in RAM and are zeroized on drop.

mod channel;
mod config;
mod error;
mod reassembly;
mod service;
pub mod transport;

pub use channel::{Channel, ChannelEvent, ConnectionState, STATUS_SECURE};
pub use config::{
    ChannelConfig, ConfigError, DEFAULT_BIND_ADDR, DEFAULT_HANDSHAKE_TIMEOUT_SECS,
    DEFAULT_IDENTITY_PATH, DEFAULT_MAX_FRAME_SIZE,
};
pub use error::ChannelError;
pub use reassembly::{Reassembler, Unit};
pub use service::{spawn, ChannelHandle, ChannelHandler};
