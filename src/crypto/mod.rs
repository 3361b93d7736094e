//! Cryptographic building blocks for tether.
//!
//! - Long-term X25519 identity, persisted as `pk || sk`
//! - Key exchange: X25519 + HKDF-SHA256 into directional session keys
//! - Frame codec: XChaCha20-Poly1305 with a random nonce per frame

pub mod frame;
pub mod identity;
pub mod kx;

pub use frame::{
    body_len, decode_frame, encode_frame, FrameError, LENGTH_PREFIX_SIZE, MIN_FRAME_BODY,
    NONCE_SIZE, TAG_SIZE,
};
pub use identity::{
    fingerprint, load_or_create, Identity, IdentityError, IdentityOrigin, LoadedIdentity,
    IDENTITY_FILE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE,
};
pub use kx::{derive_session, KeyExchangeError, PeerSession, Role, SessionKey, SESSION_KEY_SIZE};
