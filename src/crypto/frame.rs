//! Authenticated frame codec.
//!
//! Wire layout of a frame:
//!
//! ```text
//! +------------------+----------------+--------------------------+
//! | length (u32, LE) | nonce (24 B)   | ciphertext + tag (16 B)  |
//! +------------------+----------------+--------------------------+
//! ```
//!
//! `length` covers the nonce and the ciphertext, never itself. Encryption is
//! XChaCha20-Poly1305 with a fresh random nonce per frame.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::crypto::kx::SessionKey;

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Nonce size for XChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Smallest valid frame body (empty plaintext).
pub const MIN_FRAME_BODY: usize = NONCE_SIZE + TAG_SIZE;

/// Errors from encoding or decoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Plaintext too large for a frame: {0} bytes")]
    TooLarge(usize),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Frame body too short: {0} bytes")]
    TooShort(usize),

    #[error("Decryption failed")]
    DecryptionFailed,
}

/// Length of the body (nonce + ciphertext + tag) for a plaintext of `len` bytes.
pub fn body_len(len: usize) -> usize {
    NONCE_SIZE + len + TAG_SIZE
}

/// Encrypts `plaintext` under `key` into a complete wire frame.
pub fn encode_frame(plaintext: &[u8], key: &SessionKey) -> Result<Vec<u8>, FrameError> {
    let body = body_len(plaintext.len());
    let declared = u32::try_from(body).map_err(|_| FrameError::TooLarge(plaintext.len()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| FrameError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| FrameError::EncryptionFailed)?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body);
    frame.extend_from_slice(&declared.to_le_bytes());
    frame.extend_from_slice(&nonce_bytes);
    frame.extend_from_slice(&ciphertext);

    Ok(frame)
}

/// Decrypts a frame body (everything after the length prefix) under `key`.
pub fn decode_frame(body: &[u8], key: &SessionKey) -> Result<Vec<u8>, FrameError> {
    if body.len() < MIN_FRAME_BODY {
        return Err(FrameError::TooShort(body.len()));
    }

    let (nonce_bytes, ciphertext) = body.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| FrameError::DecryptionFailed)?;
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| FrameError::DecryptionFailed)
}
