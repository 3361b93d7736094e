//! Role-dependent session key derivation.
//!
//! Both endpoints compute the X25519 shared secret between their long-term
//! secret key and the peer's public key, then expand it with HKDF-SHA256 into
//! two directional keys. The initiator and responder public keys are bound in
//! as salt in a fixed order, so both sides agree regardless of who computes.

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::identity::{Identity, PUBLIC_KEY_SIZE};

/// Size of a directional session key in bytes.
pub const SESSION_KEY_SIZE: usize = 32;

/// Domain separation labels for the two directions.
const LABEL_INITIATOR_TO_RESPONDER: &[u8] = b"TETHER-KX-I2R";
const LABEL_RESPONDER_TO_INITIATOR: &[u8] = b"TETHER-KX-R2I";

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection.
    Initiator,
    /// Accepted the connection.
    Responder,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Errors from the key exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyExchangeError {
    #[error("Invalid peer public key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Peer public key produced a non-contributory shared secret")]
    NonContributory,

    #[error("Peer presented our own public key")]
    ReflectedKey,

    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

/// A 32-byte symmetric key, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Keys for one established connection.
#[derive(Debug, Clone)]
pub struct PeerSession {
    peer_public: [u8; PUBLIC_KEY_SIZE],
    role: Role,
    rx: SessionKey,
    tx: SessionKey,
}

impl PeerSession {
    /// The peer's long-term public key.
    pub fn peer_public(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.peer_public
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Key for decrypting inbound frames.
    pub fn rx(&self) -> &SessionKey {
        &self.rx
    }

    /// Key for encrypting outbound frames.
    pub fn tx(&self) -> &SessionKey {
        &self.tx
    }
}

/// Derives the session keys for `role` from our identity and the peer's raw
/// public key.
///
/// The initiator's `tx` equals the responder's `rx` and vice versa.
pub fn derive_session(
    role: Role,
    identity: &Identity,
    peer_public: &[u8],
) -> Result<PeerSession, KeyExchangeError> {
    let peer_public: [u8; PUBLIC_KEY_SIZE] =
        peer_public
            .try_into()
            .map_err(|_| KeyExchangeError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                got: peer_public.len(),
            })?;

    let own_public = identity.public_bytes();
    if peer_public == own_public {
        return Err(KeyExchangeError::ReflectedKey);
    }

    let shared = identity
        .secret_key()
        .diffie_hellman(&PublicKey::from(peer_public));
    if !shared.was_contributory() {
        return Err(KeyExchangeError::NonContributory);
    }

    let (initiator_public, responder_public) = match role {
        Role::Initiator => (&own_public, &peer_public),
        Role::Responder => (&peer_public, &own_public),
    };

    let mut salt = [0u8; PUBLIC_KEY_SIZE * 2];
    salt[..PUBLIC_KEY_SIZE].copy_from_slice(initiator_public);
    salt[PUBLIC_KEY_SIZE..].copy_from_slice(responder_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());

    let mut i2r = [0u8; SESSION_KEY_SIZE];
    let mut r2i = [0u8; SESSION_KEY_SIZE];
    hk.expand(LABEL_INITIATOR_TO_RESPONDER, &mut i2r)
        .map_err(|_| KeyExchangeError::KeyDerivationFailed)?;
    hk.expand(LABEL_RESPONDER_TO_INITIATOR, &mut r2i)
        .map_err(|_| KeyExchangeError::KeyDerivationFailed)?;

    let (rx, tx) = match role {
        Role::Initiator => (r2i, i2r),
        Role::Responder => (i2r, r2i),
    };

    let session = PeerSession {
        peer_public,
        role,
        rx: SessionKey::from_bytes(rx),
        tx: SessionKey::from_bytes(tx),
    };
    i2r.zeroize();
    r2i.zeroize();

    Ok(session)
}
