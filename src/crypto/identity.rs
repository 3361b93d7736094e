//! Long-term identity key pair and its on-disk store.
//!
//! The identity file is a flat 64-byte file: the X25519 public key followed by
//! the secret key, no header. It is created on first run and reused afterwards.

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

/// Size of an X25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an X25519 secret key in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of the identity file (public key || secret key).
pub const IDENTITY_FILE_SIZE: usize = PUBLIC_KEY_SIZE + SECRET_KEY_SIZE;

/// Errors that can occur while reading or writing the identity file.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid identity file length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Identity file is corrupt: public key does not match secret key")]
    KeyMismatch,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// The long-term X25519 key pair of this endpoint.
#[derive(Clone)]
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Where a loaded identity came from.
#[derive(Debug)]
pub enum IdentityOrigin {
    /// Read from an existing identity file.
    Loaded,
    /// Freshly generated and written to disk.
    Created,
    /// Freshly generated, but writing it failed. The identity only lives in memory,
    /// so the next run will present a different public key.
    Ephemeral(IdentityError),
}

/// Result of [`load_or_create`].
#[derive(Debug)]
pub struct LoadedIdentity {
    pub identity: Identity,
    pub origin: IdentityOrigin,
}

impl LoadedIdentity {
    /// True when the identity will survive a restart.
    pub fn is_persistent(&self) -> bool {
        !matches!(self.origin, IdentityOrigin::Ephemeral(_))
    }
}

impl Identity {
    /// Generates a new random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuilds an identity from a secret key.
    pub fn from_secret_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Parses the flat file layout (public key || secret key).
    ///
    /// The stored public key must match the one derived from the secret key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != IDENTITY_FILE_SIZE {
            return Err(IdentityError::InvalidLength {
                expected: IDENTITY_FILE_SIZE,
                got: bytes.len(),
            });
        }

        let mut secret_bytes = [0u8; SECRET_KEY_SIZE];
        secret_bytes.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..]);
        let identity = Self::from_secret_bytes(secret_bytes);
        zeroize::Zeroize::zeroize(&mut secret_bytes);

        if identity.public.as_bytes()[..] != bytes[..PUBLIC_KEY_SIZE] {
            return Err(IdentityError::KeyMismatch);
        }
        Ok(identity)
    }

    /// Serializes to the flat file layout.
    pub fn to_bytes(&self) -> zeroize::Zeroizing<[u8; IDENTITY_FILE_SIZE]> {
        let mut out = zeroize::Zeroizing::new([0u8; IDENTITY_FILE_SIZE]);
        out[..PUBLIC_KEY_SIZE].copy_from_slice(self.public.as_bytes());
        out[PUBLIC_KEY_SIZE..].copy_from_slice(self.secret.as_bytes());
        out
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Returns the raw public key bytes, as sent during the handshake.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Returns the secret key.
    pub fn secret_key(&self) -> &StaticSecret {
        &self.secret
    }

    /// SHA-256 of the public key, hex encoded in groups of four characters.
    pub fn fingerprint(&self) -> String {
        fingerprint(self.public.as_bytes())
    }

    /// Reads an identity file.
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let bytes = zeroize::Zeroizing::new(fs::read(path)?);
        Self::from_bytes(&bytes)
    }

    /// Writes the identity file, restricting permissions to the owner on Unix.
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(path, &self.to_bytes()[..])?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }
}

/// Loads the identity at `path`, generating and persisting a new one if the file
/// is missing or unreadable.
///
/// Never fails: when the new identity cannot be written, it is returned anyway
/// with [`IdentityOrigin::Ephemeral`] carrying the write error.
pub fn load_or_create(path: &Path) -> LoadedIdentity {
    match Identity::load(path) {
        Ok(identity) => {
            debug!(path = %path.display(), fingerprint = %identity.fingerprint(), "loaded identity");
            return LoadedIdentity {
                identity,
                origin: IdentityOrigin::Loaded,
            };
        }
        Err(IdentityError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no identity file, generating one");
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "identity file unreadable, generating a new one");
        }
    }

    let identity = Identity::generate();
    let origin = match identity.save(path) {
        Ok(()) => {
            info!(path = %path.display(), fingerprint = %identity.fingerprint(), "created identity");
            IdentityOrigin::Created
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not persist identity, using it in memory only");
            IdentityOrigin::Ephemeral(e)
        }
    };

    LoadedIdentity { identity, origin }
}

/// Fingerprint of a raw public key.
pub fn fingerprint(public_key: &[u8; PUBLIC_KEY_SIZE]) -> String {
    let hash: [u8; 32] = Sha256::digest(public_key).into();
    hash.chunks(2)
        .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
        .collect::<Vec<_>>()
        .join(" ")
}
