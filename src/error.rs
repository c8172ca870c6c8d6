//! Error types for the container API.
//!
//! Every fallible operation on a [`Container`](crate::Container) returns the
//! single [`Error`] enum below. Failures are classified, never retried
//! internally, and surface to the caller immediately.

use std::io;

use thiserror::Error;

pub use crate::crypto::keys::KeyAccessError;

/// Errors reported by container operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument was invalid (empty password or path,
    /// unknown key-size byte, negative or overflowing seek target).
    #[error("invalid argument: {0}")]
    Arguments(&'static str),

    /// The file is not a container (prefix magic mismatch).
    #[error("not a container file")]
    Format,

    /// The container was written by an incompatible format version.
    #[error("unsupported container version {0}")]
    Version(u8),

    /// The header decrypted but its check value did not match: the password
    /// is wrong.
    ///
    /// Note: with a block cipher and no authentication tag, a wrong password
    /// and a tampered header ciphertext are indistinguishable at this layer.
    /// Wrong password is by far the most common cause.
    #[error("wrong password")]
    Password,

    /// The header's CRC over the data-key material did not match: the key
    /// envelope is corrupted and the data region must not be trusted.
    #[error("container header corrupted (key checksum mismatch)")]
    Corrupted,

    /// A cryptographic primitive failed (key derivation, cipher setup,
    /// calibration).
    #[error("crypto failure: {0}")]
    Crypto(&'static str),

    /// A mutating operation was attempted on a read-only container.
    #[error("container is read-only")]
    ReadOnly,

    /// An I/O operation on the backing file failed or came up short.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// A sync-to-disk request (`fsync` / full sync) failed. Data reached the
    /// backing file but its durability is not guaranteed.
    #[error("sync failure: {0}")]
    Sync(#[source] io::Error),

    /// Page-locked memory for key material could not be set up or accessed.
    #[error("secure memory unavailable: {0}")]
    Memory(#[from] KeyAccessError),

    /// An internal invariant was violated. Indicates a bug in this crate.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

impl From<Error> for io::Error {
    /// Convert into an [`io::Error`] for the `std::io` trait adapters.
    ///
    /// A wrapped I/O failure is returned as-is; everything else is carried
    /// as the error source with a best-fit [`io::ErrorKind`].
    fn from(err: Error) -> Self {
        match err {
            Error::Io(source) => source,
            Error::Arguments(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            Error::Format | Error::Version(_) | Error::Corrupted => {
                io::Error::new(io::ErrorKind::InvalidData, err)
            }
            Error::Password | Error::ReadOnly => {
                io::Error::new(io::ErrorKind::PermissionDenied, err)
            }
            Error::Crypto(_) | Error::Sync(_) | Error::Memory(_) | Error::Internal(_) => {
                io::Error::other(err)
            }
        }
    }
}
