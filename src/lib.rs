//! Random-access encrypted file containers.
//!
//! A [`Container`] is a drop-in replacement for a plain file whose every
//! persisted byte is ciphertext at rest: data lives in 256-byte AES-XTS
//! sectors behind a small clear-text cache, so callers can seek, partially
//! overwrite, extend and truncate without re-encrypting unrelated regions.
//! The header key is derived from a password with PBKDF2-HMAC-SHA256; the
//! random data keys live inside an encrypted header and never change for
//! the life of the file, even across password changes.
//!
//! ```no_run
//! use std::io::SeekFrom;
//! use cryptofile::{Container, KeySize, SyncMode};
//!
//! let mut container = Container::create("notes.db.enc", "correct horse", KeySize::Aes256)?;
//! container.write(b"The quick brown fox")?;
//! container.flush(SyncMode::Normal)?;
//!
//! container.seek(SeekFrom::Start(4))?;
//! let mut word = [0u8; 5];
//! container.read(&mut word)?;
//! assert_eq!(&word, b"quick");
//!
//! container.close()?;
//! # Ok::<(), cryptofile::Error>(())
//! ```
//!
//! Containers also implement [`std::io::Read`], [`std::io::Write`] and
//! [`std::io::Seek`], so they slot into code written against plain files.
//!
//! Not provided: integrity protection of the data region (a flipped
//! ciphertext bit decrypts to garbage rather than an error) and sharing
//! one handle across threads.

pub mod container;
pub mod crypto;
pub mod error;
mod format;

pub use container::{Container, SyncMode};
pub use crypto::KeySize;
pub use error::Error;
