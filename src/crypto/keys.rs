//! Page-locked storage for container key material.
//!
//! A container carries three long-lived secrets: the header key derived
//! from the password, and the XTS data key and tweak key stored inside the
//! encrypted header. All three live in a single `MemSafe` allocation, which
//! keeps them page-aligned, `mlock`ed out of swap, excluded from core dumps
//! where the platform supports it, and zeroed on drop. If the platform
//! cannot provide page locking, construction fails and the container
//! reports the memory error kind instead of silently degrading.
//!
//! Access is scoped: callers pass a closure, the memory is made readable
//! for its duration, and nothing key-shaped escapes.

use std::fmt;
use std::sync::RwLock;

use memsafe::MemSafe;
use thiserror::Error;
use zeroize::Zeroizing;

/// Error type for key access operations.
///
/// Raised when the protected key memory cannot be set up or read, or when
/// a thread panicked while holding the key lock.
#[derive(Debug, Error)]
pub enum KeyAccessError {
    /// Memory protection operation failed (mlock, mprotect, etc.)
    #[error("memory protection operation failed: {0}")]
    MemoryProtection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Lock was poisoned (a thread panicked while holding it)
    #[error("key lock was poisoned")]
    LockPoisoned,
}

impl KeyAccessError {
    /// Create a memory protection error from any error type.
    pub fn memory_protection<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        KeyAccessError::MemoryProtection(Box::new(err))
    }
}

const HEADER_KEY: std::ops::Range<usize> = 0..32;
const XTS_KEY: std::ops::Range<usize> = 32..64;
const XTS_TWEAK: std::ops::Range<usize> = 64..96;

/// All of a container's key material in one page-locked allocation.
///
/// Layout: `header_key[32] ‖ xts_key[32] ‖ xts_tweak[32]`. The header key
/// field is always 32 bytes; for AES-128/192 containers only its first
/// 16/24 bytes are meaningful and the rest stay zero, matching the on-disk
/// header layout which stores full 32-byte fields regardless of key size.
pub(crate) struct ContainerKeys {
    material: RwLock<MemSafe<[u8; 96]>>,
}

// SAFETY: ContainerKeys can be sent between threads because all access to
// the underlying MemSafe goes through the RwLock, the raw pointer inside
// MemSafe points to memory valid from any thread, and the protection
// syscalls (mlock, mprotect) are thread-safe.
unsafe impl Send for ContainerKeys {}

// SAFETY: shared access is synchronized by the RwLock; the raw pointer in
// MemSafe is never dereferenced without holding it.
unsafe impl Sync for ContainerKeys {}

impl ContainerKeys {
    /// Move the three secrets into protected memory.
    ///
    /// The caller should hand over wipe-on-drop buffers; this function only
    /// copies out of them.
    pub(crate) fn new(
        header_key: &[u8; 32],
        xts_key: &[u8; 32],
        xts_tweak: &[u8; 32],
    ) -> Result<Self, KeyAccessError> {
        let mut material = Zeroizing::new([0u8; 96]);
        material[HEADER_KEY].copy_from_slice(header_key);
        material[XTS_KEY].copy_from_slice(xts_key);
        material[XTS_TWEAK].copy_from_slice(xts_tweak);
        Ok(ContainerKeys {
            material: RwLock::new(
                MemSafe::new(*material).map_err(KeyAccessError::memory_protection)?,
            ),
        })
    }

    /// Run `f` with the 32-byte header-key field.
    pub(crate) fn with_header_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        self.with_material(|material| {
            let key: &[u8; 32] = material[HEADER_KEY].try_into().expect("32-byte field");
            f(key)
        })
    }

    /// Run `f` with the XTS data key and tweak key fields.
    pub(crate) fn with_data_keys<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 32], &[u8; 32]) -> R,
    {
        self.with_material(|material| {
            let key: &[u8; 32] = material[XTS_KEY].try_into().expect("32-byte field");
            let tweak: &[u8; 32] = material[XTS_TWEAK].try_into().expect("32-byte field");
            f(key, tweak)
        })
    }

    /// Copy the header key out into a wipe-on-drop buffer.
    ///
    /// Used by impersonation, which seeds a sibling container with the same
    /// header key.
    pub(crate) fn header_key_bytes(&self) -> Result<Zeroizing<[u8; 32]>, KeyAccessError> {
        self.with_header_key(|key| Zeroizing::new(*key))
    }

    /// Replace the header key, keeping the data keys. Used by password
    /// changes; the data keys never rotate.
    pub(crate) fn set_header_key(&self, new_key: &[u8; 32]) -> Result<(), KeyAccessError> {
        let mut lock = self
            .material
            .write()
            .map_err(|_| KeyAccessError::LockPoisoned)?;

        let mut material = Zeroizing::new({
            let guard = lock.read().map_err(KeyAccessError::memory_protection)?;
            *guard
        });
        material[HEADER_KEY].copy_from_slice(new_key);

        *lock = MemSafe::new(*material).map_err(KeyAccessError::memory_protection)?;
        Ok(())
    }

    fn with_material<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 96]) -> R,
    {
        let mut lock = self
            .material
            .write()
            .map_err(|_| KeyAccessError::LockPoisoned)?;
        let guard = lock.read().map_err(KeyAccessError::memory_protection)?;
        Ok(f(&*guard))
    }
}

impl fmt::Debug for ContainerKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerKeys")
            .field("material", &"[REDACTED]")
            .finish()
    }
}
