//! Cryptographic primitives for the container format.
//!
//! The data region uses AES-XTS over fixed 256-byte sectors; the header
//! uses AES-CBC with no padding (its 80-byte plaintext is exactly five AES
//! blocks). Both run at the AES key size recorded in the container prefix.

pub mod kdf;
pub mod keys;

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, Key, KeyInit, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use xts_mode::Xts128;
use zeroize::Zeroizing;

use crate::error::Error;
use crate::format::{HEADER_SIZE, IV_SIZE, SECTOR_SIZE};

/// AES key size of a container, fixed at creation.
///
/// The wire encoding in the container prefix is `0`, `1`, `2` in the order
/// below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySize {
    Aes128,
    Aes192,
    Aes256,
}

impl KeySize {
    /// Key length in bytes.
    pub const fn key_len(self) -> usize {
        match self {
            KeySize::Aes128 => 16,
            KeySize::Aes192 => 24,
            KeySize::Aes256 => 32,
        }
    }

    pub(crate) const fn to_wire(self) -> u8 {
        match self {
            KeySize::Aes128 => 0,
            KeySize::Aes192 => 1,
            KeySize::Aes256 => 2,
        }
    }

    pub(crate) const fn from_wire(byte: u8) -> Option<KeySize> {
        match byte {
            0 => Some(KeySize::Aes128),
            1 => Some(KeySize::Aes192),
            2 => Some(KeySize::Aes256),
            _ => None,
        }
    }
}

/// Per-sector tweak IV: the sector index encoded big-endian in the first
/// eight bytes and little-endian in the last eight.
///
/// This derivation is an idiosyncrasy of the container format and has to be
/// reproduced exactly for existing files to decrypt.
pub(crate) fn sector_tweak(sector_index: u64) -> [u8; 16] {
    let mut tweak = [0u8; 16];
    tweak[..8].copy_from_slice(&sector_index.to_be_bytes());
    tweak[8..].copy_from_slice(&sector_index.to_le_bytes());
    tweak
}

/// XTS cipher for the data region, dispatching over the container key size.
///
/// One value serves both directions; sectors are encrypted and decrypted in
/// place, exactly one 256-byte sector per call.
pub(crate) enum SectorCipher {
    Aes128(Xts128<Aes128>),
    Aes192(Xts128<Aes192>),
    Aes256(Xts128<Aes256>),
}

impl SectorCipher {
    /// Build the cipher from the stored 32-byte key fields, using the first
    /// `key_size.key_len()` bytes of each.
    pub(crate) fn new(xts_key: &[u8; 32], xts_tweak: &[u8; 32], key_size: KeySize) -> Self {
        let len = key_size.key_len();
        match key_size {
            KeySize::Aes128 => SectorCipher::Aes128(Xts128::new(
                Aes128::new(Key::<Aes128>::from_slice(&xts_key[..len])),
                Aes128::new(Key::<Aes128>::from_slice(&xts_tweak[..len])),
            )),
            KeySize::Aes192 => SectorCipher::Aes192(Xts128::new(
                Aes192::new(Key::<Aes192>::from_slice(&xts_key[..len])),
                Aes192::new(Key::<Aes192>::from_slice(&xts_tweak[..len])),
            )),
            KeySize::Aes256 => SectorCipher::Aes256(Xts128::new(
                Aes256::new(Key::<Aes256>::from_slice(&xts_key[..len])),
                Aes256::new(Key::<Aes256>::from_slice(&xts_tweak[..len])),
            )),
        }
    }

    /// Encrypt one sector in place. `sector.len()` must be [`SECTOR_SIZE`].
    pub(crate) fn encrypt_sector(&self, sector: &mut [u8], sector_index: u64) {
        debug_assert_eq!(sector.len(), SECTOR_SIZE);
        let tweak = sector_tweak(sector_index);
        match self {
            SectorCipher::Aes128(xts) => xts.encrypt_sector(sector, tweak),
            SectorCipher::Aes192(xts) => xts.encrypt_sector(sector, tweak),
            SectorCipher::Aes256(xts) => xts.encrypt_sector(sector, tweak),
        }
    }

    /// Decrypt one sector in place. `sector.len()` must be [`SECTOR_SIZE`].
    pub(crate) fn decrypt_sector(&self, sector: &mut [u8], sector_index: u64) {
        debug_assert_eq!(sector.len(), SECTOR_SIZE);
        let tweak = sector_tweak(sector_index);
        match self {
            SectorCipher::Aes128(xts) => xts.decrypt_sector(sector, tweak),
            SectorCipher::Aes192(xts) => xts.decrypt_sector(sector, tweak),
            SectorCipher::Aes256(xts) => xts.decrypt_sector(sector, tweak),
        }
    }
}

fn cbc_encrypt<C>(
    key: &[u8],
    iv: &[u8; IV_SIZE],
    plain: &[u8; HEADER_SIZE],
) -> Result<[u8; HEADER_SIZE], Error>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    let mut out = [0u8; HEADER_SIZE];
    cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto("header cipher key setup"))?
        .encrypt_padded_b2b_mut::<NoPadding>(plain.as_slice(), &mut out)
        .map_err(|_| Error::Crypto("header encrypt"))?;
    Ok(out)
}

fn cbc_decrypt<C>(
    key: &[u8],
    iv: &[u8; IV_SIZE],
    ciphertext: &[u8; HEADER_SIZE],
) -> Result<Zeroizing<[u8; HEADER_SIZE]>, Error>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    let mut out = Zeroizing::new([0u8; HEADER_SIZE]);
    cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto("header cipher key setup"))?
        .decrypt_padded_b2b_mut::<NoPadding>(ciphertext.as_slice(), out.as_mut_slice())
        .map_err(|_| Error::Crypto("header decrypt"))?;
    Ok(out)
}

/// Encrypt the 80-byte header plaintext under the header key and prefix IV.
///
/// `key` carries exactly `key_size.key_len()` bytes.
pub(crate) fn encrypt_header_block(
    key: &[u8],
    key_size: KeySize,
    iv: &[u8; IV_SIZE],
    plain: &[u8; HEADER_SIZE],
) -> Result<[u8; HEADER_SIZE], Error> {
    debug_assert_eq!(key.len(), key_size.key_len());
    match key_size {
        KeySize::Aes128 => cbc_encrypt::<Aes128>(key, iv, plain),
        KeySize::Aes192 => cbc_encrypt::<Aes192>(key, iv, plain),
        KeySize::Aes256 => cbc_encrypt::<Aes256>(key, iv, plain),
    }
}

/// Decrypt the 80-byte header ciphertext. The plaintext carries key
/// material, so it comes back in a wipe-on-drop buffer.
pub(crate) fn decrypt_header_block(
    key: &[u8],
    key_size: KeySize,
    iv: &[u8; IV_SIZE],
    ciphertext: &[u8; HEADER_SIZE],
) -> Result<Zeroizing<[u8; HEADER_SIZE]>, Error> {
    debug_assert_eq!(key.len(), key_size.key_len());
    match key_size {
        KeySize::Aes128 => cbc_decrypt::<Aes128>(key, iv, ciphertext),
        KeySize::Aes192 => cbc_decrypt::<Aes192>(key, iv, ciphertext),
        KeySize::Aes256 => cbc_decrypt::<Aes256>(key, iv, ciphertext),
    }
}
