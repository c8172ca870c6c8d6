//! On-disk layout of a container file.
//!
//! A container is three regions back to back:
//!
//! ```text
//! offset 0    Prefix    42 bytes, clear, packed little-endian
//! offset 42   Header    80 bytes, AES-CBC ciphertext (no padding)
//! offset 122  Data      256-byte AES-XTS sectors, numbered from 0
//! ```
//!
//! The prefix carries everything needed to re-derive the header key from a
//! password (salt, round count) plus the header IV. The header carries the
//! data keys, the logical data length, a check value acting as the
//! password-correctness oracle, and a CRC over the key material to detect
//! corruption. All multi-byte integers are little-endian on disk.

use zeroize::Zeroizing;

/// Marks a file as a container. First four bytes on disk.
pub(crate) const MAGIC: u32 = 0xC3160FF4;

/// Expected value of [`Header::check`] after a successful decrypt.
pub(crate) const CHECK: u32 = 0xB4D9E5AC;

/// The only on-disk format version this crate reads or writes.
pub(crate) const FORMAT_VERSION: u8 = 1;

pub(crate) const SALT_SIZE: usize = 16;
pub(crate) const IV_SIZE: usize = 16;

/// Unit of XTS encryption: 16 AES blocks.
pub(crate) const SECTOR_SIZE: usize = 256;

/// Clear-text cache window: 16 sectors.
pub(crate) const CACHE_SIZE: usize = 4096;

pub(crate) const PREFIX_SIZE: usize = 42;

/// Header plaintext and ciphertext size: exactly 5 AES blocks, so CBC with
/// no padding maps it 1:1.
pub(crate) const HEADER_SIZE: usize = 80;

pub(crate) const PREFIX_OFFSET: u64 = 0;
pub(crate) const HEADER_OFFSET: u64 = PREFIX_SIZE as u64;
pub(crate) const DATA_OFFSET: u64 = HEADER_OFFSET + HEADER_SIZE as u64;

/// Round `value` up to a multiple of `step`. `step` must be a power of two.
pub(crate) const fn round_up(value: u64, step: u64) -> u64 {
    (value + (step - 1)) & !(step - 1)
}

/// Round `value` down to a multiple of `step`. `step` must be a power of two.
pub(crate) const fn round_down(value: u64, step: u64) -> u64 {
    value & !(step - 1)
}

/// The clear, fixed-layout region at the start of every container file.
#[derive(Debug, Clone)]
pub(crate) struct Prefix {
    pub magic: u32,
    pub version: u8,
    /// Raw key-size byte (0 = AES-128, 1 = AES-192, 2 = AES-256). Kept
    /// unvalidated here; the container validates it on open.
    pub key_size: u8,
    /// Salt for deriving the header key from a password. All zero for
    /// volatile containers.
    pub password_salt: [u8; SALT_SIZE],
    /// PBKDF2 round count recorded at creation. Zero for volatile
    /// containers.
    pub password_rounds: u32,
    /// IV for the AES-CBC header encryption.
    pub header_iv: [u8; IV_SIZE],
}

impl Prefix {
    pub(crate) fn encode(&self) -> [u8; PREFIX_SIZE] {
        let mut out = [0u8; PREFIX_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4] = self.version;
        out[5] = self.key_size;
        out[6..22].copy_from_slice(&self.password_salt);
        out[22..26].copy_from_slice(&self.password_rounds.to_le_bytes());
        out[26..42].copy_from_slice(&self.header_iv);
        out
    }

    pub(crate) fn decode(bytes: &[u8; PREFIX_SIZE]) -> Self {
        let mut password_salt = [0u8; SALT_SIZE];
        password_salt.copy_from_slice(&bytes[6..22]);
        let mut header_iv = [0u8; IV_SIZE];
        header_iv.copy_from_slice(&bytes[26..42]);
        Prefix {
            magic: u32::from_le_bytes(bytes[0..4].try_into().expect("4-byte slice")),
            version: bytes[4],
            key_size: bytes[5],
            password_salt,
            password_rounds: u32::from_le_bytes(bytes[22..26].try_into().expect("4-byte slice")),
            header_iv,
        }
    }
}

/// The in-RAM, non-secret part of the encrypted header.
///
/// The XTS key material that shares the 80-byte header plaintext lives in
/// [`ContainerKeys`](crate::crypto::keys::ContainerKeys) and only meets
/// these fields inside [`encode_header`] / [`decode_header`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    /// Password-correctness oracle; must equal [`CHECK`] after decrypt.
    pub check: u32,
    /// CRC32 over `xts_key ‖ xts_tweak`.
    pub crc32: u32,
    /// Logical data length as seen by the caller.
    pub data_len: u64,
}

/// A decrypted header, with the key material in wipe-on-drop buffers.
pub(crate) struct DecodedHeader {
    pub header: Header,
    pub xts_key: Zeroizing<[u8; 32]>,
    pub xts_tweak: Zeroizing<[u8; 32]>,
}

/// Assemble the 80-byte header plaintext.
pub(crate) fn encode_header(
    header: &Header,
    xts_key: &[u8; 32],
    xts_tweak: &[u8; 32],
) -> Zeroizing<[u8; HEADER_SIZE]> {
    let mut out = Zeroizing::new([0u8; HEADER_SIZE]);
    out[0..4].copy_from_slice(&header.check.to_le_bytes());
    out[4..8].copy_from_slice(&header.crc32.to_le_bytes());
    out[8..16].copy_from_slice(&header.data_len.to_le_bytes());
    out[16..48].copy_from_slice(xts_key);
    out[48..80].copy_from_slice(xts_tweak);
    out
}

/// Split the 80-byte header plaintext back into fields.
pub(crate) fn decode_header(bytes: &[u8; HEADER_SIZE]) -> DecodedHeader {
    let mut xts_key = Zeroizing::new([0u8; 32]);
    xts_key.copy_from_slice(&bytes[16..48]);
    let mut xts_tweak = Zeroizing::new([0u8; 32]);
    xts_tweak.copy_from_slice(&bytes[48..80]);
    DecodedHeader {
        header: Header {
            check: u32::from_le_bytes(bytes[0..4].try_into().expect("4-byte slice")),
            crc32: u32::from_le_bytes(bytes[4..8].try_into().expect("4-byte slice")),
            data_len: u64::from_le_bytes(bytes[8..16].try_into().expect("8-byte slice")),
        },
        xts_key,
        xts_tweak,
    }
}

/// CRC32 over the concatenated XTS key material, as stored in
/// [`Header::crc32`]. Always covers the full 32-byte fields regardless of
/// the AES key size in use.
pub(crate) fn key_material_crc(xts_key: &[u8; 32], xts_tweak: &[u8; 32]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(xts_key);
    hasher.update(xts_tweak);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn layout_constants_are_consistent() {
        assert_eq!(PREFIX_SIZE, 4 + 1 + 1 + SALT_SIZE + 4 + IV_SIZE);
        assert_eq!(HEADER_SIZE % 16, 0, "header must be whole AES blocks");
        assert_eq!(CACHE_SIZE % SECTOR_SIZE, 0);
        assert_eq!(DATA_OFFSET, 122);
    }

    #[test]
    fn prefix_encodes_little_endian_at_fixed_offsets() {
        let prefix = Prefix {
            magic: MAGIC,
            version: FORMAT_VERSION,
            key_size: 2,
            password_salt: [0xAA; SALT_SIZE],
            password_rounds: 0x01020304,
            header_iv: [0xBB; IV_SIZE],
        };
        let bytes = prefix.encode();
        assert_eq!(&bytes[0..4], &hex!("F40F16C3"));
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 2);
        assert_eq!(&bytes[6..22], &[0xAA; 16]);
        assert_eq!(&bytes[22..26], &hex!("04030201"));
        assert_eq!(&bytes[26..42], &[0xBB; 16]);

        let back = Prefix::decode(&bytes);
        assert_eq!(back.magic, MAGIC);
        assert_eq!(back.password_rounds, 0x01020304);
        assert_eq!(back.header_iv, prefix.header_iv);
    }

    #[test]
    fn header_round_trips_through_plaintext_layout() {
        let header = Header {
            check: CHECK,
            crc32: 0xDEADBEEF,
            data_len: 0x1122334455667788,
        };
        let key = [0x11; 32];
        let tweak = [0x22; 32];
        let bytes = encode_header(&header, &key, &tweak);
        assert_eq!(&bytes[0..4], &hex!("ACE5D9B4"));
        assert_eq!(&bytes[8..16], &hex!("8877665544332211"));

        let decoded = decode_header(&bytes);
        assert_eq!(decoded.header.check, CHECK);
        assert_eq!(decoded.header.crc32, 0xDEADBEEF);
        assert_eq!(decoded.header.data_len, header.data_len);
        assert_eq!(*decoded.xts_key, key);
        assert_eq!(*decoded.xts_tweak, tweak);
    }

    #[test]
    fn crc_matches_known_vector() {
        // CRC-32/ISO-HDLC check value for "123456789".
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF43926);

        // Streaming over two updates equals hashing the concatenation.
        let key = [0x5A; 32];
        let tweak = [0xA5; 32];
        let mut concat = Vec::new();
        concat.extend_from_slice(&key);
        concat.extend_from_slice(&tweak);
        assert_eq!(key_material_crc(&key, &tweak), crc32fast::hash(&concat));
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round_up(0, 256), 0);
        assert_eq!(round_up(1, 256), 256);
        assert_eq!(round_up(256, 256), 256);
        assert_eq!(round_up(257, 256), 512);
        assert_eq!(round_down(255, 256), 0);
        assert_eq!(round_down(256, 256), 256);
        assert_eq!(round_down(511, 256), 256);
    }
}
