//! Encrypted file containers.
//!
//! A [`Container`] looks like an ordinary seekable file (create or open,
//! then read, write, seek, truncate, flush, close), but every byte of
//! payload reaching the backing file is AES-XTS ciphertext. The logical
//! byte stream is mapped onto 256-byte encrypted sectors behind a single
//! clear-text cache window, so partial overwrites and extensions never
//! re-encrypt unrelated regions.
//!
//! A container handle is a single-threaded, single-writer object: methods
//! take `&mut self` and there is no internal locking. The one documented
//! exception is [`Container::impersonate`], which borrows the source
//! container shared; it reads only fields that never change after
//! construction.

mod cache;

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

use rand::RngCore;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::crypto::keys::ContainerKeys;
use crate::crypto::{KeySize, SectorCipher, decrypt_header_block, encrypt_header_block, kdf};
use crate::error::Error;
use crate::format::{
    self, CACHE_SIZE, CHECK, DATA_OFFSET, FORMAT_VERSION, HEADER_OFFSET, HEADER_SIZE, MAGIC,
    PREFIX_OFFSET, PREFIX_SIZE, SECTOR_SIZE, Header, Prefix, round_down, round_up,
};

use cache::CacheWindow;

/// How far a [`Container::flush`] pushes data toward stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Encrypt buffered data out to the backing file, nothing more.
    None,
    /// Also `fsync` the backing file.
    Normal,
    /// Also ask the drive to flush its own buffers (`F_FULLFSYNC` on
    /// macOS). Falls back to [`SyncMode::Normal`] where unsupported.
    Full,
}

/// A random-access encrypted file container.
///
/// See the [module documentation](self) for the overall model. Dropping a
/// container performs a best-effort flush; call [`Container::close`] to
/// observe flush errors.
pub struct Container {
    pub(crate) file: File,
    pub(crate) read_only: bool,
    pub(crate) prefix: Prefix,
    pub(crate) header: Header,
    pub(crate) header_dirty: bool,
    pub(crate) key_size: KeySize,
    pub(crate) keys: ContainerKeys,
    pub(crate) cipher: SectorCipher,
    /// Physical length of the data region on disk, always a whole number
    /// of sectors. Lags `header.data_len` while writes sit in the cache.
    pub(crate) file_data_len: u64,
    /// Current logical offset for read/write.
    pub(crate) offset: u64,
    pub(crate) cache: CacheWindow,
    closed: bool,
}

impl Container {
    /// Probe whether `path` looks like a container file, without touching
    /// any key material.
    ///
    /// Checks that the file opens, the prefix magic matches and a full
    /// header is present. Never reports an error; any failure is `false`.
    pub fn can_open<P: AsRef<Path>>(path: P) -> bool {
        fn probe(path: &Path) -> Option<()> {
            let file = File::open(path).ok()?;
            let mut prefix_bytes = [0u8; PREFIX_SIZE];
            file.read_exact_at(&mut prefix_bytes, PREFIX_OFFSET).ok()?;
            if Prefix::decode(&prefix_bytes).magic != MAGIC {
                return None;
            }
            let mut header_bytes = [0u8; HEADER_SIZE];
            file.read_exact_at(&mut header_bytes, HEADER_OFFSET).ok()?;
            Some(())
        }
        probe(path.as_ref()).is_some()
    }

    /// Create a new container at `path`, protected by `password`.
    ///
    /// Generates a random salt and header IV, calibrates the key-derivation
    /// round count for this host (~100 ms of derivation work), derives the
    /// header key, and seeds random XTS data keys. On any failure the
    /// half-written file is removed.
    #[instrument(level = "debug", skip(path, password), fields(path = %path.as_ref().display()))]
    pub fn create<P: AsRef<Path>>(
        path: P,
        password: &str,
        key_size: KeySize,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        if password.is_empty() {
            return Err(Error::Arguments("empty password"));
        }
        if path.as_os_str().is_empty() {
            return Err(Error::Arguments("empty path"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .open(path)?;

        let result = (|| {
            let mut password_salt = [0u8; format::SALT_SIZE];
            rand::rng().fill_bytes(&mut password_salt);

            let password_rounds = kdf::calibrate_rounds(password.len(), key_size.key_len())?;

            let mut header_iv = [0u8; format::IV_SIZE];
            rand::rng().fill_bytes(&mut header_iv);

            let mut header_key = Zeroizing::new([0u8; 32]);
            kdf::derive_key(
                password,
                &password_salt,
                password_rounds,
                &mut header_key[..key_size.key_len()],
            );

            let prefix = Prefix {
                magic: MAGIC,
                version: FORMAT_VERSION,
                key_size: key_size.to_wire(),
                password_salt,
                password_rounds,
                header_iv,
            };
            Self::init_new(file, prefix, &header_key, key_size)
        })();

        match result {
            Ok(container) => {
                debug!("created container");
                Ok(container)
            }
            Err(err) => {
                let _ = std::fs::remove_file(path);
                Err(err)
            }
        }
    }

    /// Create a sibling container at `path` that opens with the same
    /// password as `self`, but has its own fresh data keys.
    ///
    /// The prefix (salt, rounds, IV) and the derived header key are copied
    /// bit for bit, which is what makes the shared password work. It also
    /// means knowledge of one container's header key is knowledge of the
    /// other's. The data keys are independent random values.
    ///
    /// This method only reads fields that are immutable after construction
    /// (`&self`, no cache or cursor state), so it is safe to call while
    /// I/O is in flight on the source elsewhere.
    #[instrument(level = "debug", skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn impersonate<P: AsRef<Path>>(&self, path: P) -> Result<Container, Error> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::Arguments("empty path"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .open(path)?;

        let result = (|| {
            let header_key = self.keys.header_key_bytes()?;
            Self::init_new(file, self.prefix.clone(), &header_key, self.key_size)
        })();

        match result {
            Ok(container) => {
                debug!("created impersonated container");
                Ok(container)
            }
            Err(err) => {
                let _ = std::fs::remove_file(path);
                Err(err)
            }
        }
    }

    /// Create a container with a one-time random header key: no password,
    /// not reopenable. Useful as an encrypted scratch file.
    ///
    /// With `path: None` the file is created at a unique temporary path and
    /// unlinked before this function returns, giving delete-on-close
    /// semantics: the data never outlives the handle.
    pub fn create_volatile<P: AsRef<Path>>(
        path: Option<P>,
        key_size: KeySize,
    ) -> Result<Self, Error> {
        match path {
            Some(path) => {
                let path = path.as_ref();
                if path.as_os_str().is_empty() {
                    return Err(Error::Arguments("empty path"));
                }
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .mode(0o666)
                    .open(path)?;
                match Self::init_volatile(file, key_size) {
                    Ok(container) => Ok(container),
                    Err(err) => {
                        let _ = std::fs::remove_file(path);
                        Err(err)
                    }
                }
            }
            None => {
                let file = tempfile::tempfile()?;
                Self::init_volatile(file, key_size)
            }
        }
    }

    fn init_volatile(file: File, key_size: KeySize) -> Result<Self, Error> {
        let mut header_iv = [0u8; format::IV_SIZE];
        rand::rng().fill_bytes(&mut header_iv);

        let mut header_key = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(header_key.as_mut());

        let prefix = Prefix {
            magic: MAGIC,
            version: FORMAT_VERSION,
            key_size: key_size.to_wire(),
            password_salt: [0u8; format::SALT_SIZE],
            password_rounds: 0,
            header_iv,
        };
        let container = Self::init_new(file, prefix, &header_key, key_size)?;
        debug!("created volatile container");
        Ok(container)
    }

    /// Shared tail of the create family: seed data keys, build the cipher,
    /// persist prefix and header.
    fn init_new(
        file: File,
        prefix: Prefix,
        header_key: &Zeroizing<[u8; 32]>,
        key_size: KeySize,
    ) -> Result<Self, Error> {
        let mut xts_key = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(xts_key.as_mut());
        let mut xts_tweak = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(xts_tweak.as_mut());

        let header = Header {
            check: CHECK,
            crc32: format::key_material_crc(&xts_key, &xts_tweak),
            data_len: 0,
        };
        let cipher = SectorCipher::new(&xts_key, &xts_tweak, key_size);
        let keys = ContainerKeys::new(header_key, &xts_key, &xts_tweak)?;

        let mut container = Container {
            file,
            read_only: false,
            prefix,
            header,
            header_dirty: false,
            key_size,
            keys,
            cipher,
            file_data_len: 0,
            offset: 0,
            cache: CacheWindow::new(),
            closed: false,
        };
        container.prefix_write()?;
        container.header_write()?;
        Ok(container)
    }

    /// Open an existing container.
    ///
    /// Validates the prefix (magic, version, key size), derives the header
    /// key with the recorded salt and rounds, decrypts the header and
    /// checks the password oracle, then the CRC over the key material.
    #[instrument(level = "debug", skip(path, password), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(
        path: P,
        password: &str,
        read_only: bool,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        if password.is_empty() {
            return Err(Error::Arguments("empty password"));
        }
        if path.as_os_str().is_empty() {
            return Err(Error::Arguments("empty path"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;

        let mut prefix_bytes = [0u8; PREFIX_SIZE];
        file.read_exact_at(&mut prefix_bytes, PREFIX_OFFSET)?;
        let prefix = Prefix::decode(&prefix_bytes);

        if prefix.magic != MAGIC {
            return Err(Error::Format);
        }
        if prefix.version != FORMAT_VERSION {
            return Err(Error::Version(prefix.version));
        }
        let key_size =
            KeySize::from_wire(prefix.key_size).ok_or(Error::Arguments("unknown key size"))?;

        let mut header_key = Zeroizing::new([0u8; 32]);
        kdf::derive_key(
            password,
            &prefix.password_salt,
            prefix.password_rounds,
            &mut header_key[..key_size.key_len()],
        );

        let mut header_ciphertext = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut header_ciphertext, HEADER_OFFSET)?;
        let plain = decrypt_header_block(
            &header_key[..key_size.key_len()],
            key_size,
            &prefix.header_iv,
            &header_ciphertext,
        )?;
        let decoded = format::decode_header(&plain);

        if decoded.header.check != CHECK {
            warn!("header check mismatch: wrong password");
            return Err(Error::Password);
        }
        if decoded.header.crc32 != format::key_material_crc(&decoded.xts_key, &decoded.xts_tweak)
        {
            warn!("header key material failed its checksum");
            return Err(Error::Corrupted);
        }

        let cipher = SectorCipher::new(&decoded.xts_key, &decoded.xts_tweak, key_size);
        let keys = ContainerKeys::new(&header_key, &decoded.xts_key, &decoded.xts_tweak)?;
        let file_data_len = round_up(decoded.header.data_len, SECTOR_SIZE as u64);

        debug!(data_len = decoded.header.data_len, "opened container");
        Ok(Container {
            file,
            read_only,
            prefix,
            header: decoded.header,
            header_dirty: false,
            key_size,
            keys,
            cipher,
            file_data_len,
            offset: 0,
            cache: CacheWindow::new(),
            closed: false,
        })
    }

    /// Flush everything and tear the container down, reporting flush
    /// failures that [`Drop`] would swallow.
    pub fn close(mut self) -> Result<(), Error> {
        self.closed = true;
        let result = self.flush(SyncMode::Normal);
        debug!("closed container");
        result
    }

    /// Re-derive the header key from `new_password` (same salt, same round
    /// count) and rewrite the header in place. The data keys never change,
    /// so no payload is re-encrypted.
    #[instrument(level = "debug", skip(self, new_password))]
    pub fn change_password(&mut self, new_password: &str) -> Result<(), Error> {
        if new_password.is_empty() {
            return Err(Error::Arguments("empty password"));
        }
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let mut header_key = Zeroizing::new([0u8; 32]);
        kdf::derive_key(
            new_password,
            &self.prefix.password_salt,
            self.prefix.password_rounds,
            &mut header_key[..self.key_size.key_len()],
        );
        self.keys.set_header_key(&header_key)?;
        self.header_write()?;
        debug!("changed container password");
        Ok(())
    }

    /// Logical size of the contained data in bytes.
    pub fn len(&self) -> u64 {
        self.header.data_len
    }

    pub fn is_empty(&self) -> bool {
        self.header.data_len == 0
    }

    /// Current read/write offset.
    pub fn position(&self) -> u64 {
        self.offset
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// AES key size this container was created with.
    pub fn key_size(&self) -> KeySize {
        self.key_size
    }

    /// Move the read/write offset. Seeking past the end is allowed; the
    /// gap materializes (as zeros) only when something is written there.
    pub fn seek(&mut self, pos: io::SeekFrom) -> Result<u64, Error> {
        let target = match pos {
            io::SeekFrom::Start(offset) => i128::from(offset),
            io::SeekFrom::Current(delta) => i128::from(self.offset) + i128::from(delta),
            io::SeekFrom::End(delta) => i128::from(self.header.data_len) + i128::from(delta),
        };
        if target < 0 {
            return Err(Error::Arguments("seek before start of file"));
        }
        if target > i128::from(i64::MAX) {
            return Err(Error::Arguments("seek offset overflow"));
        }
        self.offset = target as u64;
        Ok(self.offset)
    }

    /// Read up to `buf.len()` bytes at the current offset.
    ///
    /// Returns the number of bytes read: the full request unless the end of
    /// the data is reached first, `0` at end-of-file. On failure the offset
    /// is restored to its pre-call value.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.offset >= self.header.data_len {
            return Ok(0);
        }
        let total = (buf.len() as u64).min(self.header.data_len - self.offset) as usize;
        if total == 0 {
            return Ok(0);
        }

        let saved_offset = self.offset;
        let mut filled = 0usize;
        while filled < total {
            if let Err(err) = self.cache_prepare_read() {
                self.offset = saved_offset;
                return Err(err);
            }

            // Overlap between the remaining request and the window.
            let start = self.offset.max(self.cache.offset);
            let end = (self.offset + (total - filled) as u64).min(self.cache.end());
            if end <= start {
                self.offset = saved_offset;
                return Err(Error::Internal("cache window missed the read offset"));
            }

            let n = (end - start) as usize;
            let src = (start - self.cache.offset) as usize;
            buf[filled..filled + n].copy_from_slice(&self.cache.clear[src..src + n]);
            filled += n;
            self.offset += n as u64;
        }
        Ok(total)
    }

    /// Write all of `buf` at the current offset, growing the container if
    /// the write extends past the end. On failure the offset is restored to
    /// its pre-call value.
    ///
    /// The bytes land in the cache window; they reach the backing file on
    /// displacement, [`Container::flush`], or close.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if buf.is_empty() {
            return Ok(());
        }

        let saved_offset = self.offset;
        let mut rest = buf;
        while !rest.is_empty() {
            if let Err(err) = self.cache_prepare_write() {
                self.offset = saved_offset;
                return Err(err);
            }

            let delta = (self.offset - self.cache.offset) as usize;
            let n = rest.len().min(CACHE_SIZE - delta);
            self.cache.clear[delta..delta + n].copy_from_slice(&rest[..n]);
            self.cache.dirty = true;
            self.cache.size = self.cache.size.max(delta + n);

            self.offset += n as u64;
            rest = &rest[n..];

            if self.offset > self.header.data_len {
                // Deferred: the header is rewritten on the next flush.
                self.header.data_len = self.offset;
                self.header_dirty = true;
            }
        }
        Ok(())
    }

    /// Set the logical size to `new_len`, shrinking or growing.
    ///
    /// Shrinking cuts the backing file to the new sector boundary and
    /// zero-pads the clear tail of a partial final sector, so a later grow
    /// reads zeros there. Growing fills the gap with encrypted zero
    /// sectors. The header is rewritten immediately.
    pub fn truncate(&mut self, new_len: u64) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if new_len == self.header.data_len {
            return Ok(());
        }

        let round_len = round_up(new_len, SECTOR_SIZE as u64);
        if round_len < self.file_data_len {
            self.file.set_len(DATA_OFFSET + round_len)?;
            self.file_data_len = round_len;
        } else {
            self.fill_gap_to(round_len)?;
        }

        // Zero the clear bytes between the new end and the sector boundary.
        if new_len < self.file_data_len {
            let sector_start = round_down(new_len, SECTOR_SIZE as u64);
            if sector_start != new_len {
                let index = sector_start / SECTOR_SIZE as u64;
                let mut sector = Zeroizing::new([0u8; SECTOR_SIZE]);
                self.file
                    .read_exact_at(sector.as_mut_slice(), DATA_OFFSET + sector_start)?;
                self.cipher.decrypt_sector(sector.as_mut_slice(), index);
                let keep = (new_len - sector_start) as usize;
                sector[keep..].fill(0);
                self.cipher.encrypt_sector(sector.as_mut_slice(), index);
                self.file
                    .write_all_at(sector.as_slice(), DATA_OFFSET + sector_start)?;
            }
        }

        // Keep the cache window consistent with the shrink.
        if new_len < self.header.data_len {
            if self.cache.offset >= new_len {
                self.cache.invalidate();
            } else if self.cache.end() > new_len {
                self.cache.size = (new_len - self.cache.offset) as usize;
            }
        }

        self.set_data_len(new_len, true)?;
        debug!(new_len, "truncated container");
        Ok(())
    }

    /// Encrypt buffered data out to the backing file and, depending on
    /// `sync`, push it toward stable storage.
    pub fn flush(&mut self, sync: SyncMode) -> Result<(), Error> {
        self.flush_buffers()?;
        match sync {
            SyncMode::None => Ok(()),
            SyncMode::Full => {
                if full_sync(&self.file) {
                    return Ok(());
                }
                // Full sync unsupported or refused by the platform.
                self.file.sync_all().map_err(Error::Sync)
            }
            SyncMode::Normal => self.file.sync_all().map_err(Error::Sync),
        }
    }

    /// Write back the cache window and a dirty header, without syncing.
    pub(crate) fn flush_buffers(&mut self) -> Result<(), Error> {
        self.cache_flush()?;
        self.header_flush()
    }

    fn prefix_write(&mut self) -> Result<(), Error> {
        let bytes = self.prefix.encode();
        self.file.write_all_at(&bytes, PREFIX_OFFSET)?;
        Ok(())
    }

    /// Re-encrypt the header under the current header key and write it.
    fn header_write(&mut self) -> Result<(), Error> {
        let header = self.header;
        let key_size = self.key_size;
        let header_iv = self.prefix.header_iv;

        let plain = self
            .keys
            .with_data_keys(|xts_key, xts_tweak| format::encode_header(&header, xts_key, xts_tweak))?;
        let ciphertext = self.keys.with_header_key(|header_key| {
            encrypt_header_block(&header_key[..key_size.key_len()], key_size, &header_iv, &plain)
        })??;

        self.file.write_all_at(&ciphertext, HEADER_OFFSET)?;
        Ok(())
    }

    fn header_flush(&mut self) -> Result<(), Error> {
        if !self.header_dirty {
            return Ok(());
        }
        self.header_write()?;
        self.header_dirty = false;
        Ok(())
    }

    fn set_data_len(&mut self, len: u64, flush_now: bool) -> Result<(), Error> {
        if self.header.data_len == len {
            return Ok(());
        }
        self.header.data_len = len;
        self.header_dirty = true;
        if flush_now {
            self.header_flush()?;
        }
        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn full_sync(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    // SAFETY: F_FULLFSYNC takes no argument beyond the descriptor.
    unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) != -1 }
}

#[cfg(not(target_os = "macos"))]
fn full_sync(_file: &File) -> bool {
    false
}

impl Drop for Container {
    /// Best-effort flush for containers that were not explicitly closed.
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.flush(SyncMode::Normal) {
            warn!(error = %err, "flush on drop failed; recent writes may be lost");
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("key_size", &self.key_size)
            .field("read_only", &self.read_only)
            .field("data_len", &self.header.data_len)
            .field("offset", &self.offset)
            .field("header_dirty", &self.header_dirty)
            .field("keys", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl io::Read for Container {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Container::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for Container {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Container::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Container::flush(self, SyncMode::None).map_err(io::Error::from)
    }
}

impl io::Seek for Container {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        Container::seek(self, pos).map_err(io::Error::from)
    }
}
