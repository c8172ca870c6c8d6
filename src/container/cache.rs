//! The clear-text cache window and the sector write-back engine.
//!
//! A container buffers at most one window of up to 16 sectors (4 KiB) of
//! *clear* data. Reads are served from the window; writes land in it and
//! are encrypted back out lazily: on displacement, explicit flush, or
//! close. The engine never writes a partial sector: a partial tail is
//! completed by decrypting the on-disk sector, overlaying the cached bytes
//! and re-encrypting the whole sector.

use std::os::unix::fs::FileExt;

use tracing::trace;
use zeroize::Zeroizing;

use crate::container::Container;
use crate::error::Error;
use crate::format::{CACHE_SIZE, DATA_OFFSET, SECTOR_SIZE, round_down, round_up};

/// A sector-aligned window of clear data.
///
/// Invariants: `offset` is a multiple of the sector size; `size` never
/// exceeds [`CACHE_SIZE`]; when `dirty`, the window content supersedes
/// whatever the corresponding disk sectors decrypt to.
pub(crate) struct CacheWindow {
    /// Clear bytes; wiped when the container goes away.
    pub(crate) clear: Zeroizing<Box<[u8]>>,
    /// Position of the window in the logical file.
    pub(crate) offset: u64,
    /// Bytes of the window currently meaningful.
    pub(crate) size: usize,
    /// Window content not yet encrypted back to disk.
    pub(crate) dirty: bool,
}

impl CacheWindow {
    pub(crate) fn new() -> Self {
        CacheWindow {
            clear: Zeroizing::new(vec![0u8; CACHE_SIZE].into_boxed_slice()),
            offset: 0,
            size: 0,
            dirty: false,
        }
    }

    /// One past the last meaningful byte of the window.
    pub(crate) fn end(&self) -> u64 {
        self.offset + self.size as u64
    }

    /// Whether a read at `offset` can be served from the window.
    pub(crate) fn contains_for_read(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }

    /// Whether a write at `offset` can land in the window as-is: inside or
    /// directly appending, with room left.
    pub(crate) fn can_accept_write(&self, offset: u64) -> bool {
        offset >= self.offset && offset <= self.end() && self.size < CACHE_SIZE
    }

    /// Drop the window content without writing it back.
    pub(crate) fn invalidate(&mut self) {
        self.dirty = false;
        self.size = 0;
    }
}

impl Container {
    /// Extend the physical data region with encrypted zero sectors up to
    /// `target` (sector-aligned), so the region stays contiguous.
    pub(crate) fn fill_gap_to(&mut self, target: u64) -> Result<(), Error> {
        if self.file_data_len >= target {
            return Ok(());
        }

        let mut sector = [0u8; SECTOR_SIZE];
        let mut offset = self.file_data_len;
        while offset < target {
            sector.fill(0);
            self.cipher
                .encrypt_sector(&mut sector, offset / SECTOR_SIZE as u64);
            self.file.write_all_at(&sector, DATA_OFFSET + offset)?;
            offset += SECTOR_SIZE as u64;
            self.file_data_len = offset;
        }

        trace!(up_to = target, "filled gap with encrypted zero sectors");
        Ok(())
    }

    /// Encrypt the dirty window back to disk as one sector-aligned write.
    pub(crate) fn cache_flush(&mut self) -> Result<(), Error> {
        if !self.cache.dirty || self.cache.size == 0 {
            return Ok(());
        }

        // Assembled ciphertext run. The suffix slot transiently holds clear
        // data during the read-modify-write, hence the wipe-on-drop buffer.
        let mut assembled = Zeroizing::new([0u8; CACHE_SIZE + SECTOR_SIZE]);

        // Whole sectors encrypt straight out of the window.
        let inner = round_down(self.cache.size as u64, SECTOR_SIZE as u64) as usize;
        for off in (0..inner).step_by(SECTOR_SIZE) {
            let index = (self.cache.offset + off as u64) / SECTOR_SIZE as u64;
            assembled[off..off + SECTOR_SIZE]
                .copy_from_slice(&self.cache.clear[off..off + SECTOR_SIZE]);
            self.cipher
                .encrypt_sector(&mut assembled[off..off + SECTOR_SIZE], index);
        }
        let mut run_len = inner;

        // A partial last sector must be completed before encryption: take
        // the existing clear content (zeros past the physical end), overlay
        // the cached bytes, and encrypt the full sector.
        let suffix = self.cache.size - inner;
        if suffix > 0 {
            let sector_offset = self.cache.offset + inner as u64;
            let index = sector_offset / SECTOR_SIZE as u64;
            let slot = &mut assembled[inner..inner + SECTOR_SIZE];

            if sector_offset + SECTOR_SIZE as u64 > self.file_data_len {
                slot.fill(0);
            } else {
                self.file.read_exact_at(slot, DATA_OFFSET + sector_offset)?;
                self.cipher.decrypt_sector(slot, index);
            }

            slot[..suffix].copy_from_slice(&self.cache.clear[inner..inner + suffix]);
            self.cipher.encrypt_sector(slot, index);
            run_len += SECTOR_SIZE;
        }

        // The physical region must be contiguous before the window lands.
        self.fill_gap_to(self.cache.offset)?;

        self.file
            .write_all_at(&assembled[..run_len], DATA_OFFSET + self.cache.offset)?;
        self.file_data_len = self
            .file_data_len
            .max(self.cache.offset + run_len as u64);
        self.cache.dirty = false;

        trace!(
            offset = self.cache.offset,
            bytes = run_len,
            "flushed cache window"
        );
        Ok(())
    }

    /// Make the window cover the current offset for reading.
    pub(crate) fn cache_prepare_read(&mut self) -> Result<(), Error> {
        if self.cache.contains_for_read(self.offset) {
            return Ok(());
        }

        self.flush_buffers()?;

        let aligned = round_down(self.offset, SECTOR_SIZE as u64);
        let data_size = round_up(self.header.data_len, SECTOR_SIZE as u64);
        let window = if aligned + CACHE_SIZE as u64 > data_size {
            data_size.saturating_sub(aligned)
        } else {
            CACHE_SIZE as u64
        };

        if window == 0 {
            self.cache.offset = aligned;
            self.cache.size = 0;
            return Ok(());
        }

        let window = window as usize;
        if aligned + window as u64 > self.file_data_len {
            // The logical file extends past the physical region with zeros.
            self.cache.clear[..window].fill(0);
        } else {
            self.file
                .read_exact_at(&mut self.cache.clear[..window], DATA_OFFSET + aligned)?;
            for off in (0..window).step_by(SECTOR_SIZE) {
                let index = (aligned + off as u64) / SECTOR_SIZE as u64;
                self.cipher
                    .decrypt_sector(&mut self.cache.clear[off..off + SECTOR_SIZE], index);
            }
        }

        self.cache.offset = aligned;
        self.cache.size = window;
        Ok(())
    }

    /// Make the window able to take a write at the current offset.
    ///
    /// A misaligned start turns the first sector into a read-modify-write
    /// target: the window is seeded with that sector's clear content so the
    /// bytes ahead of the write survive the eventual flush.
    pub(crate) fn cache_prepare_write(&mut self) -> Result<(), Error> {
        if self.cache.can_accept_write(self.offset) {
            return Ok(());
        }

        self.flush_buffers()?;

        let aligned = round_down(self.offset, SECTOR_SIZE as u64);
        let lead = (self.offset - aligned) as usize;

        if lead > 0 {
            let index = aligned / SECTOR_SIZE as u64;
            if aligned + SECTOR_SIZE as u64 > self.file_data_len {
                self.cache.clear[..SECTOR_SIZE].fill(0);
            } else {
                self.file
                    .read_exact_at(&mut self.cache.clear[..SECTOR_SIZE], DATA_OFFSET + aligned)?;
                self.cipher
                    .decrypt_sector(&mut self.cache.clear[..SECTOR_SIZE], index);
            }
            self.cache.offset = aligned;
            self.cache.size = SECTOR_SIZE;
        } else {
            self.cache.offset = aligned;
            self.cache.size = 0;
        }
        Ok(())
    }
}
