//! Word-granular access to a memory-mapped register window.
//!
//! The FPGA register file shows up as a block of 32-bit words in physical
//! memory. [`DevMem`] maps that block through `/dev/mem` with `O_SYNC` so
//! every access goes to the fabric rather than the page cache, and
//! [`MockMem`] backs the same interface with a plain vector for tests.

use std::fs::File;
use std::os::unix::fs::OpenOptionsExt;

use memmap2::{MmapMut, MmapOptions};
use nix::libc::O_SYNC;

use crate::error::{Error, Result};

/// Word-granular access to a register window. Offsets are in bytes and must
/// be word-aligned.
pub trait WordAccess {
    /// Read `count` consecutive 32-bit words starting at byte `offset`.
    fn read(&self, offset: usize, count: usize) -> Result<Vec<u32>>;

    /// Write consecutive 32-bit words starting at byte `offset`.
    fn write(&mut self, offset: usize, words: &[u32]) -> Result<()>;

    fn read_word(&self, offset: usize) -> Result<u32> {
        Ok(self.read(offset, 1)?[0])
    }

    fn write_word(&mut self, offset: usize, word: u32) -> Result<()> {
        self.write(offset, &[word])
    }
}

fn check_bounds(offset: usize, count: usize, length: usize) -> Result<()> {
    if offset % 4 != 0 || offset + count * 4 > length {
        return Err(Error::OutOfBounds {
            offset,
            count,
            length,
        });
    }
    Ok(())
}

/// A window of physical memory mapped through `/dev/mem`.
pub struct DevMem {
    mem: MmapMut,
    length: usize,
}

impl DevMem {
    /// Map `length` bytes of physical memory starting at `base`.
    ///
    /// # Errors
    /// Returns [`Error::PermissionDenied`] when the process may not open
    /// `/dev/mem`, and IO errors from the mapping itself.
    pub fn open(base: u64, length: usize) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .custom_flags(O_SYNC)
            .open("/dev/mem")
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    Error::PermissionDenied
                } else {
                    Error::Io(e)
                }
            })?;
        let mem = unsafe { MmapOptions::new().len(length).offset(base).map_mut(&file)? };
        Ok(Self { mem, length })
    }
}

impl WordAccess for DevMem {
    fn read(&self, offset: usize, count: usize) -> Result<Vec<u32>> {
        check_bounds(offset, count, self.length)?;
        let base = self.mem.as_ptr();
        let mut words = Vec::with_capacity(count);
        for i in 0..count {
            // Volatile so the compiler can't elide or reorder fabric reads.
            let word =
                unsafe { (base.add(offset + i * 4) as *const u32).read_volatile() };
            words.push(word);
        }
        Ok(words)
    }

    fn write(&mut self, offset: usize, words: &[u32]) -> Result<()> {
        check_bounds(offset, words.len(), self.length)?;
        let base = self.mem.as_mut_ptr();
        for (i, word) in words.iter().enumerate() {
            unsafe { (base.add(offset + i * 4) as *mut u32).write_volatile(*word) };
        }
        Ok(())
    }
}

/// A register window backed by ordinary memory, for tests.
#[derive(Debug, Clone)]
pub struct MockMem {
    words: Vec<u32>,
}

impl MockMem {
    /// A zeroed window of `length` bytes.
    pub fn new(length: usize) -> Self {
        Self {
            words: vec![0; length / 4],
        }
    }
}

impl WordAccess for MockMem {
    fn read(&self, offset: usize, count: usize) -> Result<Vec<u32>> {
        check_bounds(offset, count, self.words.len() * 4)?;
        let start = offset / 4;
        Ok(self.words[start..start + count].to_vec())
    }

    fn write(&mut self, offset: usize, words: &[u32]) -> Result<()> {
        check_bounds(offset, words.len(), self.words.len() * 4)?;
        let start = offset / 4;
        self.words[start..start + words.len()].copy_from_slice(words);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_round_trips_words() {
        let mut mem = MockMem::new(64);
        mem.write(8, &[0xDEAD_BEEF, 0xCAFE_F00D]).unwrap();
        assert_eq!(mem.read(8, 2).unwrap(), vec![0xDEAD_BEEF, 0xCAFE_F00D]);
        assert_eq!(mem.read_word(12).unwrap(), 0xCAFE_F00D);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut mem = MockMem::new(16);
        assert!(matches!(
            mem.read(12, 2),
            Err(Error::OutOfBounds { offset: 12, count: 2, length: 16 })
        ));
        assert!(matches!(
            mem.write(16, &[0]),
            Err(Error::OutOfBounds { .. })
        ));
        // A misaligned offset is rejected even when in range.
        assert!(matches!(mem.read(2, 1), Err(Error::OutOfBounds { .. })));
    }

    #[test]
    fn in_bounds_edge_is_accepted() {
        let mut mem = MockMem::new(16);
        mem.write(12, &[7]).unwrap();
        assert_eq!(mem.read(12, 1).unwrap(), vec![7]);
    }
}
