//! Block device abstraction over NOR flash.
//!
//! The storage engine only ever talks to flash through [`BlockDevice`]:
//! byte reads, whole-sector erases and page-bounded programs. Programming
//! follows NOR semantics, so bits can only be cleared; an erased byte reads
//! as [`ERASED`].
//!
//! Two host implementations are provided:
//!
//! - [`MemoryFlash`]: a RAM-backed device that records every erase and
//!   program, used by the tests.
//! - [`FileFlash`]: a flash image persisted to a regular file, used by the
//!   `fieldlog` binary.

mod file;
mod memory;

use std::ops::Range;

pub use self::file::FileFlash;
pub use self::memory::{MemoryFlash, ProgramOp};

use crate::error::{Error, Result};

/// Value of every byte in an erased sector.
pub const ERASED: u8 = 0xFF;

/// Physical granularity of a flash device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    /// Total addressable bytes.
    pub capacity: u32,
    /// Largest unit a single program may touch; programs never cross it.
    pub page_size: u32,
    /// Erase unit.
    pub sector_size: u32,
}

impl FlashGeometry {
    /// Base address of the sector containing `addr`.
    #[must_use]
    pub fn sector_base(&self, addr: u32) -> u32 {
        addr - addr % self.sector_size
    }

    /// Bytes left in the page containing `addr`.
    #[must_use]
    pub fn page_remaining(&self, addr: u32) -> u32 {
        self.page_size - addr % self.page_size
    }

    /// Check that `len` bytes starting at `addr` lie on the device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] otherwise.
    pub fn check_range(&self, addr: u32, len: usize) -> Result<()> {
        let end = u64::from(addr) + len as u64;
        if end > u64::from(self.capacity) {
            return Err(Error::OutOfBounds {
                addr,
                len,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Check the contract of [`BlockDevice::program_page`].
    ///
    /// # Errors
    ///
    /// Returns an error if the range leaves the device or crosses a page.
    pub fn check_program(&self, addr: u32, len: usize) -> Result<()> {
        self.check_range(addr, len)?;
        if len as u64 > u64::from(self.page_remaining(addr)) {
            return Err(Error::PageOverrun {
                addr,
                len,
                page_size: self.page_size,
            });
        }
        Ok(())
    }

    /// Check the contract of [`BlockDevice::erase_sector`].
    ///
    /// # Errors
    ///
    /// Returns an error if `addr` is unaligned or off the device.
    pub fn check_erase(&self, addr: u32) -> Result<()> {
        if addr % self.sector_size != 0 {
            return Err(Error::MisalignedErase {
                addr,
                sector_size: self.sector_size,
            });
        }
        self.check_range(addr, self.sector_size as usize)
    }
}

/// Split of the medium into the metadata journal and the payload region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashLayout {
    /// Fixed-size journal slots live here.
    pub journal: Range<u32>,
    /// Raw payload bytes live here.
    pub data: Range<u32>,
}

impl FlashLayout {
    /// Journal at the bottom of the device, data filling the rest.
    #[must_use]
    pub fn new(journal_bytes: u32, capacity: u32) -> Self {
        Self {
            journal: 0..journal_bytes,
            data: journal_bytes..capacity,
        }
    }
}

/// Primitive operations of a NOR flash part.
///
/// Erase and program block until the part reports ready. There is no
/// timeout: a part that never becomes ready stalls the caller.
pub trait BlockDevice {
    /// Physical geometry of the part.
    fn geometry(&self) -> FlashGeometry;

    /// Fill `buf` with the bytes starting at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is off the device or the read fails.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Reset a whole sector to [`ERASED`]. `addr` must be sector aligned.
    ///
    /// # Errors
    ///
    /// Returns an error if `addr` is unaligned or the erase fails.
    fn erase_sector(&mut self, addr: u32) -> Result<()>;

    /// Program `data` at `addr`. The range must not cross a page boundary;
    /// that is the caller's responsibility.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is invalid or the program fails.
    fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    /// Whether an erase or program is still in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the status register cannot be read.
    fn is_busy(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// Cooperative yield point for long-running operations.
    fn yield_now(&mut self) {}

    /// Poll until the part is ready.
    ///
    /// # Errors
    ///
    /// Propagates status read failures.
    fn wait_ready(&mut self) -> Result<()> {
        while self.is_busy()? {
            self.yield_now();
            std::hint::spin_loop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> FlashGeometry {
        FlashGeometry {
            capacity: 64 * 1024,
            page_size: 256,
            sector_size: 4096,
        }
    }

    #[test]
    fn test_sector_base() {
        let g = geometry();
        assert_eq!(g.sector_base(0), 0);
        assert_eq!(g.sector_base(4095), 0);
        assert_eq!(g.sector_base(4096), 4096);
        assert_eq!(g.sector_base(9000), 8192);
    }

    #[test]
    fn test_page_remaining() {
        let g = geometry();
        assert_eq!(g.page_remaining(0), 256);
        assert_eq!(g.page_remaining(255), 1);
        assert_eq!(g.page_remaining(300), 212);
    }

    #[test]
    fn test_check_program_rejects_page_crossing() {
        let g = geometry();
        assert!(g.check_program(0, 256).is_ok());
        assert!(g.check_program(250, 6).is_ok());
        assert!(matches!(
            g.check_program(250, 7),
            Err(Error::PageOverrun { .. })
        ));
    }

    #[test]
    fn test_check_range_rejects_past_end() {
        let g = geometry();
        assert!(g.check_range(64 * 1024 - 1, 1).is_ok());
        assert!(matches!(
            g.check_range(64 * 1024 - 1, 2),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_check_erase_alignment() {
        let g = geometry();
        assert!(g.check_erase(8192).is_ok());
        assert!(matches!(
            g.check_erase(100),
            Err(Error::MisalignedErase { .. })
        ));
    }

    #[test]
    fn test_layout_split() {
        let layout = FlashLayout::new(8192, 65536);
        assert_eq!(layout.journal, 0..8192);
        assert_eq!(layout.data, 8192..65536);
    }
}
