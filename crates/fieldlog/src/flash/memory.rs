//! RAM-backed NOR flash.

use tracing::trace;

use super::{BlockDevice, FlashGeometry, ERASED};
use crate::error::Result;

/// One recorded program operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramOp {
    /// First byte programmed.
    pub addr: u32,
    /// Number of bytes programmed.
    pub len: usize,
}

/// In-memory flash part with operation history.
///
/// Behaves like real NOR: programs AND into the existing contents, erases
/// reset a whole sector. Every erase and program is recorded so tests can
/// check the page-boundary and erase-once laws.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    geometry: FlashGeometry,
    cells: Vec<u8>,
    erase_counts: Vec<u32>,
    programs: Vec<ProgramOp>,
    busy_cycles: u32,
    busy_left: u32,
    busy_polls: u64,
}

impl MemoryFlash {
    /// A fully erased part.
    #[must_use]
    pub fn new(geometry: FlashGeometry) -> Self {
        Self::from_image(geometry, vec![ERASED; geometry.capacity as usize])
    }

    /// A part holding `image`, e.g. a copy taken from another device.
    ///
    /// # Panics
    ///
    /// Panics if the image size does not match the geometry.
    #[must_use]
    pub fn from_image(geometry: FlashGeometry, image: Vec<u8>) -> Self {
        assert_eq!(image.len(), geometry.capacity as usize, "image size");
        let sectors = (geometry.capacity / geometry.sector_size) as usize;
        Self {
            geometry,
            cells: image,
            erase_counts: vec![0; sectors],
            programs: Vec::new(),
            busy_cycles: 0,
            busy_left: 0,
            busy_polls: 0,
        }
    }

    /// Raw contents of the part.
    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.cells
    }

    /// Mutable raw contents, for simulating torn writes and bit rot.
    pub fn image_mut(&mut self) -> &mut [u8] {
        &mut self.cells
    }

    /// How many times the sector containing `addr` has been erased.
    #[must_use]
    pub fn erase_count(&self, addr: u32) -> u32 {
        self.erase_counts[(addr / self.geometry.sector_size) as usize]
    }

    /// Every program operation since creation or the last [`clear_history`](Self::clear_history).
    #[must_use]
    pub fn programs(&self) -> &[ProgramOp] {
        &self.programs
    }

    /// Forget recorded erases and programs.
    pub fn clear_history(&mut self) {
        self.erase_counts.iter_mut().for_each(|c| *c = 0);
        self.programs.clear();
    }

    /// Report busy for `cycles` status polls after every erase or program.
    pub fn set_busy_cycles(&mut self, cycles: u32) {
        self.busy_cycles = cycles;
    }

    /// Number of status polls that saw the part busy.
    #[must_use]
    pub fn busy_polls(&self) -> u64 {
        self.busy_polls
    }
}

impl BlockDevice for MemoryFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.geometry.check_range(addr, buf.len())?;
        let start = addr as usize;
        buf.copy_from_slice(&self.cells[start..start + buf.len()]);
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<()> {
        self.geometry.check_erase(addr)?;
        trace!(addr = format_args!("{addr:#010x}"), "erase sector");
        let start = addr as usize;
        self.cells[start..start + self.geometry.sector_size as usize].fill(ERASED);
        self.erase_counts[(addr / self.geometry.sector_size) as usize] += 1;
        self.busy_left = self.busy_cycles;
        self.wait_ready()
    }

    fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.geometry.check_program(addr, data.len())?;
        trace!(
            addr = format_args!("{addr:#010x}"),
            len = data.len(),
            "program page"
        );
        let start = addr as usize;
        for (cell, byte) in self.cells[start..start + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.programs.push(ProgramOp {
            addr,
            len: data.len(),
        });
        self.busy_left = self.busy_cycles;
        self.wait_ready()
    }

    fn is_busy(&mut self) -> Result<bool> {
        if self.busy_left > 0 {
            self.busy_left -= 1;
            self.busy_polls += 1;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn flash() -> MemoryFlash {
        MemoryFlash::new(FlashGeometry {
            capacity: 16 * 1024,
            page_size: 256,
            sector_size: 4096,
        })
    }

    #[test]
    fn test_new_is_erased() {
        let flash = flash();
        assert!(flash.image().iter().all(|b| *b == ERASED));
    }

    #[test]
    fn test_program_and_read_back() {
        let mut flash = flash();
        flash.program_page(10, b"hello").unwrap();

        let mut buf = [0u8; 5];
        flash.read(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(flash.programs(), &[ProgramOp { addr: 10, len: 5 }]);
    }

    #[test]
    fn test_program_only_clears_bits() {
        let mut flash = flash();
        flash.program_page(0, &[0b1010_1010]).unwrap();
        flash.program_page(0, &[0b0101_1111]).unwrap();

        assert_eq!(flash.image()[0], 0b0000_1010);
    }

    #[test]
    fn test_erase_restores_sector_and_counts() {
        let mut flash = flash();
        flash.program_page(4096, &[0; 16]).unwrap();
        flash.erase_sector(4096).unwrap();

        assert!(flash.image()[4096..8192].iter().all(|b| *b == ERASED));
        assert_eq!(flash.erase_count(4096), 1);
        assert_eq!(flash.erase_count(0), 0);
    }

    #[test]
    fn test_program_across_page_rejected() {
        let mut flash = flash();
        let err = flash.program_page(200, &[0; 100]).unwrap_err();
        assert!(matches!(err, Error::PageOverrun { .. }));
        assert!(flash.programs().is_empty());
    }

    #[test]
    fn test_unaligned_erase_rejected() {
        let mut flash = flash();
        assert!(matches!(
            flash.erase_sector(10),
            Err(Error::MisalignedErase { .. })
        ));
    }

    #[test]
    fn test_busy_device_is_polled_until_ready() {
        let mut flash = flash();
        flash.set_busy_cycles(3);
        flash.program_page(0, &[1]).unwrap();
        assert_eq!(flash.busy_polls(), 3);
        assert!(!flash.is_busy().unwrap());

        flash.erase_sector(0).unwrap();
        flash.program_page(1, &[2]).unwrap();
        assert_eq!(flash.busy_polls(), 9);
    }

    #[test]
    fn test_clear_history() {
        let mut flash = flash();
        flash.erase_sector(0).unwrap();
        flash.program_page(0, &[1]).unwrap();
        flash.clear_history();

        assert_eq!(flash.erase_count(0), 0);
        assert!(flash.programs().is_empty());
    }
}
