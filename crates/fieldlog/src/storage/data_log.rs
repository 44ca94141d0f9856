//! Append-only payload region with lazy erase.
//!
//! The region is never erased up front. A sector is erased the first time a
//! write is about to land in it, tracked by a pointer that only moves
//! forward, so each sector is erased at most once per pass over the region.

use std::ops::Range;

use tracing::{debug, trace};

use crate::error::Result;
use crate::flash::{BlockDevice, ERASED};

const SCAN_CHUNK: usize = 256;

/// Write cursor and erase pointer over the data region.
#[derive(Debug, Clone)]
pub struct DataLog {
    region: Range<u32>,
    cursor: u32,
    next_erase: u32,
}

impl DataLog {
    /// Empty log over `region`.
    #[must_use]
    pub fn new(region: Range<u32>) -> Self {
        let start = region.start;
        Self {
            region,
            cursor: start,
            next_erase: start,
        }
    }

    /// Address the next payload byte goes to.
    #[must_use]
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// First sector not yet erased in this pass.
    #[must_use]
    pub fn next_erase(&self) -> u32 {
        self.next_erase
    }

    /// Bytes left before the region end.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.region.end.saturating_sub(self.cursor)
    }

    /// Whether no payload byte fits anymore.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.cursor >= self.region.end
    }

    /// Move the cursor to `cursor` after a replay.
    ///
    /// Neither the cursor nor the erase pointer moves backwards. The erase
    /// pointer lands on the first sector boundary at or after the cursor:
    /// the rest of the cursor's sector is assumed erased already.
    pub fn restore(&mut self, cursor: u32, sector_size: u32) {
        let cursor = cursor.clamp(self.region.start, self.region.end);
        self.cursor = self.cursor.max(cursor);
        let aligned = align_up(self.cursor, sector_size).min(self.region.end);
        self.next_erase = self.next_erase.max(aligned);
        debug!(
            cursor = self.cursor,
            next_erase = self.next_erase,
            "Data cursor restored"
        );
    }

    /// Rewind to an empty region. Sectors are erased again lazily.
    pub fn reset(&mut self) {
        self.cursor = self.region.start;
        self.next_erase = self.region.start;
    }

    /// Erase every sector up to and including the one holding `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if an erase fails.
    pub fn ensure_erased<D: BlockDevice>(&mut self, device: &mut D, addr: u32) -> Result<()> {
        let sector_size = device.geometry().sector_size;
        while self.next_erase <= addr && self.next_erase < self.region.end {
            trace!(sector = self.next_erase, "lazy erase");
            device.erase_sector(self.next_erase)?;
            device.yield_now();
            self.next_erase += sector_size;
        }
        Ok(())
    }

    /// Write as much of `bytes` as fits, one page-bounded program at a time.
    ///
    /// Returns the number of bytes written. Anything short of `bytes.len()`
    /// means the region end was reached.
    ///
    /// # Errors
    ///
    /// Returns an error if an erase or program fails.
    pub fn append<D: BlockDevice>(&mut self, device: &mut D, bytes: &[u8]) -> Result<usize> {
        let geometry = device.geometry();
        let mut written = 0;

        while written < bytes.len() && !self.is_full() {
            let page_room = geometry.page_remaining(self.cursor) as usize;
            let region_room = self.remaining() as usize;
            let len = (bytes.len() - written).min(page_room).min(region_room);
            let last = self.cursor + len as u32 - 1;

            self.ensure_erased(device, last)?;
            device.program_page(self.cursor, &bytes[written..written + len])?;

            self.cursor += len as u32;
            written += len;
        }

        Ok(written)
    }

    /// Measure a payload whose end was never recorded.
    ///
    /// Scans forward from `start` to the first erased byte, stopping at
    /// `limit` or the region end, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns an error if flash cannot be read.
    pub fn scan_extent<D: BlockDevice>(&self, device: &mut D, start: u32, limit: u32) -> Result<u32> {
        let start = start.max(self.region.start);
        let end = limit.min(self.region.end);
        let mut addr = start;
        let mut buf = [0u8; SCAN_CHUNK];

        while addr < end {
            let len = SCAN_CHUNK.min((end - addr) as usize);
            device.read(addr, &mut buf[..len])?;
            if let Some(pos) = buf[..len].iter().position(|b| *b == ERASED) {
                return Ok(addr + pos as u32 - start);
            }
            addr += len as u32;
        }

        Ok(end.saturating_sub(start))
    }
}

/// Round `addr` up to a multiple of `align`.
#[must_use]
pub fn align_up(addr: u32, align: u32) -> u32 {
    match addr % align {
        0 => addr,
        rem => addr.saturating_add(align - rem),
    }
}

/// RAM staging area in front of the data log.
///
/// Lines accumulate here and go to flash once the buffer passes its flush
/// threshold or a periodic flush comes due.
#[derive(Debug, Clone)]
pub struct WriteBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    threshold: usize,
}

impl WriteBuffer {
    /// Buffer holding up to `capacity` bytes, wanting a flush at `threshold`.
    #[must_use]
    pub fn new(capacity: usize, threshold: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
            threshold: threshold.min(capacity),
        }
    }

    /// Whether `len` more bytes fit without a flush.
    #[must_use]
    pub fn fits(&self, len: usize) -> bool {
        self.bytes.len() + len <= self.capacity
    }

    /// Stage `bytes`. The caller checks [`fits`](Self::fits) first; a chunk
    /// larger than the whole buffer is still accepted.
    pub fn push(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Whether the threshold has been reached.
    #[must_use]
    pub fn wants_flush(&self) -> bool {
        self.bytes.len() >= self.threshold
    }

    /// Staged bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of staged bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Drop everything staged.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}
