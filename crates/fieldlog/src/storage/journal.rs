//! Append-only metadata journal.
//!
//! The journal region is a flat array of [`RECORD_SIZE`] slots. Replay reads
//! slots from the start of the region and stops at the first one that is
//! erased or fails validation; that slot is where the next record goes.
//! Nothing after it is ever considered, even if later slots look valid.

use std::ops::Range;

use tracing::{debug, info, warn};

use super::index::FileIndex;
use super::record::{MetaRecord, Slot, RECORD_SIZE};
use crate::error::{Error, Result};
use crate::flash::{BlockDevice, ERASED};

const SLOT_BYTES: u32 = RECORD_SIZE as u32;

/// Outcome of a journal scan.
#[derive(Debug)]
pub struct Replay {
    /// Files described by the trusted prefix.
    pub index: FileIndex,
    /// Number of trusted records.
    pub records: u32,
    /// Why the scan stopped early, if it hit a bad slot rather than an erased one.
    pub corruption: Option<Error>,
}

/// Write cursor over the journal region.
#[derive(Debug, Clone)]
pub struct Journal {
    region: Range<u32>,
    next_slot: u32,
}

impl Journal {
    /// Journal over `region`, cursor at the first slot.
    #[must_use]
    pub fn new(region: Range<u32>) -> Self {
        Self {
            region,
            next_slot: 0,
        }
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        (self.region.end - self.region.start) / SLOT_BYTES
    }

    /// Slots holding trusted records.
    #[must_use]
    pub fn used(&self) -> u32 {
        self.next_slot
    }

    /// Slots still available for appends.
    #[must_use]
    pub fn free_slots(&self) -> u32 {
        self.capacity() - self.next_slot
    }

    fn slot_addr(&self, slot: u32) -> u32 {
        self.region.start + slot * SLOT_BYTES
    }

    /// Append one record at the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JournalFull`] without touching flash when no slot is
    /// left, [`Error::CorruptRecord`] without touching flash when a torn
    /// record blocks the cursor mid-sector, or a device error if the write
    /// fails.
    pub fn append<D: BlockDevice>(&mut self, device: &mut D, record: &MetaRecord) -> Result<()> {
        if self.next_slot >= self.capacity() {
            return Err(Error::JournalFull {
                capacity: self.capacity(),
            });
        }

        let addr = self.slot_addr(self.next_slot);
        let mut current = [0u8; RECORD_SIZE];
        device.read(addr, &mut current)?;
        if current.iter().any(|b| *b != ERASED) {
            self.reclaim_slot(device)?;
        }

        device.program_page(addr, &record.encode())?;
        debug!(
            slot = self.next_slot,
            seq = record.seq,
            kind = %record.kind,
            "Appended journal record"
        );
        self.next_slot += 1;
        Ok(())
    }

    /// Make the cursor slot programmable again.
    ///
    /// Only a slot opening its sector can be reclaimed: the erase takes
    /// nothing trusted with it. A torn slot behind trusted records in the
    /// same sector would need those records erased and rewritten, and a
    /// power cut in between would lose them, so the journal stays blocked
    /// until it is reset.
    fn reclaim_slot<D: BlockDevice>(&self, device: &mut D) -> Result<()> {
        let addr = self.slot_addr(self.next_slot);
        let sector = device.geometry().sector_base(addr);
        if addr != sector {
            warn!(
                slot = self.next_slot,
                "Torn journal record behind trusted records in its sector"
            );
            return Err(Error::CorruptRecord {
                slot: self.next_slot,
                reason: "torn record blocks the journal",
            });
        }

        warn!(
            slot = self.next_slot,
            sector = format_args!("{sector:#010x}"),
            "Erasing journal sector opened by a torn record"
        );
        device.erase_sector(sector)
    }

    /// Scan the journal and rebuild the file index from its trusted prefix.
    ///
    /// Leaves the cursor on the first untrusted slot.
    ///
    /// # Errors
    ///
    /// Returns an error only if flash cannot be read; corrupt records end
    /// the scan and are reported in [`Replay::corruption`].
    pub fn replay<D: BlockDevice>(&mut self, device: &mut D) -> Result<Replay> {
        let mut index = FileIndex::new();
        let mut corruption = None;
        let mut slot = 0;
        let mut buf = [0u8; RECORD_SIZE];

        while slot < self.capacity() {
            device.read(self.slot_addr(slot), &mut buf)?;
            match MetaRecord::decode(&buf) {
                Slot::Valid(record) => index.apply(&record),
                Slot::Erased => break,
                Slot::Invalid(reason) => {
                    warn!(slot, reason, "Journal ends at corrupt record");
                    corruption = Some(Error::CorruptRecord { slot, reason });
                    break;
                }
            }
            slot += 1;
        }

        self.next_slot = slot;
        debug!(records = slot, files = index.len(), "Journal replayed");
        Ok(Replay {
            index,
            records: slot,
            corruption,
        })
    }

    /// Erase the whole journal region, forgetting every record.
    ///
    /// # Errors
    ///
    /// Returns an error if an erase fails.
    pub fn erase<D: BlockDevice>(&mut self, device: &mut D) -> Result<()> {
        let sector_size = device.geometry().sector_size;
        let mut addr = self.region.start;
        while addr < self.region.end {
            device.erase_sector(addr)?;
            device.yield_now();
            addr += sector_size;
        }
        self.next_slot = 0;
        info!("Journal erased ({} slots)", self.capacity());
        Ok(())
    }
}
