//! Storage engine for fieldlog.
//!
//! This module owns everything written to flash: the metadata journal, the
//! payload log, the file index rebuilt from the journal and the active
//! logging session. All of it lives in one [`Storage`] value driven by a
//! single controller.
//!
//! Crash safety rests on two rules:
//! - metadata is only ever appended, one checksummed slot at a time, and
//!   replay trusts nothing past the first slot that fails validation;
//! - payload bytes are only ever appended, into sectors erased once just
//!   before their first write.

pub mod data_log;
pub mod index;
pub mod journal;
pub mod reader;
pub mod record;
mod session;

use std::io::Write;

use serde::Serialize;
use tracing::{debug, info};

pub use self::index::{FileEntry, FileIndex};
pub use self::reader::{Line, LineReader, PayloadReader};
pub use self::session::{ActiveSession, SessionSettings, SessionState, StopReason};

use self::data_log::DataLog;
use self::journal::Journal;
use self::record::{MetaRecord, RECORD_SIZE};
use self::session::Session;
use crate::config::ExportConfig;
use crate::error::{Error, Result};
use crate::export::{self, ExportSummary};
use crate::flash::{BlockDevice, FlashLayout};

/// Storage engine over one flash device.
#[derive(Debug)]
pub struct Storage<D> {
    device: D,
    layout: FlashLayout,
    journal: Journal,
    data: DataLog,
    index: FileIndex,
    next_seq: u32,
    settings: SessionSettings,
    session: Option<Session>,
    pending_start: bool,
    last_stop: Option<StopReason>,
}

/// One row of [`Storage::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Position in the list, as accepted by the other file operations.
    pub index: usize,
    /// Session id.
    pub seq: u32,
    /// File name.
    pub name: String,
    /// Payload size in bytes.
    pub size: u32,
    /// Whether the session never finalized.
    pub incomplete: bool,
}

/// Statistics about the storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Live files.
    pub files: usize,
    /// Journal slots holding records.
    pub journal_used: u32,
    /// Journal slots in total.
    pub journal_capacity: u32,
    /// Next payload address.
    pub data_cursor: u32,
    /// Payload bytes still free.
    pub data_free: u32,
    /// Size of the payload region.
    pub data_capacity: u32,
    /// Session machine state.
    pub state: SessionState,
    /// Active session, if logging.
    pub session: Option<ActiveSession>,
}

impl<D: BlockDevice> Storage<D> {
    /// Mount `device` and rebuild the file index from its journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the layout does not fit the device geometry or
    /// flash cannot be read.
    pub fn open(device: D, layout: FlashLayout, settings: SessionSettings) -> Result<Self> {
        check_layout(&device, &layout)?;

        let mut storage = Self {
            journal: Journal::new(layout.journal.clone()),
            data: DataLog::new(layout.data.clone()),
            device,
            layout,
            index: FileIndex::new(),
            next_seq: 1,
            settings,
            session: None,
            pending_start: false,
            last_stop: None,
        };
        storage.replay()?;

        info!(
            files = storage.index.len(),
            journal_used = storage.journal.used(),
            data_cursor = storage.data.cursor(),
            "Storage mounted"
        );
        Ok(storage)
    }

    /// Rebuild the file index from the journal.
    ///
    /// Sizes of unfinished sessions are estimated from the data region, and
    /// the data cursor moves past every payload the journal knows about.
    ///
    /// # Errors
    ///
    /// Returns an error if flash cannot be read.
    pub fn replay(&mut self) -> Result<()> {
        let replay = self.journal.replay(&mut self.device)?;
        let mut index = replay.index;

        let data = &self.data;
        let device = &mut self.device;
        index.estimate_incomplete(self.layout.data.end, |start, limit| {
            data.scan_extent(device, start, limit)
        })?;

        let sector_size = self.device.geometry().sector_size;
        self.data
            .restore(index.high_water(self.layout.data.start), sector_size);
        self.next_seq = self.next_seq.max(index.max_seq().saturating_add(1));
        self.index = index;

        debug!(
            records = replay.records,
            files = self.index.len(),
            next_seq = self.next_seq,
            "Index rebuilt"
        );
        Ok(())
    }

    /// Stored files in journal order.
    #[must_use]
    pub fn list(&self) -> Vec<FileInfo> {
        self.index
            .entries()
            .enumerate()
            .map(|(index, e)| FileInfo {
                index,
                seq: e.seq,
                name: e.name.clone(),
                size: e.size,
                incomplete: e.incomplete,
            })
            .collect()
    }

    /// The file at list position `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] if there is no such file.
    pub fn entry(&self, index: usize) -> Result<&FileEntry> {
        self.index.get(index).ok_or(Error::FileNotFound { index })
    }

    /// Raw payload of a file as a byte stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] if there is no such file.
    pub fn download(&mut self, index: usize) -> Result<PayloadReader<'_, D>> {
        let range = self.entry(index)?.range();
        Ok(PayloadReader::new(&mut self.device, range))
    }

    /// BLAKE3 digest of a file's payload.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no such file or flash cannot be read.
    pub fn digest(&mut self, index: usize) -> Result<blake3::Hash> {
        let mut reader = self.download(index)?;
        let mut hasher = blake3::Hasher::new();
        std::io::copy(&mut reader, &mut hasher)?;
        Ok(hasher.finalize())
    }

    /// Stream a file as KML into `out`.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no such file, flash cannot be read or
    /// `out` fails.
    pub fn export<W: Write>(
        &mut self,
        index: usize,
        style: &ExportConfig,
        out: W,
    ) -> Result<ExportSummary> {
        let entry = self.entry(index)?.clone();
        export::write_kml(&mut self.device, &entry, style, out)
    }

    /// Delete the file at list position `index`.
    ///
    /// Appends a tombstone and rebuilds the index. The payload bytes stay in
    /// flash untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`], [`Error::SessionActive`] when the
    /// file is still being recorded, [`Error::JournalFull`] when no slot is
    /// left (one stays reserved for an active session's FINAL), or a device
    /// error.
    pub fn delete(&mut self, index: usize) -> Result<FileEntry> {
        let entry = self.entry(index)?.clone();
        if self.session.as_ref().is_some_and(|s| s.seq == entry.seq) {
            return Err(Error::SessionActive);
        }
        let reserved = u32::from(self.session.is_some());
        if self.journal.free_slots() <= reserved {
            return Err(Error::JournalFull {
                capacity: self.journal.capacity(),
            });
        }

        let seq = self.next_seq;
        self.journal
            .append(&mut self.device, &MetaRecord::delete(seq, entry.seq))?;
        self.next_seq = seq.saturating_add(1);
        self.replay()?;

        info!(seq = entry.seq, name = %entry.name, "File deleted");
        Ok(entry)
    }

    /// Forget every file by erasing the journal.
    ///
    /// Any session in progress is dropped without a FINAL record. Payload
    /// sectors are left alone and get erased again as new data reaches them.
    ///
    /// # Errors
    ///
    /// Returns an error if an erase fails.
    pub fn reset_index(&mut self) -> Result<()> {
        self.session = None;
        self.pending_start = false;
        self.journal.erase(&mut self.device)?;
        self.data.reset();
        self.index = FileIndex::new();
        self.next_seq = 1;
        info!("File index reset");
        Ok(())
    }

    /// Storage usage and session state.
    #[must_use]
    pub fn status(&self) -> StorageStats {
        StorageStats {
            files: self.index.len(),
            journal_used: self.journal.used(),
            journal_capacity: self.journal.capacity(),
            data_cursor: self.data.cursor(),
            data_free: self.data.remaining(),
            data_capacity: self.layout.data.end - self.layout.data.start,
            state: self.state(),
            session: self.active_session(),
        }
    }

    /// Region split in use.
    #[must_use]
    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    /// The underlying device.
    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Unmount, handing the device back. Buffered session bytes are lost.
    #[must_use]
    pub fn into_device(self) -> D {
        self.device
    }
}

fn check_layout<D: BlockDevice>(device: &D, layout: &FlashLayout) -> Result<()> {
    let geometry = device.geometry();
    let sector = geometry.sector_size;
    let problem = if layout.journal.start != 0 || layout.journal.end != layout.data.start {
        Some("journal must start at 0 and be followed by the data region".to_string())
    } else if layout.data.end > geometry.capacity {
        Some(format!(
            "layout ends at {} but the device holds {} bytes",
            layout.data.end, geometry.capacity
        ))
    } else if layout.journal.end % sector != 0 || layout.data.end % sector != 0 {
        Some(format!("regions must be aligned to {sector} byte sectors"))
    } else if layout.journal.end < RECORD_SIZE as u32 || layout.data.is_empty() {
        Some("journal and data regions must not be empty".to_string())
    } else if geometry.page_size < RECORD_SIZE as u32 {
        Some(format!(
            "page size {} is smaller than a {RECORD_SIZE} byte journal record",
            geometry.page_size
        ))
    } else {
        None
    };

    match problem {
        Some(message) => Err(Error::ConfigValidation { message }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::time::Instant;

    use super::*;
    use crate::flash::{FlashGeometry, MemoryFlash};
    use crate::sample::{Fix, PositionSource, Timestamp, HEADER_LINE};

    const CAPACITY: u32 = 64 * 1024;

    struct Fixed(Fix);

    impl PositionSource for Fixed {
        fn time_valid(&self) -> bool {
            true
        }

        fn snapshot(&mut self) -> Fix {
            self.0.clone()
        }
    }

    fn geometry() -> FlashGeometry {
        FlashGeometry {
            capacity: CAPACITY,
            page_size: 256,
            sector_size: 4096,
        }
    }

    fn create_test_storage() -> Storage<MemoryFlash> {
        Storage::open(
            MemoryFlash::new(geometry()),
            FlashLayout::new(8192, CAPACITY),
            SessionSettings::default(),
        )
        .expect("failed to create test storage")
    }

    fn fix(second: u8, speed: f64) -> Fix {
        Fix {
            timestamp: Timestamp {
                year: 2024,
                month: 7,
                day: 14,
                hour: 6,
                minute: 0,
                second,
            },
            latitude: 48.1,
            longitude: 11.5 + f64::from(second) * 0.001,
            altitude: 520.0,
            speed_kmh: speed,
            ..Fix::default()
        }
    }

    fn record_file(storage: &mut Storage<MemoryFlash>, speeds: &[f64]) {
        let mut source = Fixed(fix(0, 0.0));
        storage.request_start(&mut source, Instant::now()).unwrap();
        for (i, speed) in speeds.iter().enumerate() {
            storage
                .record_sample(&fix(u8::try_from(i).unwrap(), *speed))
                .unwrap();
        }
        storage.request_stop().unwrap();
    }

    #[test]
    fn test_open_blank_device() {
        let storage = create_test_storage();
        assert!(storage.list().is_empty());
        assert_eq!(storage.state(), SessionState::Idle);

        let stats = storage.status();
        assert_eq!(stats.files, 0);
        assert_eq!(stats.journal_used, 0);
        assert_eq!(stats.journal_capacity, 32);
        assert_eq!(stats.data_cursor, 8192);
        assert_eq!(stats.data_free, CAPACITY - 8192);
        assert_eq!(stats.data_capacity, CAPACITY - 8192);
    }

    #[test]
    fn test_open_rejects_bad_layout() {
        let err = Storage::open(
            MemoryFlash::new(geometry()),
            FlashLayout::new(8192, CAPACITY * 2),
            SessionSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { .. }));

        let err = Storage::open(
            MemoryFlash::new(geometry()),
            FlashLayout::new(1000, CAPACITY),
            SessionSettings::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("aligned"));
    }

    #[test]
    fn test_download_returns_payload() {
        let mut storage = create_test_storage();
        record_file(&mut storage, &[10.0, 20.0]);

        let mut text = String::new();
        storage
            .download(0)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();

        let expected = format!(
            "{HEADER_LINE}{}{}",
            fix(0, 10.0).to_line(),
            fix(1, 20.0).to_line()
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn test_digest_matches_payload() {
        let mut storage = create_test_storage();
        record_file(&mut storage, &[5.0]);

        let mut bytes = Vec::new();
        storage.download(0).unwrap().read_to_end(&mut bytes).unwrap();
        assert_eq!(storage.digest(0).unwrap(), blake3::hash(&bytes));
    }

    #[test]
    fn test_export_streams_kml() {
        let mut storage = create_test_storage();
        record_file(&mut storage, &[0.0, 30.0, 60.0]);

        let mut out = Vec::new();
        let summary = storage
            .export(0, &ExportConfig::default(), &mut out)
            .unwrap();

        assert_eq!(summary.points, 3);
        assert_eq!(summary.segments, 2);
        assert!(String::from_utf8(out).unwrap().contains("20240714_060000.csv"));
    }

    #[test]
    fn test_missing_file() {
        let mut storage = create_test_storage();
        assert!(matches!(
            storage.download(0),
            Err(Error::FileNotFound { index: 0 })
        ));
        assert!(matches!(
            storage.delete(3),
            Err(Error::FileNotFound { index: 3 })
        ));
    }

    #[test]
    fn test_list_indexes_follow_deletes() {
        let mut storage = create_test_storage();
        for _ in 0..3 {
            record_file(&mut storage, &[1.0]);
        }
        storage.delete(0).unwrap();

        let files = storage.list();
        assert_eq!(files.len(), 2);
        assert_eq!((files[0].index, files[0].seq), (0, 2));
        assert_eq!((files[1].index, files[1].seq), (1, 3));
    }

    #[test]
    fn test_reset_index() {
        let mut storage = create_test_storage();
        record_file(&mut storage, &[1.0, 2.0]);
        let erases_before = storage.device().erase_count(0);

        storage.reset_index().unwrap();
        assert!(storage.list().is_empty());
        assert_eq!(storage.status().data_cursor, 8192);
        assert_eq!(storage.device().erase_count(0), erases_before + 1);

        let reopened = Storage::open(
            storage.into_device(),
            FlashLayout::new(8192, CAPACITY),
            SessionSettings::default(),
        )
        .unwrap();
        assert!(reopened.list().is_empty());
    }

    #[test]
    fn test_reset_drops_active_session() {
        let mut storage = create_test_storage();
        let mut source = Fixed(fix(0, 0.0));
        storage.request_start(&mut source, Instant::now()).unwrap();

        storage.reset_index().unwrap();
        assert_eq!(storage.state(), SessionState::Idle);
        assert!(storage.list().is_empty());

        record_file(&mut storage, &[3.0]);
        let files = storage.list();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].seq, 1);
    }

    #[test]
    fn test_data_written_after_reset_is_readable() {
        let mut storage = create_test_storage();
        record_file(&mut storage, &[1.0; 20]);
        storage.reset_index().unwrap();
        record_file(&mut storage, &[2.0]);

        let mut text = String::new();
        storage
            .download(0)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, format!("{HEADER_LINE}{}", fix(0, 2.0).to_line()));
    }

    #[test]
    fn test_torn_journal_record_survives_reboot() {
        let mut storage = create_test_storage();
        record_file(&mut storage, &[1.0]);
        let mut flash = storage.into_device();
        // Power lost halfway through the next START.
        let torn = MetaRecord::start(2, 9000, Timestamp::default(), "x.csv").encode();
        let slot = 2 * RECORD_SIZE;
        flash.image_mut()[slot..slot + 30].copy_from_slice(&torn[..30]);

        let mut storage = Storage::open(
            flash,
            FlashLayout::new(8192, CAPACITY),
            SessionSettings::default(),
        )
        .unwrap();
        assert_eq!(storage.list().len(), 1);

        // The torn slot shares a sector with the finished file, so the
        // journal refuses to erase it.
        let mut source = Fixed(fix(0, 0.0));
        let err = storage
            .request_start(&mut source, Instant::now())
            .unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { slot: 2, .. }));
        assert_eq!(storage.state(), SessionState::Idle);
        assert_eq!(storage.list().len(), 1);
        assert!(!storage.list()[0].incomplete);

        storage.reset_index().unwrap();
        record_file(&mut storage, &[2.0]);
        let seqs: Vec<u32> = storage.list().iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![1]);
        assert!(storage.list().iter().all(|f| !f.incomplete));
    }
}
