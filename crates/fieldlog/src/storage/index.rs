//! In-memory file index rebuilt from journal replay.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::record::{MetaRecord, RecordKind};
use crate::error::Result;
use crate::sample::Timestamp;

/// A stored file as known from the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Session id.
    pub seq: u32,
    /// First payload byte in the data region.
    pub start_addr: u32,
    /// Payload length; estimated from flash when `incomplete`.
    pub size: u32,
    /// Session start time.
    pub timestamp: Timestamp,
    /// File name.
    pub name: String,
    /// START without FINAL, usually power lost mid-session.
    pub incomplete: bool,
}

impl FileEntry {
    /// One past the last payload byte.
    #[must_use]
    pub fn end_addr(&self) -> u32 {
        self.start_addr.saturating_add(self.size)
    }

    /// Payload address range.
    #[must_use]
    pub fn range(&self) -> std::ops::Range<u32> {
        self.start_addr..self.end_addr()
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    entry: FileEntry,
    deleted: bool,
}

/// Files in replay order.
///
/// Deleted files stay in the list, marked, so their payload extents still
/// bound the data write cursor; every public view filters them out.
#[derive(Debug, Clone, Default)]
pub struct FileIndex {
    files: Vec<Tracked>,
    by_seq: HashMap<u32, usize>,
    tombstones: HashSet<u32>,
    max_seq: u32,
}

impl FileIndex {
    /// An empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one trusted journal record into the index.
    pub fn apply(&mut self, record: &MetaRecord) {
        self.max_seq = self.max_seq.max(record.seq);

        match record.kind {
            RecordKind::Start => {
                if self.tombstones.contains(&record.seq) || self.by_seq.contains_key(&record.seq)
                {
                    return;
                }
                self.insert(FileEntry {
                    seq: record.seq,
                    start_addr: record.start_addr,
                    size: 0,
                    timestamp: record.timestamp,
                    name: record.name.clone(),
                    incomplete: true,
                });
            }
            RecordKind::Final => {
                if self.tombstones.contains(&record.seq) {
                    return;
                }
                let entry = FileEntry {
                    seq: record.seq,
                    start_addr: record.start_addr,
                    size: record.size,
                    timestamp: record.timestamp,
                    name: record.name.clone(),
                    incomplete: false,
                };
                match self.by_seq.get(&record.seq) {
                    Some(&pos) => self.files[pos].entry = entry,
                    None => self.insert(entry),
                }
            }
            RecordKind::Delete => {
                let target = record.start_addr;
                self.tombstones.insert(target);
                if let Some(&pos) = self.by_seq.get(&target) {
                    self.files[pos].deleted = true;
                }
            }
        }
    }

    fn insert(&mut self, entry: FileEntry) {
        self.by_seq.insert(entry.seq, self.files.len());
        self.files.push(Tracked {
            entry,
            deleted: false,
        });
    }

    /// Live files in replay order.
    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter().filter(|t| !t.deleted).map(|t| &t.entry)
    }

    /// Live file at list position `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&FileEntry> {
        self.entries().nth(index)
    }

    /// Live file with session id `seq`.
    #[must_use]
    pub fn find(&self, seq: u32) -> Option<&FileEntry> {
        self.by_seq
            .get(&seq)
            .map(|&pos| &self.files[pos])
            .filter(|t| !t.deleted)
            .map(|t| &t.entry)
    }

    /// Number of live files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    /// Whether there are no live files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest seq seen in any record, including tombstones.
    #[must_use]
    pub fn max_seq(&self) -> u32 {
        self.max_seq
    }

    /// Fill in the size of every incomplete entry, deleted or not.
    ///
    /// `measure(start, limit)` returns the payload length found at `start`;
    /// `limit` is the next known payload start after it, or `region_end`.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `measure`.
    pub fn estimate_incomplete<F>(&mut self, region_end: u32, mut measure: F) -> Result<()>
    where
        F: FnMut(u32, u32) -> Result<u32>,
    {
        let starts: Vec<u32> = self.files.iter().map(|t| t.entry.start_addr).collect();
        for tracked in self.files.iter_mut().filter(|t| t.entry.incomplete) {
            let start = tracked.entry.start_addr;
            let limit = starts
                .iter()
                .copied()
                .filter(|s| *s > start)
                .min()
                .unwrap_or(region_end);
            tracked.entry.size = measure(start, limit)?;
        }
        Ok(())
    }

    /// Highest payload end over all files ever indexed, or `floor`.
    #[must_use]
    pub fn high_water(&self, floor: u32) -> u32 {
        self.files
            .iter()
            .map(|t| t.entry.end_addr())
            .fold(floor, u32::max)
    }
}
