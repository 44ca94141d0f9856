//! Fixed-size metadata journal records.
//!
//! Each record occupies one 256-byte slot. Only the first 64 bytes carry
//! data; the rest is left at the erased value so a record is a single page
//! program. All integers are little-endian.
//!
//! | offset | size | field |
//! |-------:|-----:|-------|
//! | 0 | 4 | magic |
//! | 4 | 2 | format version |
//! | 6 | 1 | kind |
//! | 7 | 1 | reserved |
//! | 8 | 4 | seq |
//! | 12 | 4 | start address (DEL: target seq) |
//! | 16 | 4 | size |
//! | 20 | 7 | year (2), month, day, hour, minute, second |
//! | 27 | 1 | name length |
//! | 28 | 32 | name |
//! | 60 | 4 | CRC-32 of bytes 0..60 |

use std::fmt;

use crate::flash::ERASED;
use crate::sample::Timestamp;

/// Bytes per journal slot.
pub const RECORD_SIZE: usize = 256;

/// Longest file name a record can hold, in bytes.
pub const NAME_CAPACITY: usize = 32;

const MAGIC: u32 = 0x474F_4C46;
const VERSION: u16 = 1;
const NAME_OFFSET: usize = 28;
const CHECKSUM_OFFSET: usize = NAME_OFFSET + NAME_CAPACITY;

/// What a journal record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// A session began; written before any payload byte.
    Start = 1,
    /// A session ended with a known size.
    Final = 2,
    /// Tombstone for an earlier session.
    Delete = 3,
}

impl RecordKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Start),
            2 => Some(Self::Final),
            3 => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "START"),
            Self::Final => write!(f, "FINAL"),
            Self::Delete => write!(f, "DEL"),
        }
    }
}

/// One decoded journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaRecord {
    /// Record type.
    pub kind: RecordKind,
    /// Id of this record; unique and increasing across the journal.
    pub seq: u32,
    /// First payload byte, or the target seq for [`RecordKind::Delete`].
    pub start_addr: u32,
    /// Payload length; zero in START records.
    pub size: u32,
    /// Session start time.
    pub timestamp: Timestamp,
    /// File name, at most [`NAME_CAPACITY`] bytes.
    pub name: String,
}

/// Result of inspecting one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// Every byte still erased.
    Erased,
    /// A trusted record.
    Valid(MetaRecord),
    /// Anything else: torn write, bit rot, foreign data.
    Invalid(&'static str),
}

impl MetaRecord {
    /// START record for a new session.
    #[must_use]
    pub fn start(seq: u32, start_addr: u32, timestamp: Timestamp, name: &str) -> Self {
        Self {
            kind: RecordKind::Start,
            seq,
            start_addr,
            size: 0,
            timestamp,
            name: truncate_name(name),
        }
    }

    /// FINAL record closing session `seq`.
    #[must_use]
    pub fn finish(seq: u32, start_addr: u32, size: u32, timestamp: Timestamp, name: &str) -> Self {
        Self {
            kind: RecordKind::Final,
            size,
            ..Self::start(seq, start_addr, timestamp, name)
        }
    }

    /// DEL record with its own `seq` removing session `target`.
    #[must_use]
    pub fn delete(seq: u32, target: u32) -> Self {
        Self {
            kind: RecordKind::Delete,
            seq,
            start_addr: target,
            size: 0,
            timestamp: Timestamp::default(),
            name: String::new(),
        }
    }

    /// Serialize into a full slot image.
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut slot = [ERASED; RECORD_SIZE];
        slot[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        slot[4..6].copy_from_slice(&VERSION.to_le_bytes());
        slot[6] = self.kind as u8;
        slot[7] = 0;
        slot[8..12].copy_from_slice(&self.seq.to_le_bytes());
        slot[12..16].copy_from_slice(&self.start_addr.to_le_bytes());
        slot[16..20].copy_from_slice(&self.size.to_le_bytes());
        slot[20..22].copy_from_slice(&self.timestamp.year.to_le_bytes());
        slot[22] = self.timestamp.month;
        slot[23] = self.timestamp.day;
        slot[24] = self.timestamp.hour;
        slot[25] = self.timestamp.minute;
        slot[26] = self.timestamp.second;

        let name = self.name.as_bytes();
        let len = name.len().min(NAME_CAPACITY);
        slot[27] = u8::try_from(len).unwrap_or(u8::MAX);
        slot[NAME_OFFSET..CHECKSUM_OFFSET].fill(0);
        slot[NAME_OFFSET..NAME_OFFSET + len].copy_from_slice(&name[..len]);

        let crc = checksum(&slot);
        slot[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        slot
    }

    /// Inspect a slot image.
    #[must_use]
    pub fn decode(slot: &[u8; RECORD_SIZE]) -> Slot {
        if slot.iter().all(|b| *b == ERASED) {
            return Slot::Erased;
        }
        if read_u32(slot, 0) != MAGIC {
            return Slot::Invalid("bad magic");
        }
        if u16::from_le_bytes([slot[4], slot[5]]) != VERSION {
            return Slot::Invalid("unsupported version");
        }
        if read_u32(slot, CHECKSUM_OFFSET) != checksum(slot) {
            return Slot::Invalid("checksum mismatch");
        }
        let Some(kind) = RecordKind::from_byte(slot[6]) else {
            return Slot::Invalid("unknown record type");
        };

        let len = usize::from(slot[27]).min(NAME_CAPACITY);
        let name = String::from_utf8_lossy(&slot[NAME_OFFSET..NAME_OFFSET + len]).into_owned();

        Slot::Valid(Self {
            kind,
            seq: read_u32(slot, 8),
            start_addr: read_u32(slot, 12),
            size: read_u32(slot, 16),
            timestamp: Timestamp {
                year: u16::from_le_bytes([slot[20], slot[21]]),
                month: slot[22],
                day: slot[23],
                hour: slot[24],
                minute: slot[25],
                second: slot[26],
            },
            name,
        })
    }
}

/// CRC-32 over every field that precedes the checksum.
#[must_use]
pub fn checksum(slot: &[u8]) -> u32 {
    crc32fast::hash(&slot[..CHECKSUM_OFFSET])
}

fn read_u32(slot: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([slot[at], slot[at + 1], slot[at + 2], slot[at + 3]])
}

fn truncate_name(name: &str) -> String {
    if name.len() <= NAME_CAPACITY {
        return name.to_string();
    }
    let mut end = NAME_CAPACITY;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
