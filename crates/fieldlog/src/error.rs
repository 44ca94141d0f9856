//! Error types for fieldlog.
//!
//! This module defines all error types used throughout the fieldlog crate,
//! providing detailed context for debugging and user-friendly error messages.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for fieldlog operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Flash Errors ===
    /// An access fell outside the device.
    #[error("flash access out of bounds: {len} bytes at {addr:#010x} (device is {capacity} bytes)")]
    OutOfBounds {
        /// Start address of the access.
        addr: u32,
        /// Length of the access.
        len: usize,
        /// Device capacity in bytes.
        capacity: u32,
    },

    /// An erase address was not sector aligned.
    #[error("erase address {addr:#010x} is not aligned to a {sector_size}-byte sector")]
    MisalignedErase {
        /// The offending address.
        addr: u32,
        /// Sector size of the device.
        sector_size: u32,
    },

    /// A program operation would cross a page boundary.
    #[error("program of {len} bytes at {addr:#010x} crosses a {page_size}-byte page boundary")]
    PageOverrun {
        /// Start address of the program.
        addr: u32,
        /// Length of the program.
        len: usize,
        /// Page size of the device.
        page_size: u32,
    },

    // === Journal Errors ===
    /// The metadata journal has no free slot left.
    #[error("metadata journal is full ({capacity} slots)")]
    JournalFull {
        /// Total slot capacity of the journal.
        capacity: u32,
    },

    /// A journal slot failed validation during replay.
    #[error("corrupt journal record in slot {slot}: {reason}")]
    CorruptRecord {
        /// Slot index of the record.
        slot: u32,
        /// What was wrong with it.
        reason: &'static str,
    },

    // === Data Log Errors ===
    /// The data region has no room left.
    #[error("data region is full at {cursor:#010x}")]
    RegionFull {
        /// Write cursor at the time of the failure.
        cursor: u32,
    },

    // === Session Errors ===
    /// A session is already active or pending.
    #[error("a logging session is already active")]
    SessionActive,

    /// No session is active.
    #[error("no logging session is active")]
    NoActiveSession,

    /// The requested file index does not exist.
    #[error("no stored file at index {index}")]
    FileNotFound {
        /// The requested index.
        index: usize,
    },

    // === Export Errors ===
    /// A payload line could not be parsed.
    #[error("malformed payload line: {reason}")]
    MalformedLine {
        /// Why the line was rejected.
        reason: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// A specialized Result type for fieldlog operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a malformed line error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedLine {
            reason: reason.into(),
        }
    }

    /// Check if this error means the journal ran out of slots.
    #[must_use]
    pub fn is_journal_full(&self) -> bool {
        matches!(self, Self::JournalFull { .. })
    }

    /// Check if this error means the data region ran out of space.
    #[must_use]
    pub fn is_region_full(&self) -> bool {
        matches!(self, Self::RegionFull { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::JournalFull { capacity: 256 };
        assert_eq!(err.to_string(), "metadata journal is full (256 slots)");

        let err = Error::SessionActive;
        assert_eq!(err.to_string(), "a logging session is already active");
    }

    #[test]
    fn test_is_journal_full() {
        assert!(Error::JournalFull { capacity: 1 }.is_journal_full());
        assert!(!Error::SessionActive.is_journal_full());
    }

    #[test]
    fn test_is_region_full() {
        assert!(Error::RegionFull { cursor: 0x10_0000 }.is_region_full());
        assert!(!Error::NoActiveSession.is_region_full());
    }

    #[test]
    fn test_region_full_display_is_hex() {
        let err = Error::RegionFull { cursor: 0x0040_0000 };
        assert!(err.to_string().contains("0x00400000"));
    }

    #[test]
    fn test_page_overrun_display() {
        let err = Error::PageOverrun {
            addr: 0x1f0,
            len: 32,
            page_size: 256,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x000001f0"));
        assert!(msg.contains("256-byte page"));
    }

    #[test]
    fn test_corrupt_record_display() {
        let err = Error::CorruptRecord {
            slot: 7,
            reason: "checksum mismatch",
        };
        assert_eq!(
            err.to_string(),
            "corrupt journal record in slot 7: checksum mismatch"
        );
    }

    #[test]
    fn test_malformed_line() {
        let err = Error::malformed("missing speed");
        assert!(matches!(err, Error::MalformedLine { .. }));
        assert!(err.to_string().contains("missing speed"));
    }

    #[test]
    fn test_file_not_found_display() {
        let err = Error::FileNotFound { index: 3 };
        assert_eq!(err.to_string(), "no stored file at index 3");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_validation_error_display() {
        let err = Error::ConfigValidation {
            message: "sector_size must be a multiple of page_size".to_string(),
        };
        assert!(err.to_string().contains("sector_size"));
    }

    #[test]
    fn test_directory_create_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::DirectoryCreate {
            path: PathBuf::from("/root/forbidden"),
            source: io_err,
        };
        assert!(err.to_string().contains("/root/forbidden"));
    }
}
