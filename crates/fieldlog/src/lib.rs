//! `fieldlog` - A power-loss tolerant field data logger
//!
//! This library stores position tracks on raw NOR flash without a file
//! system: a checksummed metadata journal, an append-only payload region,
//! a file index rebuilt by replay at mount, and a streaming KML exporter.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod export;
pub mod flash;
pub mod logging;
pub mod sample;
pub mod storage;

pub use config::Config;
pub use controller::{Controller, ControllerStatus, StopHandle};
pub use error::{Error, Result};
pub use flash::{BlockDevice, FileFlash, FlashGeometry, FlashLayout, MemoryFlash};
pub use logging::init_logging;
pub use sample::{Fix, PositionSource, ReplaySource, Timestamp};
pub use storage::{FileInfo, SessionSettings, SessionState, Storage, StorageStats};
