//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// List command arguments.
#[derive(Debug, Args)]
pub struct ListCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Download command arguments.
#[derive(Debug, Args)]
pub struct DownloadCommand {
    /// File index as shown by `list`
    pub index: usize,

    /// Write to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Export command arguments.
#[derive(Debug, Args)]
pub struct ExportCommand {
    /// File index as shown by `list`
    pub index: usize,

    /// Write KML to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Delete command arguments.
#[derive(Debug, Args)]
pub struct DeleteCommand {
    /// File index as shown by `list`
    pub index: usize,
}

/// Reset command arguments.
#[derive(Debug, Args)]
pub struct ResetCommand {
    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Record command arguments.
#[derive(Debug, Args)]
pub struct RecordCommand {
    /// Feed file in payload format, one fix per line
    #[arg(value_name = "FEED")]
    pub feed: PathBuf,

    /// Replay speed relative to real time
    #[arg(short, long, default_value = "1.0")]
    pub rate: f64,

    /// Samples to wait before the feed reports valid time
    #[arg(long, default_value = "0")]
    pub warmup: u32,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_command_debug() {
        let cmd = DownloadCommand {
            index: 2,
            output: Some(PathBuf::from("track.csv")),
        };
        let debug = format!("{cmd:?}");
        assert!(debug.contains("DownloadCommand"));
        assert!(debug.contains("track.csv"));
    }

    #[test]
    fn test_record_command_debug() {
        let cmd = RecordCommand {
            feed: PathBuf::from("feed.csv"),
            rate: 10.0,
            warmup: 3,
        };
        let debug = format!("{cmd:?}");
        assert!(debug.contains("RecordCommand"));
        assert!(debug.contains("rate: 10.0"));
    }

    #[test]
    fn test_config_command_debug() {
        let cmd = ConfigCommand::Show { json: true };
        let debug = format!("{cmd:?}");
        assert!(debug.contains("Show"));
        assert!(debug.contains("json: true"));
    }
}
