//! Command-line interface for fieldlog.
//!
//! This module provides the CLI structure for the `fieldlog` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    ConfigCommand, DeleteCommand, DownloadCommand, ExportCommand, ListCommand, RecordCommand,
    ResetCommand, StatusCommand,
};

/// fieldlog - Power-loss tolerant field data logger
///
/// Manages the tracks stored in a NOR flash image: list, download, export
/// to KML, delete, and record new sessions from a position feed.
#[derive(Debug, Parser)]
#[command(name = "fieldlog")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Flash image to use instead of the configured one
    #[arg(short, long, global = true, value_name = "FILE")]
    pub image: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// List stored files
    List(ListCommand),

    /// Write a stored file's raw payload
    Download(DownloadCommand),

    /// Render a stored file as KML
    Export(ExportCommand),

    /// Delete a stored file
    Delete(DeleteCommand),

    /// Forget every stored file
    Reset(ResetCommand),

    /// Show storage usage
    Status(StatusCommand),

    /// Record a session from a feed file
    Record(RecordCommand),

    /// View configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}
