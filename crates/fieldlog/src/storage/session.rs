//! Logging session lifecycle.
//!
//! ```text
//!  Idle ──start, no time──▶ PendingStart ──time valid──┐
//!   │                                                  ▼
//!   └────────start, time valid──────────────────────▶ Logging
//!                                                      │ stop / region full
//!  Idle ◀────────────── finalize (FINAL + replay) ◀────┘
//! ```
//!
//! The START record is the durability point of a session: once it is in the
//! journal, a power loss leaves an incomplete entry whose size is recovered
//! on the next replay. Finalizing writes FINAL and rebuilds the index.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::data_log::WriteBuffer;
use super::record::MetaRecord;
use super::Storage;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flash::BlockDevice;
use crate::sample::{Fix, PositionSource, Timestamp, HEADER_LINE};

/// Journal slots a session needs: START and FINAL.
const SESSION_SLOTS: u32 = 2;

/// Where the session machine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session.
    Idle,
    /// Start requested, waiting for valid time.
    PendingStart,
    /// Samples are being recorded.
    Logging,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::PendingStart => write!(f, "pending start"),
            Self::Logging => write!(f, "logging"),
        }
    }
}

/// Why the last session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Someone asked for it.
    Requested,
    /// The data region ran out.
    RegionFull,
}

/// Timing and buffering of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Time between samples.
    pub sample_interval: Duration,
    /// Time between periodic flushes.
    pub flush_interval: Duration,
    /// Write buffer size in bytes.
    pub buffer_capacity: usize,
    /// Buffer fill that triggers a flush.
    pub flush_threshold: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(1000),
            flush_interval: Duration::from_millis(1500),
            buffer_capacity: 512,
            flush_threshold: 256,
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            sample_interval: config.sample_interval(),
            flush_interval: config.flush_interval(),
            buffer_capacity: config.session.buffer_capacity,
            flush_threshold: config.session.flush_threshold,
        }
    }
}

/// The session being recorded.
#[derive(Debug)]
pub(super) struct Session {
    pub(super) seq: u32,
    start_addr: u32,
    size: u32,
    timestamp: Timestamp,
    name: String,
    buffer: WriteBuffer,
    last_sample: Option<Instant>,
    last_flush: Instant,
}

/// Read-only view of the active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSession {
    /// Session id.
    pub seq: u32,
    /// File name.
    pub name: String,
    /// Start time.
    pub timestamp: Timestamp,
    /// Bytes already in flash.
    pub flushed: u32,
    /// Bytes waiting in the write buffer.
    pub buffered: usize,
}

impl<D: BlockDevice> Storage<D> {
    /// Current state of the session machine.
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.session.is_some() {
            SessionState::Logging
        } else if self.pending_start {
            SessionState::PendingStart
        } else {
            SessionState::Idle
        }
    }

    /// The session being recorded, if any.
    #[must_use]
    pub fn active_session(&self) -> Option<ActiveSession> {
        self.session.as_ref().map(|s| ActiveSession {
            seq: s.seq,
            name: s.name.clone(),
            timestamp: s.timestamp,
            flushed: s.size,
            buffered: s.buffer.len(),
        })
    }

    /// Why the most recent session ended.
    #[must_use]
    pub fn last_stop(&self) -> Option<StopReason> {
        self.last_stop
    }

    /// Ask for a new session.
    ///
    /// Starts right away when `source` has valid time, otherwise waits in
    /// [`SessionState::PendingStart`] until [`poll`](Self::poll) sees it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionActive`] unless idle, and the errors of an
    /// immediate start: [`Error::RegionFull`], [`Error::JournalFull`] or a
    /// device failure.
    pub fn request_start<S: PositionSource>(
        &mut self,
        source: &mut S,
        now: Instant,
    ) -> Result<SessionState> {
        if self.state() != SessionState::Idle {
            return Err(Error::SessionActive);
        }

        if source.time_valid() {
            let fix = source.snapshot();
            self.begin(&fix, now)?;
        } else {
            info!("Waiting for valid time before starting a session");
            self.pending_start = true;
        }
        Ok(self.state())
    }

    /// Ask the current session to end.
    ///
    /// A pending start is simply cancelled; an active session is finalized.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveSession`] when idle, or the errors of
    /// finalizing.
    pub fn request_stop(&mut self) -> Result<()> {
        if self.pending_start {
            self.pending_start = false;
            info!("Pending session start cancelled");
            return Ok(());
        }
        if self.session.is_none() {
            return Err(Error::NoActiveSession);
        }
        self.finalize(StopReason::Requested)
    }

    /// Advance the session machine to `now`.
    ///
    /// Starts a pending session once time is valid, takes a sample when one
    /// is due and flushes the write buffer on its period.
    ///
    /// # Errors
    ///
    /// Returns an error if a pending start fails admission or a device
    /// operation fails. A failed pending start returns to idle.
    pub fn poll<S: PositionSource>(&mut self, source: &mut S, now: Instant) -> Result<SessionState> {
        if self.pending_start && source.time_valid() {
            self.pending_start = false;
            let fix = source.snapshot();
            self.begin(&fix, now)?;
        }

        let Some(session) = &self.session else {
            return Ok(self.state());
        };
        let sample_due = match session.last_sample {
            Some(at) => now.duration_since(at) >= self.settings.sample_interval,
            None => true,
        };
        if sample_due && source.time_valid() {
            let fix = source.snapshot();
            self.record_sample(&fix)?;
            if let Some(session) = self.session.as_mut() {
                session.last_sample = Some(now);
            }
        }

        let flush_due = self
            .session
            .as_ref()
            .is_some_and(|s| now.duration_since(s.last_flush) >= self.settings.flush_interval);
        if flush_due {
            self.flush()?;
            if let Some(session) = self.session.as_mut() {
                session.last_flush = now;
            }
        }

        Ok(self.state())
    }

    /// Stage one fix as a payload line, flushing as the buffer fills.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveSession`] when not logging, or a device error.
    pub fn record_sample(&mut self, fix: &Fix) -> Result<()> {
        let line = fix.to_line();
        let Some(session) = &self.session else {
            return Err(Error::NoActiveSession);
        };

        if !session.buffer.fits(line.len()) {
            self.flush()?;
        }
        let Some(session) = self.session.as_mut() else {
            // The flush filled the region and ended the session.
            return Ok(());
        };
        session.buffer.push(line.as_bytes());
        debug!(seq = session.seq, "Sample recorded");

        if session.buffer.wants_flush() {
            self.flush()?;
        }
        Ok(())
    }

    /// Move buffered bytes to flash.
    ///
    /// Ends the session if the data region runs out.
    ///
    /// # Errors
    ///
    /// Returns an error if a device operation fails.
    pub fn flush(&mut self) -> Result<()> {
        if self.drain()? {
            self.finalize(StopReason::RegionFull)?;
        }
        Ok(())
    }

    /// Write the buffer out; `true` when the region filled up.
    fn drain(&mut self) -> Result<bool> {
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };
        if session.buffer.is_empty() {
            return Ok(false);
        }

        let pending = session.buffer.len();
        let written = self.data.append(&mut self.device, session.buffer.as_slice())?;
        session.size += written as u32;
        session.buffer.clear();
        debug!(seq = session.seq, bytes = written, "Flushed write buffer");

        if written < pending {
            warn!(
                seq = session.seq,
                dropped = pending - written,
                "Data region full"
            );
            return Ok(true);
        }
        Ok(false)
    }

    fn begin(&mut self, fix: &Fix, now: Instant) -> Result<()> {
        if self.data.is_full() {
            return Err(Error::RegionFull {
                cursor: self.data.cursor(),
            });
        }
        if self.journal.free_slots() < SESSION_SLOTS {
            return Err(Error::JournalFull {
                capacity: self.journal.capacity(),
            });
        }

        let seq = self.next_seq;
        let timestamp = fix.timestamp;
        let name = timestamp.file_name();
        let start_addr = self.data.cursor();
        let record = MetaRecord::start(seq, start_addr, timestamp, &name);
        self.journal.append(&mut self.device, &record)?;
        self.next_seq = seq.saturating_add(1);
        self.index.apply(&record);

        let mut buffer =
            WriteBuffer::new(self.settings.buffer_capacity, self.settings.flush_threshold);
        buffer.push(HEADER_LINE.as_bytes());
        info!(seq, %name, start_addr, "Session started");

        self.session = Some(Session {
            seq,
            start_addr,
            size: 0,
            timestamp,
            name,
            buffer,
            last_sample: None,
            last_flush: now,
        });
        self.last_stop = None;
        self.flush()
    }

    fn finalize(&mut self, reason: StopReason) -> Result<()> {
        let region_full = self.drain()?;
        let Some(session) = self.session.take() else {
            return Err(Error::NoActiveSession);
        };
        let reason = if region_full {
            StopReason::RegionFull
        } else {
            reason
        };

        let record = MetaRecord::finish(
            session.seq,
            session.start_addr,
            session.size,
            session.timestamp,
            &session.name,
        );
        let appended = self.journal.append(&mut self.device, &record);
        self.last_stop = Some(reason);
        self.replay()?;
        appended?;

        info!(
            seq = session.seq,
            name = %session.name,
            size = session.size,
            ?reason,
            "Session finalized"
        );
        Ok(())
    }
}
