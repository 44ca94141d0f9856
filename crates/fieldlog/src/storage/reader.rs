//! Pull-based readers over a stored payload.

use std::io;
use std::ops::Range;

use crate::error::Result;
use crate::flash::BlockDevice;

/// Longest line kept by [`LineReader`]; the rest of a longer line is dropped.
pub const MAX_LINE: usize = 128;

/// One line from a [`LineReader`], without its `\r\n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line<'a> {
    /// Line content, at most [`MAX_LINE`] bytes.
    pub bytes: &'a [u8],
    /// The stored line was longer than [`MAX_LINE`] and got cut.
    pub truncated: bool,
}

const CHUNK: usize = 256;

/// Byte stream over one payload range, read straight from flash.
#[derive(Debug)]
pub struct PayloadReader<'a, D> {
    device: &'a mut D,
    pos: u32,
    end: u32,
}

impl<'a, D: BlockDevice> PayloadReader<'a, D> {
    /// Reader over `range`.
    pub fn new(device: &'a mut D, range: Range<u32>) -> Self {
        Self {
            device,
            pos: range.start,
            end: range.end,
        }
    }

    /// Bytes not yet read.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.end.saturating_sub(self.pos)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len().min(self.remaining() as usize);
        if len == 0 {
            return Ok(0);
        }
        self.device.read(self.pos, &mut buf[..len])?;
        self.pos += len as u32;
        Ok(len)
    }
}

impl<D: BlockDevice> io::Read for PayloadReader<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunk(buf)
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

/// Yields one line at a time from a payload, holding at most one chunk and
/// one line in memory.
///
/// Lines are returned without their `\r\n`. Every `yield_every` lines the
/// device's cooperative yield hook runs.
#[derive(Debug)]
pub struct LineReader<'a, D> {
    inner: PayloadReader<'a, D>,
    chunk: [u8; CHUNK],
    chunk_len: usize,
    chunk_pos: usize,
    line: Vec<u8>,
    lines: usize,
    yield_every: usize,
}

impl<'a, D: BlockDevice> LineReader<'a, D> {
    /// Line reader over `range`. A `yield_every` of zero never yields.
    pub fn new(device: &'a mut D, range: Range<u32>, yield_every: usize) -> Self {
        Self {
            inner: PayloadReader::new(device, range),
            chunk: [0; CHUNK],
            chunk_len: 0,
            chunk_pos: 0,
            line: Vec::with_capacity(MAX_LINE + 1),
            lines: 0,
            yield_every,
        }
    }

    /// Number of lines returned so far.
    #[must_use]
    pub fn lines_read(&self) -> usize {
        self.lines
    }

    /// Next line, or `None` at the end of the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if flash cannot be read.
    pub fn next_line(&mut self) -> Result<Option<Line<'_>>> {
        self.line.clear();
        let mut consumed = false;
        let mut dropped = false;

        loop {
            if self.chunk_pos == self.chunk_len {
                self.chunk_len = self.inner.read_chunk(&mut self.chunk)?;
                self.chunk_pos = 0;
                if self.chunk_len == 0 {
                    if !consumed {
                        return Ok(None);
                    }
                    break;
                }
            }

            let byte = self.chunk[self.chunk_pos];
            self.chunk_pos += 1;
            consumed = true;
            if byte == b'\n' {
                break;
            }
            // One spare byte so a trailing `\r` doesn't count as overflow.
            if self.line.len() <= MAX_LINE {
                self.line.push(byte);
            } else {
                dropped = true;
            }
        }

        if self.line.last() == Some(&b'\r') && !dropped {
            self.line.pop();
        }
        let truncated = dropped || self.line.len() > MAX_LINE;
        self.line.truncate(MAX_LINE);

        self.lines += 1;
        if self.yield_every > 0 && self.lines % self.yield_every == 0 {
            self.inner.device.yield_now();
        }
        Ok(Some(Line {
            bytes: &self.line,
            truncated,
        }))
    }
}
