//! Position fixes and the payload line format.
//!
//! A logging session stores one text line per fix:
//!
//! ```text
//! latitude,longitude,elevation,time,speed_kmh
//! 52.520008,13.404954,34,2024-05-01 09:30:00,12
//! ```
//!
//! The same format is read back by the exporter and by [`ReplaySource`].

use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// First line of every stored payload.
pub const HEADER_LINE: &str = "latitude,longitude,elevation,time,speed_kmh\r\n";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Wall-clock time as stored in journal records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Full year, e.g. 2024.
    pub year: u16,
    /// 1-12.
    pub month: u8,
    /// 1-31.
    pub day: u8,
    /// 0-23.
    pub hour: u8,
    /// 0-59.
    pub minute: u8,
    /// 0-59.
    pub second: u8,
}

impl Timestamp {
    /// Convert to a calendar date-time, if the fields form a real one.
    #[must_use]
    pub fn to_datetime(self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(
            i32::from(self.year),
            u32::from(self.month),
            u32::from(self.day),
        )?
        .and_hms_opt(
            u32::from(self.hour),
            u32::from(self.minute),
            u32::from(self.second),
        )
    }

    /// Parse the `YYYY-MM-DD HH:MM:SS` form, with or without surrounding quotes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedLine`] if the text is not a valid time.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim().trim_matches('"');
        let dt = NaiveDateTime::parse_from_str(text, TIME_FORMAT)
            .map_err(|e| Error::malformed(format!("bad time {text:?}: {e}")))?;
        Self::try_from(dt)
    }

    /// Stored file name derived from this time.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "{:04}{:02}{:02}_{:02}{:02}{:02}.csv",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

impl TryFrom<NaiveDateTime> for Timestamp {
    type Error = Error;

    // chrono keeps every field below the year within a byte.
    #[allow(clippy::cast_possible_truncation)]
    fn try_from(dt: NaiveDateTime) -> Result<Self> {
        let year = u16::try_from(dt.year())
            .map_err(|_| Error::malformed(format!("year {} out of range", dt.year())))?;
        Ok(Self {
            year,
            month: dt.month() as u8,
            day: dt.day() as u8,
            hour: dt.hour() as u8,
            minute: dt.minute() as u8,
            second: dt.second() as u8,
        })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// A snapshot from the position/time source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fix {
    /// UTC time of the fix.
    pub timestamp: Timestamp,
    /// Degrees, positive north.
    pub latitude: f64,
    /// Degrees, positive east.
    pub longitude: f64,
    /// Meters above mean sea level.
    pub altitude: f64,
    /// Ground speed in km/h.
    pub speed_kmh: f64,
    /// Satellites used in the solution.
    pub satellites: u8,
    /// Age of the underlying position data.
    pub fix_age: Duration,
}

impl Fix {
    /// Render this fix as a payload line.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "{:.6},{:.6},{:.0},{},{:.0}\r\n",
            self.latitude, self.longitude, self.altitude, self.timestamp, self.speed_kmh
        )
    }
}

/// One parsed payload line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Degrees, positive north.
    pub latitude: f64,
    /// Degrees, positive east.
    pub longitude: f64,
    /// Meters.
    pub altitude: f64,
    /// Time the sample was taken.
    pub timestamp: Timestamp,
    /// km/h.
    pub speed_kmh: f64,
}

impl Sample {
    /// Parse one payload line. Trailing `\r`/`\n` are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedLine`] unless the line has exactly five
    /// fields that all parse.
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.trim_end_matches(['\r', '\n']).split(',');
        let mut next = |what: &str| {
            fields
                .next()
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .ok_or_else(|| Error::malformed(format!("missing {what}")))
        };

        let latitude = parse_number(next("latitude")?, "latitude")?;
        let longitude = parse_number(next("longitude")?, "longitude")?;
        let altitude = parse_number(next("elevation")?, "elevation")?;
        let timestamp = Timestamp::parse(next("time")?)?;
        let speed_kmh = parse_number(next("speed")?, "speed")?;
        if fields.next().is_some() {
            return Err(Error::malformed("too many fields"));
        }

        Ok(Self {
            latitude,
            longitude,
            altitude,
            timestamp,
            speed_kmh,
        })
    }
}

fn parse_number(text: &str, what: &str) -> Result<f64> {
    let value: f64 = text
        .parse()
        .map_err(|_| Error::malformed(format!("bad {what} {text:?}")))?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::malformed(format!("non-finite {what}")))
    }
}

/// Source of position and absolute time, typically a GNSS receiver.
pub trait PositionSource {
    /// Take in whatever the feed produced since the last call.
    ///
    /// Called once per control loop iteration, before anything else.
    fn poll(&mut self) {}

    /// Whether absolute time is currently known.
    fn time_valid(&self) -> bool;

    /// Latest fix. Only meaningful while [`time_valid`](Self::time_valid).
    fn snapshot(&mut self) -> Fix;

    /// Whether the feed has ended for good.
    fn is_finished(&self) -> bool {
        false
    }
}

/// Feeds fixes recorded in payload format, one per [`poll`](PositionSource::poll).
///
/// Stands in for the sensor decoder on the host. Reports no valid time
/// until the first fix has been polled (after `warmup` empty polls), and
/// again once the recording is exhausted.
#[derive(Debug)]
pub struct ReplaySource {
    fixes: Vec<Fix>,
    current: Option<usize>,
    warmup: u32,
}

impl ReplaySource {
    /// Build a source from payload text. The header and malformed lines are skipped.
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        let fixes = text
            .lines()
            .filter_map(|line| Sample::parse(line).ok())
            .map(|s| Fix {
                timestamp: s.timestamp,
                latitude: s.latitude,
                longitude: s.longitude,
                altitude: s.altitude,
                speed_kmh: s.speed_kmh,
                satellites: 0,
                fix_age: Duration::ZERO,
            })
            .collect();
        Self {
            fixes,
            current: None,
            warmup: 0,
        }
    }

    /// Read a feed file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_text(&std::fs::read_to_string(path)?))
    }

    /// Produce nothing for the first `polls` polls.
    #[must_use]
    pub fn with_warmup(mut self, polls: u32) -> Self {
        self.warmup = polls;
        self
    }

    /// Number of fixes not yet reached.
    #[must_use]
    pub fn remaining(&self) -> usize {
        let consumed = self.current.map_or(0, |i| i + 1);
        self.fixes.len().saturating_sub(consumed)
    }

    /// Whether the feed has moved past its last fix.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.current.is_some_and(|i| i >= self.fixes.len()) || self.fixes.is_empty()
    }
}

impl PositionSource for ReplaySource {
    fn poll(&mut self) {
        if self.warmup > 0 {
            self.warmup -= 1;
            return;
        }
        self.current = Some(self.current.map_or(0, |i| (i + 1).min(self.fixes.len())));
    }

    fn time_valid(&self) -> bool {
        self.current.is_some() && !self.is_exhausted()
    }

    fn snapshot(&mut self) -> Fix {
        self.current
            .and_then(|i| self.fixes.get(i))
            .cloned()
            .unwrap_or_default()
    }

    fn is_finished(&self) -> bool {
        self.is_exhausted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> Timestamp {
        Timestamp {
            year: 2024,
            month: 5,
            day: 1,
            hour: 9,
            minute: 3,
            second: 7,
        }
    }

    #[test]
    fn test_timestamp_display() {
        assert_eq!(ts().to_string(), "2024-05-01 09:03:07");
    }

    #[test]
    fn test_timestamp_file_name() {
        assert_eq!(ts().file_name(), "20240501_090307.csv");
    }

    #[test]
    fn test_timestamp_parse_quoted() {
        assert_eq!(Timestamp::parse("\"2024-05-01 09:03:07\"").unwrap(), ts());
        assert_eq!(Timestamp::parse("2024-05-01 09:03:07").unwrap(), ts());
    }

    #[test]
    fn test_timestamp_parse_invalid() {
        assert!(Timestamp::parse("2024-13-01 09:03:07").is_err());
        assert!(Timestamp::parse("yesterday").is_err());
    }

    #[test]
    fn test_timestamp_to_datetime_rejects_garbage() {
        let mut t = ts();
        t.month = 0;
        assert!(t.to_datetime().is_none());
        assert!(ts().to_datetime().is_some());
    }

    #[test]
    fn test_fix_to_line() {
        let fix = Fix {
            timestamp: ts(),
            latitude: 52.520_008,
            longitude: -13.404_954,
            altitude: 34.4,
            speed_kmh: 12.6,
            satellites: 7,
            fix_age: Duration::from_millis(200),
        };
        assert_eq!(
            fix.to_line(),
            "52.520008,-13.404954,34,2024-05-01 09:03:07,13\r\n"
        );
    }

    #[test]
    fn test_sample_parse() {
        let s = Sample::parse("52.520008,13.404954,34,\"2024-05-01 09:03:07\",12\r\n").unwrap();
        assert!((s.latitude - 52.520_008).abs() < 1e-9);
        assert!((s.longitude - 13.404_954).abs() < 1e-9);
        assert!((s.altitude - 34.0).abs() < f64::EPSILON);
        assert_eq!(s.timestamp, ts());
        assert!((s.speed_kmh - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sample_parse_rejects_header() {
        assert!(Sample::parse(HEADER_LINE).is_err());
    }

    #[test]
    fn test_sample_parse_rejects_short_and_long_lines() {
        assert!(Sample::parse("1.0,2.0,3").is_err());
        assert!(Sample::parse("1.0,2.0,3,2024-05-01 09:03:07,4,5").is_err());
        assert!(Sample::parse("1.0,,3,2024-05-01 09:03:07,4").is_err());
        assert!(Sample::parse("").is_err());
    }

    #[test]
    fn test_fix_line_round_trips_through_sample() {
        let fix = Fix {
            timestamp: ts(),
            latitude: 1.5,
            longitude: 2.25,
            altitude: 100.0,
            speed_kmh: 40.0,
            satellites: 9,
            fix_age: Duration::ZERO,
        };
        let s = Sample::parse(&fix.to_line()).unwrap();
        assert_eq!(s.timestamp, fix.timestamp);
        assert!((s.speed_kmh - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_replay_source() {
        let text = format!(
            "{HEADER_LINE}1.0,2.0,3,2024-05-01 09:03:07,4\r\ngarbage\r\n5.0,6.0,7,2024-05-01 09:03:08,8\r\n"
        );
        let mut source = ReplaySource::from_text(&text).with_warmup(1);

        assert_eq!(source.remaining(), 2);
        assert!(!source.time_valid());
        source.poll();
        assert!(!source.time_valid());

        source.poll();
        assert!(source.time_valid());
        assert!((source.snapshot().latitude - 1.0).abs() < f64::EPSILON);
        // Snapshots don't advance the feed.
        assert!((source.snapshot().latitude - 1.0).abs() < f64::EPSILON);

        source.poll();
        assert!((source.snapshot().latitude - 5.0).abs() < f64::EPSILON);
        assert_eq!(source.remaining(), 0);
        assert!(!source.is_finished());

        source.poll();
        assert!(source.is_finished());
        assert!(!source.time_valid());
    }

    #[test]
    fn test_empty_replay_source_is_finished() {
        let mut source = ReplaySource::from_text(HEADER_LINE);
        source.poll();
        assert!(source.is_finished());
        assert!(!source.time_valid());
        assert_eq!(source.snapshot(), Fix::default());
    }
}
