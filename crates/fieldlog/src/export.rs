//! Streaming KML export of a stored payload.
//!
//! The payload is read twice straight from flash. The first pass finds the
//! top speed, the second writes one colored line segment per pair of
//! consecutive points. Nothing but the current and previous point is kept
//! in memory, and output goes to the writer as it is produced.

use std::io::Write;

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::ExportConfig;
use crate::error::{Error, Result};
use crate::flash::BlockDevice;
use crate::sample::Sample;
use crate::storage::index::FileEntry;
use crate::storage::reader::{Line, LineReader};

/// Hue at top speed, in degrees. Zero speed maps to red at 0°.
const MAX_HUE: f64 = 300.0;

/// Speed fractions marked in the legend.
const LEGEND_STOPS: [f64; 5] = [0.0, 0.25, 0.5, 0.75, 1.0];

/// What an export produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ExportSummary {
    /// Valid points found.
    pub points: usize,
    /// Line segments written.
    pub segments: usize,
    /// Lines skipped as unparseable, header excluded.
    pub skipped: usize,
    /// Speed mapped to the end of the color ramp, km/h.
    pub vmax: f64,
}

/// Render the payload of `entry` as a KML document into `out`.
///
/// # Errors
///
/// Returns an error if flash cannot be read or `out` fails.
pub fn write_kml<D, W>(
    device: &mut D,
    entry: &FileEntry,
    style: &ExportConfig,
    mut out: W,
) -> Result<ExportSummary>
where
    D: BlockDevice,
    W: Write,
{
    let mut summary = scan_speeds(device, entry, style)?;
    let palette = Palette::new(summary.vmax, style);

    write_header(&mut out, &entry.name, &palette)?;

    let mut lines = LineReader::new(device, entry.range(), style.yield_every_lines);
    lines.next_line()?;

    let mut prev: Option<Sample> = None;
    while let Some(line) = lines.next_line()? {
        let Ok(point) = parse_line(line) else {
            continue;
        };
        match prev {
            Some(from) => {
                write_segment(&mut out, &from, &point, &palette, style.line_width)?;
                summary.segments += 1;
            }
            None => write_marker(&mut out, "Start", &point)?,
        }
        prev = Some(point);
    }

    if let Some(last) = prev {
        write_marker(&mut out, "End", &last)?;
    }
    writeln!(out, "</Document>")?;
    writeln!(out, "</kml>")?;
    out.flush()?;

    debug!(
        name = %entry.name,
        points = summary.points,
        segments = summary.segments,
        skipped = summary.skipped,
        "KML export complete"
    );
    Ok(summary)
}

fn scan_speeds<D: BlockDevice>(
    device: &mut D,
    entry: &FileEntry,
    style: &ExportConfig,
) -> Result<ExportSummary> {
    let mut summary = ExportSummary::default();
    let mut lines = LineReader::new(device, entry.range(), style.yield_every_lines);
    lines.next_line()?;

    let mut vmax: f64 = 0.0;
    while let Some(line) = lines.next_line()? {
        match parse_line(line) {
            Ok(point) => {
                summary.points += 1;
                vmax = vmax.max(point.speed_kmh);
            }
            Err(e) => {
                trace!("skipping line: {e}");
                summary.skipped += 1;
            }
        }
    }

    summary.vmax = vmax.max(1.0);
    Ok(summary)
}

fn parse_line(line: Line<'_>) -> Result<Sample> {
    if line.truncated {
        return Err(Error::malformed("line too long"));
    }
    let text = std::str::from_utf8(line.bytes).map_err(|_| Error::malformed("not UTF-8"))?;
    Sample::parse(text)
}

/// Speed to color mapping for one export.
#[derive(Debug, Clone, Copy)]
struct Palette {
    vmax: f64,
    saturation: f64,
    value: f64,
}

impl Palette {
    fn new(vmax: f64, style: &ExportConfig) -> Self {
        Self {
            vmax,
            saturation: f64::from(style.saturation),
            value: f64::from(style.value),
        }
    }

    fn rgb(&self, speed: f64) -> (u8, u8, u8) {
        hsv_to_rgb(speed_hue(speed, self.vmax), self.saturation, self.value)
    }

    fn kml(&self, speed: f64) -> String {
        let (r, g, b) = self.rgb(speed);
        kml_color(r, g, b)
    }

    fn html(&self, speed: f64) -> String {
        let (r, g, b) = self.rgb(speed);
        format!("#{r:02x}{g:02x}{b:02x}")
    }
}

/// Hue in degrees for `speed` on a ramp ending at `vmax`.
#[must_use]
pub fn speed_hue(speed: f64, vmax: f64) -> f64 {
    if vmax <= 0.0 || !speed.is_finite() {
        return 0.0;
    }
    MAX_HUE * (speed / vmax).clamp(0.0, 1.0)
}

/// Convert HSV (hue in degrees, saturation and value in `[0, 1]`) to RGB.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn hsv_to_rgb(hue: f64, saturation: f64, value: f64) -> (u8, u8, u8) {
    let chroma = value * saturation;
    let h = hue.rem_euclid(360.0) / 60.0;
    let x = chroma * (1.0 - (h % 2.0 - 1.0).abs());
    let (r, g, b) = match h as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    let m = value - chroma;
    let scale = |c: f64| ((c + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    (scale(r), scale(g), scale(b))
}

/// Pack an opaque RGB color the way KML wants it: `aabbggrr`.
#[must_use]
pub fn kml_color(r: u8, g: u8, b: u8) -> String {
    format!("ff{b:02x}{g:02x}{r:02x}")
}

fn write_header<W: Write>(out: &mut W, name: &str, palette: &Palette) -> Result<()> {
    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(out, r#"<kml xmlns="http://www.opengis.net/kml/2.2">"#)?;
    writeln!(out, "<Document>")?;
    writeln!(out, "<name>{}</name>", escape(name))?;
    writeln!(out, "<Folder>")?;
    writeln!(out, "<name>Speed legend</name>")?;
    for stop in LEGEND_STOPS {
        let speed = stop * palette.vmax;
        writeln!(
            out,
            "<Placemark><name>{speed:.0} km/h</name>\
             <description><![CDATA[<font color=\"{}\">{speed:.0} km/h</font>]]></description>\
             <Style><LabelStyle><color>{}</color></LabelStyle></Style></Placemark>",
            palette.html(speed),
            palette.kml(speed),
        )?;
    }
    writeln!(out, "</Folder>")?;
    Ok(())
}

fn write_segment<W: Write>(
    out: &mut W,
    from: &Sample,
    to: &Sample,
    palette: &Palette,
    width: u32,
) -> Result<()> {
    let speed = (from.speed_kmh + to.speed_kmh) / 2.0;
    writeln!(
        out,
        "<Placemark><Style><LineStyle><color>{}</color><width>{width}</width></LineStyle></Style>\
         <LineString><tessellate>1</tessellate><altitudeMode>absolute</altitudeMode>\
         <coordinates>{} {}</coordinates></LineString></Placemark>",
        palette.kml(speed),
        coordinates(from),
        coordinates(to),
    )?;
    Ok(())
}

fn write_marker<W: Write>(out: &mut W, label: &str, at: &Sample) -> Result<()> {
    writeln!(
        out,
        "<Placemark><name>{label}</name><description>{}</description>\
         <Point><coordinates>{}</coordinates></Point></Placemark>",
        at.timestamp,
        coordinates(at),
    )?;
    Ok(())
}

fn coordinates(point: &Sample) -> String {
    format!(
        "{:.6},{:.6},{:.0}",
        point.longitude, point.latitude, point.altitude
    )
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
