//! Metadata scan over slicer output.
//!
//! Only two summary comments are recognised:
//!
//! ```text
//! ; filament used = 5mm (3cm3)
//! ; estimated printing time = 1d 3h 12m 5s
//! ```
//!
//! The file is read once, line by line. A later match replaces an earlier one
//! for the same field because slicers may repeat the summary near the end.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Value of any field that was not found.
pub const UNKNOWN: f64 = -1.0;

const FILAMENT_KEY: &str = "filament used";
const PRINT_TIME_KEY: &str = "estimated printing time";
const NORMAL_MODE: &str = "(normal mode)";

/// Filament usage of one extruder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToolUsage {
    /// Millimetres of filament.
    pub length: f64,
    /// Cubic centimetres of filament.
    pub volume: f64,
}

impl Default for ToolUsage {
    fn default() -> Self {
        Self {
            length: UNKNOWN,
            volume: UNKNOWN,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FilamentUsage {
    pub tool0: ToolUsage,
}

/// Print metadata in the shape print servers expect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Seconds, or [`UNKNOWN`].
    #[serde(rename = "estimatedPrintTime")]
    pub estimated_print_time_seconds: f64,
    pub filament: FilamentUsage,
}

impl Default for Analysis {
    fn default() -> Self {
        Self {
            estimated_print_time_seconds: UNKNOWN,
            filament: FilamentUsage::default(),
        }
    }
}

impl Analysis {
    pub fn filament_length_mm(&self) -> f64 {
        self.filament.tool0.length
    }

    pub fn filament_volume_cm3(&self) -> f64 {
        self.filament.tool0.volume
    }

    pub fn is_unknown(&self) -> bool {
        *self == Analysis::default()
    }

    fn apply_line(&mut self, line: &str) {
        if let Some((length, volume)) = parse_filament_line(line) {
            self.filament.tool0 = ToolUsage { length, volume };
        }
        if let Some(seconds) = parse_print_time_line(line) {
            self.estimated_print_time_seconds = seconds;
        }
    }
}

/// Scan any buffered reader. Invalid UTF-8 is replaced, not rejected.
pub fn analyze_reader<R: BufRead>(mut reader: R) -> io::Result<Analysis> {
    let mut analysis = Analysis::default();
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        // Summary lines are comments; skip the motion commands quickly.
        let first = buf.iter().find(|b| !b.is_ascii_whitespace());
        if first != Some(&b';') {
            continue;
        }
        analysis.apply_line(&String::from_utf8_lossy(&buf));
    }
    Ok(analysis)
}

/// Scan the g-code at `path`. A missing or unreadable file is not an error:
/// it simply has nothing to report yet.
pub fn analyze_gcode(path: &Path) -> Analysis {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            tracing::debug!("No g-code to analyze at '{}': {}", path.display(), e);
            return Analysis::default();
        }
    };
    match analyze_reader(BufReader::new(file)) {
        Ok(analysis) => analysis,
        Err(e) => {
            tracing::warn!("Failed while reading '{}' for analysis: {}", path.display(), e);
            Analysis::default()
        }
    }
}

/// [`analyze_gcode`] on the blocking pool.
pub async fn analyze_gcode_async(path: PathBuf) -> Analysis {
    let shown = path.display().to_string();
    match tokio::task::spawn_blocking(move || analyze_gcode(&path)).await {
        Ok(analysis) => analysis,
        Err(e) => {
            tracing::error!("Analysis task for '{}' failed: {}", shown, e);
            Analysis::default()
        }
    }
}

/// Strip `; <key>` and the following `=`, tolerating whitespace everywhere.
fn comment_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.trim_start().strip_prefix(';')?.trim_start();
    let rest = rest.strip_prefix(key)?.trim_start();
    let rest = match rest.strip_prefix(NORMAL_MODE) {
        Some(after_mode) if key == PRINT_TIME_KEY => after_mode.trim_start(),
        _ => rest,
    };
    Some(rest.strip_prefix('=')?.trim())
}

/// Leading `[0-9.]+` run and the remainder.
fn take_number(text: &str) -> Option<(f64, &str)> {
    let end = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    if end == 0 {
        return None;
    }
    let value = text[..end].parse::<f64>().ok()?;
    Some((value, &text[end..]))
}

/// `; filament used = <length>mm (<volume>cm3)`
fn parse_filament_line(line: &str) -> Option<(f64, f64)> {
    let value = comment_value(line, FILAMENT_KEY)?;
    let (length, rest) = take_number(value)?;
    let rest = rest.trim_start().strip_prefix("mm")?.trim_start();
    let rest = rest.strip_prefix('(')?.trim_start();
    let (volume, rest) = take_number(rest)?;
    let rest = rest.trim_start().strip_prefix("cm3")?.trim_start();
    rest.strip_prefix(')')?;
    Some((length, volume))
}

fn unit_seconds(unit: char) -> Option<f64> {
    match unit {
        'd' => Some(86_400.0),
        'h' => Some(3_600.0),
        'm' => Some(60.0),
        's' => Some(1.0),
        _ => None,
    }
}

/// `; estimated printing time = 1d 3h 5m 2s`, tokens may also be packed (`1d3h`).
fn parse_print_time_line(line: &str) -> Option<f64> {
    let mut rest = comment_value(line, PRINT_TIME_KEY)?;
    let mut total = 0.0;
    let mut tokens = 0;
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let (value, after) = take_number(rest)?;
        let mut chars = after.chars();
        let seconds = unit_seconds(chars.next()?)?;
        total += value * seconds;
        tokens += 1;
        rest = chars.as_str();
    }
    (tokens > 0).then_some(total)
}
