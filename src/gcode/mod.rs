// src/gcode/mod.rs
//! G-code artifact inspection.

pub mod analysis;

pub use analysis::{analyze_gcode, analyze_gcode_async, analyze_reader, Analysis, FilamentUsage, ToolUsage, UNKNOWN};
