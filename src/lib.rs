// src/lib.rs - PrePrintService library root
//! Orchestration of external 3D-printing tools: orient a mesh with a tweak
//! tool, slice it into g-code, analyse the result and optionally relay the
//! artifacts to a remote print server.

pub mod config;
pub mod file_manager;
pub mod gcode;
pub mod jobs;
pub mod pipeline;
pub mod process;
pub mod relay;
pub mod web;
