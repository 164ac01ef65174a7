//! Streammux - Incremental media transmuxing tool
//!
//! This library crate exposes configuration loading and the file-level
//! transmux driver used by the binary, for integration testing.

pub mod config;
pub mod transmux;
