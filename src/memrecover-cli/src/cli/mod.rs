//! CLI argument definitions for memrecover
//!
//! This module contains all clap-derived structs and enums for CLI parsing.

mod core;
mod source;

pub use core::{parse_number, Cli, Commands, OutputFormat};
pub use source::{ImageArgs, ProcessArgs};
