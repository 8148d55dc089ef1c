//! Arguments shared by every command that reads an image

use clap::Args;
use memrecover::ImageFormat;
use std::path::PathBuf;

use super::core::parse_number;

#[derive(Args, Debug, Clone)]
pub struct ImageArgs {
    /// Memory image (raw dump or LiME capture)
    #[arg(short, long, env = "MEMRECOVER_IMAGE")]
    pub image: PathBuf,

    /// Force the image format instead of detecting it (raw, lime)
    #[arg(long)]
    pub image_format: Option<ImageFormat>,

    /// Presence-map page size (defaults to the configured value, then 4096)
    #[arg(long, value_parser = parse_number)]
    pub page_size: Option<u64>,

    /// File of physical ranges that were never captured ("START END" per line)
    #[arg(long)]
    pub absent: Option<PathBuf>,
}

/// Which process to recover from, and how its areas are found
#[derive(Args, Debug, Clone)]
pub struct ProcessArgs {
    /// Kernel profile (YAML/JSON); defaults to the configured profile
    #[arg(long, conflicts_with = "maps")]
    pub profile: Option<PathBuf>,

    /// Select the process by pid
    #[arg(long, conflicts_with = "name")]
    pub pid: Option<i32>,

    /// Select the process by name (exact comm match)
    #[arg(long)]
    pub name: Option<String>,

    /// Saved /proc/<pid>/maps with the capture's region table, instead of a
    /// kernel walk
    #[arg(long)]
    pub maps: Option<PathBuf>,
}
