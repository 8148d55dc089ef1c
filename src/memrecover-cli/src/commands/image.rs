//! Image command handlers (`info`, `read`)

use anyhow::Result;
use memrecover::{ImageFormat, MemoryImage, PhysicalMemory};
use serde::Serialize;

use crate::cli::{ImageArgs, OutputFormat};
use crate::commands::open_image;
use crate::config::Config;
use crate::output::{emit, hex_dump};

#[derive(Debug, Serialize)]
pub struct ImageInfo {
    pub path: String,
    pub format: ImageFormat,
    pub size: u64,
    pub page_size: u64,
    pub resident_pages: u64,
    pub absent_pages: u64,
    /// Absent physical ranges, half-open
    pub absent: Vec<(u64, u64)>,
}

impl ImageInfo {
    pub fn of(image: &MemoryImage) -> Self {
        let (resident_pages, absent_pages) = image.page_counts();
        Self {
            path: image
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            format: image.format(),
            size: image.size(),
            page_size: image.page_size(),
            resident_pages,
            absent_pages,
            absent: image.presence().ranges().collect(),
        }
    }
}

/// Handle the `info` command
pub fn info(args: &ImageArgs, format: OutputFormat, config: &Config) -> Result<()> {
    let image = open_image(args, config)?;
    emit(&ImageInfo::of(&image), format, |info| {
        println!("Image:     {}", info.path);
        println!("Format:    {}", info.format);
        println!("Size:      {:#x} ({} bytes)", info.size, info.size);
        println!("Page size: {:#x}", info.page_size);
        println!(
            "Pages:     {} resident, {} absent",
            info.resident_pages, info.absent_pages
        );
        for (start, end) in &info.absent {
            println!("  absent {:#x}-{:#x}", start, end);
        }
    })
}

/// Handle the `read` command
///
/// Absent pages are shown as the configured fill byte and flagged.
pub fn read(args: &ImageArgs, offset: u64, size: u64, config: &Config) -> Result<()> {
    let image = open_image(args, config)?;
    let (mut data, absent) = image.read_zero_filled(offset, size as usize)?;

    if let Some(fill) = config.display_fill {
        for &(start, len) in &absent {
            let from = (start - offset) as usize;
            data[from..from + len as usize].fill(fill);
        }
    }

    println!("Reading {} bytes at {:#x}:", size, offset);
    print!("{}", hex_dump(offset, &data, &absent));
    if !absent.is_empty() {
        let missing: u64 = absent.iter().map(|&(_, len)| len).sum();
        println!("{:#x} of {:#x} bytes were not captured", missing, size);
    }

    Ok(())
}
