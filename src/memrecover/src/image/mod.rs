//! Image Accessor
//!
//! Read-only access to a captured physical address space:
//! - Raw dumps, where file offset == physical offset
//! - LiME captures, where the file holds a list of physical ranges
//! - Owned byte buffers, for synthetic images
//!
//! Every read either returns exactly the requested bytes, fails with
//! [`Error::AbsentPage`] when the capture never held one of the pages, or
//! fails with [`Error::OutOfRange`] when it runs past the declared image size.

pub mod lime;
mod presence;

pub use presence::PresenceMap;

use byteorder::{ByteOrder, LE};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{Error, Result};

pub const DEFAULT_PAGE_SIZE: u64 = 0x1000;

/// Read access to a physical address space.
pub trait PhysicalMemory: Send + Sync {
    /// Read `len` bytes at a physical offset
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Declared size of the physical address space
    fn size(&self) -> u64;

    /// Granularity of the presence map
    fn page_size(&self) -> u64;

    /// Check whether the byte at `offset` was captured
    fn is_resident(&self, offset: u64) -> bool;

    /// Read a u64 from memory
    fn read_u64(&self, offset: u64) -> Result<u64> {
        let bytes = self.read(offset, 8)?;
        Ok(LE::read_u64(&bytes))
    }

    /// Read a u32 from memory
    fn read_u32(&self, offset: u64) -> Result<u32> {
        let bytes = self.read(offset, 4)?;
        Ok(LE::read_u32(&bytes))
    }

    /// Read an i32 from memory
    fn read_i32(&self, offset: u64) -> Result<i32> {
        let bytes = self.read(offset, 4)?;
        Ok(LE::read_i32(&bytes))
    }

    /// Read a null-terminated string of at most `max_len` bytes
    fn read_cstring(&self, offset: u64, max_len: usize) -> Result<String> {
        let bytes = self.read(offset, max_len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).to_string())
    }

    /// Read for display only: absent pages come back as zeros.
    ///
    /// Returns the bytes and the absent `(offset, len)` ranges that were filled.
    fn read_zero_filled(&self, offset: u64, len: usize) -> Result<(Vec<u8>, Vec<(u64, u64)>)> {
        let end = offset
            .checked_add(len as u64)
            .filter(|&end| end <= self.size())
            .ok_or(Error::OutOfRange {
                offset,
                len: len as u64,
                size: self.size(),
            })?;

        let page_size = self.page_size();
        let mut out = Vec::with_capacity(len);
        let mut filled: Vec<(u64, u64)> = Vec::new();
        let mut cur = offset;

        while cur < end {
            let chunk_end = (cur - cur % page_size + page_size).min(end);
            let chunk = (chunk_end - cur) as usize;
            match self.read(cur, chunk) {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(Error::AbsentPage { .. }) => {
                    out.resize(out.len() + chunk, 0);
                    match filled.last_mut() {
                        Some(last) if last.0 + last.1 == cur => last.1 += chunk as u64,
                        _ => filled.push((cur, chunk as u64)),
                    }
                }
                Err(e) => return Err(e),
            }
            cur = chunk_end;
        }

        Ok((out, filled))
    }
}

/// On-disk capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Lime,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Raw => write!(f, "raw"),
            ImageFormat::Lime => write!(f, "lime"),
        }
    }
}

impl FromStr for ImageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(ImageFormat::Raw),
            "lime" => Ok(ImageFormat::Lime),
            other => Err(Error::InvalidInput(format!("unknown image format '{}'", other))),
        }
    }
}

/// How to interpret an image file
#[derive(Debug, Clone)]
pub struct ImageOptions {
    /// Force a format instead of detecting it from the magic
    pub format: Option<ImageFormat>,
    pub page_size: u64,
    /// Physical ranges known to be missing (from the acquisition log)
    pub absent: Vec<(u64, u64)>,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            format: None,
            page_size: DEFAULT_PAGE_SIZE,
            absent: Vec::new(),
        }
    }
}

/// A physical range stored contiguously in the image file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalRun {
    pub start: u64,
    pub len: u64,
    pub file_offset: u64,
}

impl PhysicalRun {
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

enum Storage {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for Storage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Storage::Mapped(mmap) => mmap,
            Storage::Owned(bytes) => bytes,
        }
    }
}

/// An immutable memory capture
pub struct MemoryImage {
    storage: Storage,
    format: ImageFormat,
    runs: Vec<PhysicalRun>,
    size: u64,
    page_size: u64,
    presence: PresenceMap,
    /// Path to the image file (None for synthetic images)
    pub path: Option<PathBuf>,
}

impl MemoryImage {
    /// Open a capture file
    pub fn open<P: AsRef<Path>>(path: P, options: &ImageOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        // The capture is never written while we hold the mapping
        let mmap = unsafe { Mmap::map(&file) }?;

        let format = match options.format {
            Some(format) => format,
            None if lime::is_lime(&mmap) => ImageFormat::Lime,
            None => ImageFormat::Raw,
        };

        let mut image = Self::build(Storage::Mapped(mmap), format, options)?;
        image.path = Some(path);

        tracing::info!(
            path = ?image.path,
            format = %image.format,
            size = image.size,
            absent_bytes = image.presence.absent_bytes(image.size),
            "opened memory image"
        );

        Ok(image)
    }

    /// Wrap an in-memory byte buffer
    pub fn from_bytes(bytes: Vec<u8>, format: ImageFormat, options: &ImageOptions) -> Result<Self> {
        Self::build(Storage::Owned(bytes), format, options)
    }

    fn build(storage: Storage, format: ImageFormat, options: &ImageOptions) -> Result<Self> {
        let page_size = options.page_size;
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(Error::InvalidImage(format!(
                "page size {:#x} is not a power of two",
                page_size
            )));
        }

        let runs = match format {
            ImageFormat::Raw => vec![PhysicalRun {
                start: 0,
                len: storage.len() as u64,
                file_offset: 0,
            }],
            ImageFormat::Lime => lime::parse_runs(&storage)?,
        };

        let size = runs.last().map(PhysicalRun::end).unwrap_or(0);

        // Holes between captured runs were never acquired
        let mut presence = PresenceMap::new();
        let mut cursor = 0;
        for run in &runs {
            presence.mark_absent(cursor, run.start);
            cursor = run.end();
        }
        for &(start, end) in &options.absent {
            presence.mark_absent_pages(start, end.min(size), page_size);
        }

        Ok(Self {
            storage,
            format,
            runs,
            size,
            page_size,
            presence,
            path: None,
        })
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn presence(&self) -> &PresenceMap {
        &self.presence
    }

    /// Number of resident and absent pages
    pub fn page_counts(&self) -> (u64, u64) {
        let total = self.size.div_ceil(self.page_size);
        let absent = self
            .presence
            .ranges()
            .map(|(s, e)| {
                let first = s / self.page_size;
                let last = e.min(self.size).div_ceil(self.page_size);
                last.saturating_sub(first)
            })
            .sum::<u64>();
        (total.saturating_sub(absent), absent)
    }

    fn run_containing(&self, offset: u64) -> Option<&PhysicalRun> {
        let idx = self.runs.partition_point(|r| r.start <= offset);
        let run = self.runs.get(idx.checked_sub(1)?)?;
        (offset < run.end()).then_some(run)
    }

    fn page_floor(&self, offset: u64) -> u64 {
        offset - offset % self.page_size
    }
}

impl PhysicalMemory for MemoryImage {
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset
            .checked_add(len as u64)
            .filter(|&end| end <= self.size)
            .ok_or(Error::OutOfRange {
                offset,
                len: len as u64,
                size: self.size,
            })?;

        if let Some(absent) = self.presence.first_absent(offset, end) {
            return Err(Error::AbsentPage {
                page: self.page_floor(absent),
            });
        }

        let mut out = Vec::with_capacity(len);
        let mut cur = offset;
        while cur < end {
            let run = self.run_containing(cur).ok_or(Error::AbsentPage {
                page: self.page_floor(cur),
            })?;
            let take_end = end.min(run.end());
            let file_start = (run.file_offset + (cur - run.start)) as usize;
            let file_end = file_start + (take_end - cur) as usize;
            out.extend_from_slice(&self.storage[file_start..file_end]);
            cur = take_end;
        }

        Ok(out)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn is_resident(&self, offset: u64) -> bool {
        offset < self.size && !self.presence.is_absent(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_image(len: usize, absent: Vec<(u64, u64)>) -> MemoryImage {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let options = ImageOptions {
            absent,
            ..ImageOptions::default()
        };
        MemoryImage::from_bytes(bytes, ImageFormat::Raw, &options).unwrap()
    }

    #[test]
    fn test_read_raw() {
        let image = raw_image(0x3000, vec![]);
        let bytes = image.read(0x10, 4).unwrap();
        assert_eq!(bytes, vec![0x10, 0x11, 0x12, 0x13]);
        assert_eq!(image.size(), 0x3000);
    }

    #[test]
    fn test_read_past_end_is_out_of_range() {
        let image = raw_image(0x1000, vec![]);
        assert!(matches!(
            image.read(0xff0, 0x20),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            image.read(u64::MAX, 2),
            Err(Error::OutOfRange { .. })
        ));
        assert!(image.read(0xff0, 0x10).is_ok());
    }

    #[test]
    fn test_absent_page_is_reported_not_fabricated() {
        let image = raw_image(0x4000, vec![(0x1800, 0x1900)]);
        let err = image.read(0x0ff0, 0x20).unwrap_err();
        assert!(matches!(err, Error::AbsentPage { page: 0x1000 }));
        assert!(!image.is_resident(0x1000));
        assert!(image.is_resident(0x2000));
        assert_eq!(image.page_counts(), (3, 1));
    }

    #[test]
    fn test_zero_fill_is_explicit() {
        let image = raw_image(0x3000, vec![(0x1000, 0x2000)]);
        let (bytes, filled) = image.read_zero_filled(0xff0, 0x20).unwrap();
        assert_eq!(bytes.len(), 0x20);
        assert_eq!(&bytes[0x10..], &[0u8; 0x10]);
        assert_eq!(filled, vec![(0x1000, 0x10)]);
    }

    #[test]
    fn test_lime_holes_are_absent() {
        let low = vec![0xAAu8; 0x1000];
        let high = vec![0xBBu8; 0x1000];
        let data = lime::encode(&[(0, low.as_slice()), (0x3000, high.as_slice())]);
        let image =
            MemoryImage::from_bytes(data, ImageFormat::Lime, &ImageOptions::default()).unwrap();

        assert_eq!(image.size(), 0x4000);
        assert_eq!(image.read(0xffe, 2).unwrap(), vec![0xAA, 0xAA]);
        assert_eq!(image.read(0x3000, 1).unwrap(), vec![0xBB]);
        assert!(matches!(
            image.read(0x1000, 1),
            Err(Error::AbsentPage { page: 0x1000 })
        ));
        assert_eq!(image.page_counts(), (2, 2));
    }

    #[test]
    fn test_page_size_must_be_power_of_two() {
        let options = ImageOptions {
            page_size: 0x1800,
            ..ImageOptions::default()
        };
        assert!(MemoryImage::from_bytes(vec![0; 16], ImageFormat::Raw, &options).is_err());
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("LiME".parse::<ImageFormat>().unwrap(), ImageFormat::Lime);
        assert_eq!("raw".parse::<ImageFormat>().unwrap(), ImageFormat::Raw);
        assert!("mdmp".parse::<ImageFormat>().is_err());
    }
}
