//! VMA Index
//!
//! The virtual memory areas of one process, sorted by start address:
//! - walked out of the kernel's own bookkeeping ([`VmaIndex::build`])
//! - parsed from a `/proc/<pid>/maps` capture ([`VmaIndex::from_proc_maps`])
//! - supplied directly by a caller ([`VmaIndex::from_entries`])

mod maps;
mod walk;

pub use maps::{parse_maps, MapsFile};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::image::PhysicalMemory;
use crate::process::ProcessContext;
use crate::profile::KernelProfile;
use crate::{Error, Result};

/// Access permissions of an area
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u8);

impl Permissions {
    pub const READ: u8 = 0x1;
    pub const WRITE: u8 = 0x2;
    pub const EXEC: u8 = 0x4;
    pub const SHARED: u8 = 0x8;

    pub fn new(bits: u8) -> Self {
        Self(bits & 0xf)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_readable(&self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn is_executable(&self) -> bool {
        self.0 & Self::EXEC != 0
    }

    pub fn is_shared(&self) -> bool {
        self.0 & Self::SHARED != 0
    }
}

/// Renders in `/proc/<pid>/maps` style, e.g. `r-xp`
impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            flag(self.is_readable(), 'r'),
            flag(self.is_writable(), 'w'),
            flag(self.is_executable(), 'x'),
            if self.is_shared() { 's' } else { 'p' }
        )
    }
}

impl FromStr for Permissions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let chars: Vec<char> = s.chars().collect();
        if chars.len() != 4 {
            return Err(Error::InvalidInput(format!("bad permission string '{}'", s)));
        }

        let mut bits = 0;
        for (c, expected, bit) in [
            (chars[0], 'r', Self::READ),
            (chars[1], 'w', Self::WRITE),
            (chars[2], 'x', Self::EXEC),
        ] {
            match c {
                '-' => {}
                c if c == expected => bits |= bit,
                _ => return Err(Error::InvalidInput(format!("bad permission string '{}'", s))),
            }
        }
        match chars[3] {
            's' => bits |= Self::SHARED,
            'p' => {}
            _ => return Err(Error::InvalidInput(format!("bad permission string '{}'", s))),
        }

        Ok(Self(bits))
    }
}

/// Where an area's pages originate
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backing {
    /// Not file-backed; `label` carries pseudo-names such as `[heap]`
    Anonymous { label: Option<String> },
    /// Mapped from `path` starting at byte `offset` of the file
    File { path: String, offset: u64 },
}

impl Backing {
    pub fn file_path(&self) -> Option<&str> {
        match self {
            Backing::File { path, .. } => Some(path),
            Backing::Anonymous { .. } => None,
        }
    }
}

impl fmt::Display for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Anonymous { label: Some(label) } => write!(f, "{}", label),
            Backing::Anonymous { label: None } => write!(f, "[anon]"),
            Backing::File { path, offset } => write!(f, "{} @ {:#x}", path, offset),
        }
    }
}

/// One contiguous virtual range of the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmaEntry {
    /// Position in the sorted index
    pub id: usize,
    pub start: u64,
    /// Exclusive
    pub end: u64,
    pub perms: Permissions,
    pub backing: Backing,
}

impl VmaEntry {
    /// Create an entry; the id is assigned when it joins an index
    pub fn new(start: u64, end: u64, perms: Permissions, backing: Backing) -> Self {
        Self {
            id: 0,
            start,
            end,
            perms,
            backing,
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    pub fn overlaps(&self, other: &VmaEntry) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Offset into the backing file of a virtual address inside this area
    pub fn file_offset_of(&self, address: u64) -> Option<u64> {
        match &self.backing {
            Backing::File { offset, .. } if self.contains(address) => {
                Some(offset + (address - self.start))
            }
            _ => None,
        }
    }
}

/// Sorted areas of one process, plus what the scan had to say about them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmaIndex {
    entries: Vec<VmaEntry>,
    pub diagnostics: Vec<String>,
    /// Overlapping entries are present
    pub degraded: bool,
}

impl VmaIndex {
    /// Walk the process's areas out of kernel memory.
    ///
    /// Malformed and overlapping areas are dropped and recorded; only a missing
    /// `mm_struct` anchor fails the build.
    pub fn build(
        memory: &dyn PhysicalMemory,
        process: &ProcessContext,
        profile: &KernelProfile,
    ) -> Result<Self> {
        let mm = process.mm.ok_or_else(|| {
            Error::ProcessNotFound(format!("pid {} has no mm_struct handle", process.pid))
        })?;

        let (mut areas, mut diagnostics) = walk::walk_areas(memory, profile, mm);
        areas.sort_by_key(|a| (a.start, a.end));

        let mut entries: Vec<VmaEntry> = Vec::with_capacity(areas.len());
        for area in areas {
            if let Some(prev) = entries.last() {
                if area.start < prev.end {
                    tracing::warn!(
                        start = format_args!("{:#x}", area.start),
                        "dropping overlapping area"
                    );
                    diagnostics.push(format!(
                        "dropped area {:#x}-{:#x}: overlaps {:#x}-{:#x}",
                        area.start, area.end, prev.start, prev.end
                    ));
                    continue;
                }
            }
            entries.push(area);
        }

        let mut index = Self {
            entries,
            diagnostics,
            degraded: false,
        };
        index.assign_ids();

        tracing::info!(
            pid = process.pid,
            areas = index.entries.len(),
            diagnostics = index.diagnostics.len(),
            "built VMA index"
        );

        Ok(index)
    }

    /// Index caller-supplied areas.
    ///
    /// Empty or inverted ranges are dropped. Overlaps are kept, flagged as
    /// degraded, and left to the correlator's tie-break.
    pub fn from_entries(entries: Vec<VmaEntry>) -> Self {
        let mut diagnostics = Vec::new();
        let mut kept: Vec<VmaEntry> = entries
            .into_iter()
            .filter(|e| {
                let ok = e.start < e.end;
                if !ok {
                    diagnostics.push(format!("dropped empty area {:#x}-{:#x}", e.start, e.end));
                }
                ok
            })
            .collect();
        kept.sort_by_key(|e| (e.start, e.end));

        let mut degraded = false;
        let mut max_end = 0u64;
        let mut max_end_at = 0usize;
        for (i, entry) in kept.iter().enumerate() {
            if i > 0 && entry.start < max_end {
                degraded = true;
                diagnostics.push(format!(
                    "area {:#x}-{:#x} overlaps {:#x}-{:#x}",
                    entry.start, entry.end, kept[max_end_at].start, kept[max_end_at].end
                ));
            }
            if entry.end > max_end {
                max_end = entry.end;
                max_end_at = i;
            }
        }

        let mut index = Self {
            entries: kept,
            diagnostics,
            degraded,
        };
        index.assign_ids();
        index
    }

    /// Index a `/proc/<pid>/maps` capture
    pub fn from_proc_maps(text: &str) -> Result<Self> {
        Ok(Self::from_entries(parse_maps(text)?.vmas))
    }

    fn assign_ids(&mut self) {
        for (id, entry) in self.entries.iter_mut().enumerate() {
            entry.id = id;
        }
    }

    pub fn entries(&self) -> &[VmaEntry] {
        &self.entries
    }

    pub fn get(&self, id: usize) -> Option<&VmaEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All areas mapped from the same backing file
    pub fn backed_by<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a VmaEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.backing.file_path() == Some(path))
    }
}
