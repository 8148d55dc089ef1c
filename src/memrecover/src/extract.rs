//! Segment Extractor
//!
//! Copies a virtual range of one VMA out of the image. Extraction is
//! best-effort: bytes that cannot be read (page not captured, or no resident
//! translation) are filled with [`ABSENT_FILL`] and recorded in the segment's
//! [`PresenceVector`]. Only a read past the end of the image fails.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::image::PhysicalMemory;
use crate::translate::{AddressSpace, Translation};
use crate::vma::{Backing, VmaEntry};
use crate::{Error, Result};

/// Byte written in place of data that was not captured
pub const ABSENT_FILL: u8 = 0xCC;

/// A missing sub-range, relative to the start of its buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub offset: u64,
    pub len: u64,
}

impl Gap {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Sorted, merged list of absent sub-ranges of a buffer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceVector {
    gaps: Vec<Gap>,
}

impl PresenceVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `len` absent bytes at `offset`
    pub fn mark_absent(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = offset;
        let mut end = offset + len;

        // Absorb every gap that touches the new one
        let first = self.gaps.partition_point(|g| g.end() < start);
        let mut last = first;
        while last < self.gaps.len() && self.gaps[last].offset <= end {
            start = start.min(self.gaps[last].offset);
            end = end.max(self.gaps[last].end());
            last += 1;
        }
        self.gaps.splice(
            first..last,
            [Gap {
                offset: start,
                len: end - start,
            }],
        );
    }

    /// Clear `[offset, offset + len)`, splitting gaps that straddle it
    pub fn mark_present(&mut self, offset: u64, len: u64) {
        let end = offset + len;
        let mut kept = Vec::with_capacity(self.gaps.len() + 1);
        for gap in &self.gaps {
            if gap.end() <= offset || gap.offset >= end {
                kept.push(*gap);
                continue;
            }
            if gap.offset < offset {
                kept.push(Gap {
                    offset: gap.offset,
                    len: offset - gap.offset,
                });
            }
            if gap.end() > end {
                kept.push(Gap {
                    offset: end,
                    len: gap.end() - end,
                });
            }
        }
        self.gaps = kept;
    }

    pub fn gaps(&self) -> &[Gap] {
        &self.gaps
    }

    /// Total absent bytes
    pub fn missing_bytes(&self) -> u64 {
        self.gaps.iter().map(|g| g.len).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }

    pub fn is_absent(&self, offset: u64) -> bool {
        let idx = self.gaps.partition_point(|g| g.end() <= offset);
        self.gaps.get(idx).is_some_and(|g| g.offset <= offset)
    }

    /// True when every byte of `[start, end)` is present
    pub fn is_range_present(&self, start: u64, end: u64) -> bool {
        let idx = self.gaps.partition_point(|g| g.end() <= start);
        !self.gaps.get(idx).is_some_and(|g| g.offset < end)
    }

    /// The gaps intersecting `[start, end)`, rebased to `start`
    pub fn slice(&self, start: u64, end: u64) -> PresenceVector {
        let gaps = self
            .gaps
            .iter()
            .filter(|g| g.offset < end && g.end() > start)
            .map(|g| {
                let s = g.offset.max(start);
                let e = g.end().min(end);
                Gap {
                    offset: s - start,
                    len: e - s,
                }
            })
            .collect();
        PresenceVector { gaps }
    }

    /// Append `other`, whose offsets are relative to `at`
    pub fn extend_at(&mut self, at: u64, other: &PresenceVector) {
        for gap in &other.gaps {
            self.mark_absent(at + gap.offset, gap.len);
        }
    }
}

/// Bytes extracted from one VMA
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    /// Id of the source VMA in its index
    pub vma: usize,
    /// Virtual address of the first byte
    pub start: u64,
    #[serde(skip_serializing)]
    pub payload: Vec<u8>,
    pub presence: PresenceVector,
    pub backing: Backing,
    /// Backing-file offset of the first byte (file-backed areas only)
    pub file_offset: Option<u64>,
    pub diagnostics: Vec<String>,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn end(&self) -> u64 {
        self.start + self.len()
    }

    pub fn is_complete(&self) -> bool {
        self.presence.is_complete()
    }
}

/// One unit of extraction work
#[derive(Debug, Clone, Copy)]
pub struct ExtractRequest<'a> {
    pub vma: &'a VmaEntry,
    pub start: u64,
    pub end: u64,
}

impl<'a> ExtractRequest<'a> {
    /// The whole area
    pub fn whole(vma: &'a VmaEntry) -> Self {
        Self {
            vma,
            start: vma.start,
            end: vma.end,
        }
    }
}

/// Extract `[range_start, range_end)` of `vma`, clamped to the area.
pub fn extract(
    memory: &dyn PhysicalMemory,
    space: &AddressSpace,
    vma: &VmaEntry,
    range_start: u64,
    range_end: u64,
) -> Result<Segment> {
    let start = range_start.max(vma.start);
    let end = range_end.min(vma.end).max(start);
    let mut diagnostics = Vec::new();

    if start != range_start || end != range_end {
        diagnostics.push(format!(
            "requested {:#x}-{:#x} clamped to {:#x}-{:#x} (VMA {})",
            range_start, range_end, start, end, vma.id
        ));
    }

    let page_size = memory.page_size();
    let mut payload: Vec<u8> = Vec::new();
    usize::try_from(end - start)
        .ok()
        .and_then(|len| payload.try_reserve_exact(len).ok())
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "cannot hold {:#x} bytes of VMA {} ({:#x}-{:#x}) in memory",
                end - start,
                vma.id,
                start,
                end
            ))
        })?;
    let mut presence = PresenceVector::new();
    let mut cursor = start;

    while cursor < end {
        let remaining = end - cursor;

        let chunk = match space.translate(memory, cursor)? {
            Translation::Mapped { physical, run } => {
                let page_left = page_size - physical % page_size;
                let chunk = run.min(page_left).min(remaining);
                match memory.read(physical, chunk as usize) {
                    Ok(bytes) => payload.extend_from_slice(&bytes),
                    Err(e) if e.is_absent() => {
                        payload.resize(payload.len() + chunk as usize, ABSENT_FILL);
                        presence.mark_absent(cursor - start, chunk);
                    }
                    Err(e) => return Err(e),
                }
                chunk
            }
            Translation::NotResident { run } => {
                let chunk = run.min(remaining);
                payload.resize(payload.len() + chunk as usize, ABSENT_FILL);
                presence.mark_absent(cursor - start, chunk);
                chunk
            }
        };

        cursor += chunk;
    }

    if !presence.is_complete() {
        tracing::debug!(
            vma = vma.id,
            start = format_args!("{:#x}", start),
            missing = presence.missing_bytes(),
            "segment has absent bytes"
        );
    }

    Ok(Segment {
        vma: vma.id,
        start,
        payload,
        presence,
        backing: vma.backing.clone(),
        file_offset: vma.file_offset_of(start),
        diagnostics,
    })
}

/// Extract independent ranges in parallel; results keep the request order
pub fn extract_many(
    memory: &dyn PhysicalMemory,
    space: &AddressSpace,
    requests: &[ExtractRequest<'_>],
) -> Result<Vec<Segment>> {
    let segments: Vec<Segment> = requests
        .par_iter()
        .map(|r| extract(memory, space, r.vma, r.start, r.end))
        .collect::<Result<_>>()?;

    tracing::info!(
        segments = segments.len(),
        bytes = segments.iter().map(Segment::len).sum::<u64>(),
        missing = segments.iter().map(|s| s.presence.missing_bytes()).sum::<u64>(),
        "extracted segments"
    );

    Ok(segments)
}
