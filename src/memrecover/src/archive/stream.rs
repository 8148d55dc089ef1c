//! Stitching segments into logical byte streams
//!
//! Segments of the same backing file are laid out by file offset; anonymous
//! segments by virtual address. Pieces that touch, or sit within the stitch
//! gap of each other, join one stream. The bytes between them are absent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::extract::{PresenceVector, Segment, ABSENT_FILL};

/// Where a run of stream bytes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub vma: usize,
    pub stream_offset: u64,
    pub len: u64,
    /// Virtual address of the piece's first byte
    pub virt_start: u64,
    pub file_offset: Option<u64>,
}

impl Piece {
    pub fn stream_end(&self) -> u64 {
        self.stream_offset + self.len
    }
}

/// Stitched bytes of one logical file
#[derive(Debug, Clone)]
pub struct Stream {
    /// Backing file path, None for anonymous memory
    pub source: Option<String>,
    /// File offset (virtual address for anonymous memory) of byte 0
    pub base: u64,
    pub bytes: Vec<u8>,
    pub presence: PresenceVector,
    pub pieces: Vec<Piece>,
}

/// Serializable description of a stream, without its bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub source: Option<String>,
    pub base: u64,
    pub len: u64,
    pub missing: u64,
    pub pieces: Vec<Piece>,
}

/// Stitch position of a segment
fn position(segment: &Segment) -> u64 {
    segment.file_offset.unwrap_or(segment.start)
}

impl Stream {
    fn new(source: Option<String>, base: u64) -> Self {
        Self {
            source,
            base,
            bytes: Vec::new(),
            presence: PresenceVector::new(),
            pieces: Vec::new(),
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn end(&self) -> u64 {
        self.base + self.len()
    }

    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            source: self.source.clone(),
            base: self.base,
            len: self.len(),
            missing: self.presence.missing_bytes(),
            pieces: self.pieces.clone(),
        }
    }

    /// Add a segment starting at stream position `pos` (never before `base`)
    fn append(&mut self, segment: &Segment, pos: u64) {
        let end = self.end();
        if pos > end {
            let hole = pos - end;
            self.presence.mark_absent(self.len(), hole);
            self.bytes.resize(self.bytes.len() + hole as usize, ABSENT_FILL);
        }

        let at = pos - self.base;
        let overlap = (self.len() - at).min(segment.len());
        if overlap > 0 {
            self.fill_from(segment, at, overlap);
        }
        if segment.len() > overlap {
            self.bytes
                .extend_from_slice(&segment.payload[overlap as usize..]);
            self.presence
                .extend_at(at + overlap, &segment.presence.slice(overlap, segment.len()));
        }

        self.pieces.push(Piece {
            vma: segment.vma,
            stream_offset: at,
            len: segment.len(),
            virt_start: segment.start,
            file_offset: segment.file_offset,
        });
    }

    /// Fill absent stream bytes in `[at, at + overlap)` with bytes the
    /// segment does have
    fn fill_from(&mut self, segment: &Segment, at: u64, overlap: u64) {
        let holes = self.presence.slice(at, at + overlap);
        let mut present: Vec<(u64, u64)> = Vec::new();

        for hole in holes.gaps() {
            let mut cursor = hole.offset;
            for gap in segment.presence.slice(hole.offset, hole.end()).gaps() {
                let gap_start = hole.offset + gap.offset;
                if gap_start > cursor {
                    present.push((cursor, gap_start));
                }
                cursor = hole.offset + gap.end();
            }
            if cursor < hole.end() {
                present.push((cursor, hole.end()));
            }
        }

        for (start, end) in present {
            let dst = (at + start) as usize..(at + end) as usize;
            self.bytes[dst].copy_from_slice(&segment.payload[start as usize..end as usize]);
            self.presence.mark_present(at + start, end - start);
        }
    }
}

/// Group and stitch segments into streams.
///
/// Streams come out grouped by source (anonymous first, then paths in
/// lexical order), each group ordered by position.
pub fn stitch(segments: &[Segment], max_gap: u64) -> (Vec<Stream>, Vec<String>) {
    let mut groups: BTreeMap<Option<&str>, Vec<&Segment>> = BTreeMap::new();
    for segment in segments.iter().filter(|s| !s.is_empty()) {
        groups
            .entry(segment.backing.file_path())
            .or_default()
            .push(segment);
    }

    let mut streams = Vec::new();
    let mut diagnostics = Vec::new();

    for (source, mut group) in groups {
        group.sort_by_key(|s| (position(s), s.vma, s.start));
        let name = source.unwrap_or("[anon]");
        let mut current: Option<Stream> = None;

        for segment in group {
            let pos = position(segment);
            let joins = current
                .as_ref()
                .is_some_and(|s| pos <= s.end().saturating_add(max_gap));

            if joins {
                if let Some(stream) = current.as_mut() {
                    stream.append(segment, pos);
                }
                continue;
            }

            if let Some(done) = current.take() {
                diagnostics.push(format!(
                    "{}: {:#x} bytes missing between {:#x} and {:#x}; starting a new stream",
                    name,
                    pos - done.end(),
                    done.end(),
                    pos
                ));
                streams.push(done);
            }

            let mut stream = Stream::new(source.map(str::to_string), pos);
            stream.append(segment, pos);
            current = Some(stream);
        }

        streams.extend(current);
    }

    tracing::debug!(
        streams = streams.len(),
        bytes = streams.iter().map(Stream::len).sum::<u64>(),
        "stitched segments"
    );

    (streams, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vma::Backing;

    fn file_segment(vma: usize, start: u64, offset: u64, payload: Vec<u8>) -> Segment {
        Segment {
            vma,
            start,
            payload,
            presence: PresenceVector::new(),
            backing: Backing::File {
                path: "/m.pt".into(),
                offset: 0,
            },
            file_offset: Some(offset),
            diagnostics: Vec::new(),
        }
    }

    #[test]
    fn test_orders_by_file_offset_not_address() {
        let high = file_segment(0, 0x1000, 0x10, vec![2; 0x10]);
        let low = file_segment(1, 0x9000, 0x00, vec![1; 0x10]);
        let (streams, diagnostics) = stitch(&[high, low], 0);

        assert_eq!(streams.len(), 1);
        assert!(diagnostics.is_empty());
        let stream = &streams[0];
        assert_eq!(stream.base, 0);
        assert_eq!(&stream.bytes[..0x10], &[1; 0x10]);
        assert_eq!(&stream.bytes[0x10..], &[2; 0x10]);
        assert_eq!(stream.pieces[0].vma, 1);
        assert!(stream.presence.is_complete());
    }

    #[test]
    fn test_small_gap_becomes_absent() {
        let a = file_segment(0, 0x1000, 0x00, vec![1; 0x10]);
        let b = file_segment(1, 0x2000, 0x18, vec![2; 0x8]);
        let (streams, _) = stitch(&[a, b], 0x10);

        let stream = &streams[0];
        assert_eq!(stream.len(), 0x20);
        assert_eq!(stream.presence.missing_bytes(), 0x8);
        assert!(stream.presence.is_absent(0x10));
        assert!(stream.bytes[0x10..0x18].iter().all(|&b| b == ABSENT_FILL));
    }

    #[test]
    fn test_large_gap_starts_new_stream() {
        let a = file_segment(0, 0x1000, 0x00, vec![1; 0x10]);
        let b = file_segment(1, 0x2000, 0x1000, vec![2; 0x10]);
        let (streams, diagnostics) = stitch(&[a, b], 0x10);
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[1].base, 0x1000);
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn test_overlap_fills_absent_bytes() {
        let mut a = file_segment(0, 0x1000, 0x00, vec![1; 0x20]);
        a.payload[0x10..].fill(ABSENT_FILL);
        a.presence.mark_absent(0x10, 0x10);
        let b = file_segment(1, 0x5000, 0x10, vec![2; 0x20]);

        let (streams, _) = stitch(&[a, b], 0);
        let stream = &streams[0];
        assert_eq!(stream.len(), 0x30);
        assert!(stream.presence.is_complete());
        assert_eq!(&stream.bytes[0x10..0x30], &[2; 0x20]);
    }

    #[test]
    fn test_anonymous_segments_group_by_address() {
        let anon = |vma, start: u64| Segment {
            vma,
            start,
            payload: vec![0; 0x10],
            presence: PresenceVector::new(),
            backing: Backing::Anonymous { label: None },
            file_offset: None,
            diagnostics: Vec::new(),
        };
        let (streams, _) = stitch(&[anon(0, 0x2010), anon(1, 0x2000)], 0);
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].base, 0x2000);
        assert_eq!(streams[0].source, None);
    }
}
