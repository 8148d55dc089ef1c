//! Archive Reconstructor
//!
//! Turns extracted segments back into the named entries of a serialized
//! model archive. The container layout is data ([`ContainerSpec`]); this is
//! the only module that knows about it.
//!
//! Incomplete entries are never dropped. Every entry comes back with its
//! available bytes, a [`Completeness`] and, when its structure did not add
//! up, a per-entry malformation note.

mod container;
mod scan;
mod stream;

pub use container::{
    ContainerSpec, Endian, EntrySpec, LengthRule, Marker, MarkerPattern, DEFAULT_STITCH_GAP,
};
pub use stream::{stitch, Piece, Stream, StreamSummary};

use byteorder::{ByteOrder, BE, LE};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::extract::{Gap, PresenceVector, Segment};
use crate::{Error, Result};

/// How much of an entry was recovered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Completeness {
    Complete,
    /// Some bytes missing; gaps are relative to the payload start and may
    /// extend past the available bytes
    Partial { gaps: Vec<Gap> },
    Missing,
}

impl Completeness {
    fn from_gaps(expected_len: u64, gaps: PresenceVector) -> Self {
        if gaps.is_complete() {
            Completeness::Complete
        } else if gaps.missing_bytes() >= expected_len {
            Completeness::Missing
        } else {
            Completeness::Partial {
                gaps: gaps.gaps().to_vec(),
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Completeness::Complete => "complete",
            Completeness::Partial { .. } => "partial",
            Completeness::Missing => "missing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveOutcome {
    /// Every entry complete and well-formed
    Recovered,
    Partial,
    /// No marker of any entry was found
    Unrecoverable,
}

/// Contributing bytes of one VMA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub vma: usize,
    pub virt_start: u64,
    /// Exclusive
    pub virt_end: u64,
    pub file_offset: Option<u64>,
}

impl Provenance {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.virt_start && address < self.virt_end
    }
}

/// Where an entry was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryLocation {
    /// Index into [`ReconstructedArchive::streams`]
    pub stream: usize,
    pub marker_offset: u64,
    pub payload_offset: u64,
    /// File offset (virtual address for anonymous memory) of the marker
    pub position: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub name: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub length: LengthRule,
    pub location: Option<EntryLocation>,
    /// Marker and length field, as captured
    #[serde(skip)]
    pub header: Vec<u8>,
    /// Available bytes; absent ones hold the sentinel
    #[serde(skip)]
    pub payload: Vec<u8>,
    /// Payload length the container called for
    pub expected_len: u64,
    pub completeness: Completeness,
    pub malformed: Option<String>,
    pub provenance: Vec<Provenance>,
    /// Digest of a complete payload
    pub sha256: Option<String>,
    pub expected_sha256: Option<String>,
}

impl ArchiveEntry {
    fn missing(spec: &EntrySpec) -> Self {
        let expected_len = match spec.length {
            LengthRule::Declared(n) => n,
            _ => 0,
        };
        Self {
            name: spec.name.clone(),
            length: spec.length,
            location: None,
            header: Vec::new(),
            payload: Vec::new(),
            expected_len,
            completeness: Completeness::Missing,
            malformed: None,
            provenance: Vec::new(),
            sha256: None,
            expected_sha256: spec.sha256.clone(),
        }
    }

    pub fn is_found(&self) -> bool {
        self.location.is_some()
    }

    pub fn missing_bytes(&self) -> u64 {
        match &self.completeness {
            Completeness::Complete => 0,
            Completeness::Partial { gaps } => gaps.iter().map(|g| g.len).sum(),
            Completeness::Missing => self.expected_len,
        }
    }

    pub fn present_bytes(&self) -> u64 {
        self.expected_len.saturating_sub(self.missing_bytes())
    }

    /// Present / expected bytes, in percent, truncated to two decimals so a
    /// partial entry never reads as 100
    pub fn completeness_percent(&self) -> f64 {
        match (&self.completeness, self.expected_len) {
            (Completeness::Missing, _) => 0.0,
            (_, 0) => 100.0,
            (_, expected) => {
                let basis_points = u128::from(self.present_bytes()) * 10_000 / u128::from(expected);
                basis_points as f64 / 100.0
            }
        }
    }

    /// Stable file name for the entry's payload
    pub fn file_name(&self, index: usize) -> String {
        let safe: String = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        format!("{:02}_{}.bin", index, safe)
    }
}

/// The recovered archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructedArchive {
    /// In container order
    pub entries: Vec<ArchiveEntry>,
    pub outcome: ArchiveOutcome,
    pub streams: Vec<StreamSummary>,
    pub diagnostics: Vec<String>,
}

#[derive(Serialize)]
struct Manifest<'a> {
    files: Vec<ManifestFile<'a>>,
    archive: &'a ReconstructedArchive,
}

#[derive(Serialize)]
struct ManifestFile<'a> {
    entry: &'a str,
    file: String,
    bytes: usize,
    completeness: &'static str,
}

impl ReconstructedArchive {
    pub fn entry(&self, name: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Found entries re-serialized (header + payload) in stream order
    pub fn to_container_bytes(&self) -> Vec<u8> {
        let mut found: Vec<(&EntryLocation, &ArchiveEntry)> = self
            .entries
            .iter()
            .filter_map(|e| e.location.as_ref().map(|l| (l, e)))
            .collect();
        found.sort_by_key(|(l, _)| (l.stream, l.marker_offset));

        let mut out = Vec::new();
        for (_, entry) in found {
            out.extend_from_slice(&entry.header);
            out.extend_from_slice(&entry.payload);
        }
        out
    }

    /// Write one file per found entry plus `manifest.json`
    pub fn write_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let mut written = Vec::new();
        let mut files = Vec::new();
        for (i, entry) in self.entries.iter().enumerate().filter(|(_, e)| e.is_found()) {
            let name = entry.file_name(i);
            let path = dir.join(&name);
            fs::write(&path, &entry.payload)?;
            files.push(ManifestFile {
                entry: &entry.name,
                file: name,
                bytes: entry.payload.len(),
                completeness: entry.completeness.label(),
            });
            written.push(path);
        }

        let manifest = Manifest {
            files,
            archive: self,
        };
        let path = dir.join("manifest.json");
        fs::write(&path, serde_json::to_vec_pretty(&manifest)?)?;
        written.push(path);

        tracing::info!(dir = %dir.display(), files = written.len(), "wrote archive entries");
        Ok(written)
    }
}

/// Read a length field; Err carries the malformation reason
fn read_prefix(
    stream: &Stream,
    at: u64,
    width: u8,
    endian: Endian,
) -> std::result::Result<u64, String> {
    let end = at + u64::from(width);
    if end > stream.len() {
        return Err(format!("length prefix at {:#x} runs past the end of the stream", at));
    }
    if !stream.presence.is_range_present(at, end) {
        return Err(format!("length prefix at {:#x} lies in an absent page", at));
    }

    let field = &stream.bytes[at as usize..end as usize];
    Ok(match endian {
        Endian::Little => LE::read_uint(field, width as usize),
        Endian::Big => BE::read_uint(field, width as usize),
    })
}

/// First recognised marker at or after `from`
fn next_boundary(boundaries: &[u64], from: u64, stream_len: u64) -> u64 {
    let idx = boundaries.partition_point(|&b| b < from);
    boundaries.get(idx).copied().unwrap_or(stream_len)
}

/// Pieces overlapping `[start, end)` of a stream, as virtual ranges
fn provenance(stream: &Stream, start: u64, end: u64) -> Vec<Provenance> {
    stream
        .pieces
        .iter()
        .filter(|p| p.stream_offset < end && p.stream_end() > start)
        .map(|p| {
            let s = start.max(p.stream_offset);
            let e = end.min(p.stream_end());
            Provenance {
                vma: p.vma,
                virt_start: p.virt_start + (s - p.stream_offset),
                virt_end: p.virt_start + (e - p.stream_offset),
                file_offset: p.file_offset.map(|f| f + (s - p.stream_offset)),
            }
        })
        .collect()
}

/// Marker position and resolved length of one entry
struct Placement {
    stream: usize,
    marker_offset: u64,
    payload_offset: u64,
    /// None: the payload runs to the next marker
    length: Option<u64>,
    problems: Vec<String>,
}

impl Placement {
    /// Stream range owned by the entry; marker hits inside it are payload bytes
    fn claim(&self, stream_len: u64) -> (u64, u64) {
        let end = match self.length {
            Some(n) => self.payload_offset.saturating_add(n).min(stream_len),
            None => self.payload_offset,
        };
        (self.marker_offset, end)
    }
}

/// Claimed `(stream, start, end)` ranges
type Claims = Vec<(usize, u64, u64)>;

fn is_claimed(claims: &[(usize, u64, u64)], stream: usize, offset: u64) -> bool {
    claims
        .iter()
        .any(|&(s, start, end)| s == stream && offset >= start && offset < end)
}

/// Hit for one entry: claimed hits are skipped and the first hit at or after
/// `after` wins; with none there, the earliest unclaimed hit
fn choose_hit(
    hits: &[Vec<u64>],
    claims: &[(usize, u64, u64)],
    after: Option<(usize, u64)>,
) -> Option<(usize, u64)> {
    let candidates: Vec<(usize, u64)> = hits
        .iter()
        .enumerate()
        .flat_map(|(s, offsets)| offsets.iter().map(move |&o| (s, o)))
        .filter(|&(s, o)| !is_claimed(claims, s, o))
        .collect();

    let after = after.unwrap_or((0, 0));
    candidates
        .iter()
        .copied()
        .find(|&c| c >= after)
        .or_else(|| candidates.first().copied())
}

/// Resolve the payload start and length for a marker at `marker_offset`
fn place(
    stream: &Stream,
    s: usize,
    marker_offset: u64,
    spec: &EntrySpec,
    pattern: &MarkerPattern,
) -> Placement {
    let stream_len = stream.len();
    let mut problems = Vec::new();
    let mut payload_offset = marker_offset + pattern.len() as u64;

    let length = match spec.length {
        LengthRule::Declared(n) => Some(n),
        LengthRule::Prefixed { width, endian } => {
            let parsed = read_prefix(stream, payload_offset, width, endian);
            payload_offset = (payload_offset + u64::from(width)).min(stream_len);
            match (parsed, spec.max_len) {
                (Ok(n), Some(max)) if n > max => {
                    problems.push(format!("length prefix {:#x} exceeds max_len {:#x}", n, max));
                    None
                }
                (Ok(n), _) => Some(n),
                (Err(reason), _) => {
                    problems.push(reason);
                    None
                }
            }
        }
        LengthRule::UntilNextMarker => None,
    };

    Placement {
        stream: s,
        marker_offset,
        payload_offset,
        length,
        problems,
    }
}

/// Place every entry. Fixed-length entries go first, in container order;
/// marker hits inside the ranges they claim are payload bytes.
fn place_entries(
    streams: &[Stream],
    container: &ContainerSpec,
    patterns: &[MarkerPattern],
    hits: &[Vec<Vec<u64>>],
) -> (Vec<Option<Placement>>, Claims) {
    let mut placements: Vec<Option<Placement>> = container.entries.iter().map(|_| None).collect();
    let mut claims = Claims::new();

    let mut order: Vec<usize> = (0..container.entries.len()).collect();
    order.sort_by_key(|&i| container.entries[i].length == LengthRule::UntilNextMarker);

    for i in order {
        // Entries follow each other: look past the nearest earlier placed one
        let after = placements[..i].iter().rev().flatten().next().map(|p| {
            let (_, end) = p.claim(streams[p.stream].len());
            (p.stream, end)
        });

        let Some((s, marker_offset)) = choose_hit(&hits[i], &claims, after) else {
            continue;
        };
        let placement = place(&streams[s], s, marker_offset, &container.entries[i], &patterns[i]);
        let (start, end) = placement.claim(streams[s].len());
        claims.push((s, start, end));
        placements[i] = Some(placement);
    }

    (placements, claims)
}

struct EntryContext<'a> {
    streams: &'a [Stream],
    /// Sorted offsets of every marker that can end a payload, per stream
    boundaries: &'a [Vec<u64>],
}

fn cut_entry(
    ctx: &EntryContext<'_>,
    spec: &EntrySpec,
    placement: Option<Placement>,
) -> ArchiveEntry {
    let Some(Placement {
        stream: s,
        marker_offset,
        payload_offset: cursor,
        length,
        mut problems,
    }) = placement
    else {
        tracing::info!(entry = %spec.name, "marker not found");
        return ArchiveEntry::missing(spec);
    };

    let stream = &ctx.streams[s];
    let stream_len = stream.len();

    let (payload_end, expected_len) = match length {
        Some(n) => {
            let wanted_end = cursor.saturating_add(n);
            if wanted_end > stream_len {
                problems.push(format!(
                    "length {:#x} overruns the stream by {:#x} bytes",
                    n,
                    wanted_end - stream_len
                ));
            }
            (wanted_end.min(stream_len), n)
        }
        // Unknown length: run to the next marker, bounded by max_len
        None => {
            let mut end = next_boundary(&ctx.boundaries[s], cursor, stream_len);
            if let Some(max) = spec.max_len {
                if end - cursor > max {
                    if spec.length == LengthRule::UntilNextMarker {
                        problems.push(format!("payload runs past max_len {:#x}", max));
                    }
                    end = cursor + max;
                }
            }
            (end, end - cursor)
        }
    };

    let payload = stream.bytes[cursor as usize..payload_end as usize].to_vec();
    let mut gaps = stream.presence.slice(cursor, payload_end);
    let available = payload_end - cursor;
    if expected_len > available {
        gaps.mark_absent(available, expected_len - available);
    }
    let completeness = Completeness::from_gaps(expected_len, gaps);

    let sha256 =
        (completeness == Completeness::Complete).then(|| hex::encode(Sha256::digest(&payload)));

    let malformed = if problems.is_empty() {
        None
    } else {
        let err = Error::MalformedContainer {
            entry: spec.name.clone(),
            reason: problems.join("; "),
        };
        tracing::warn!(error = %err, "malformed entry");
        Some(err.to_string())
    };

    tracing::debug!(
        entry = %spec.name,
        stream = s,
        offset = format_args!("{:#x}", marker_offset),
        len = payload.len(),
        state = completeness.label(),
        "reconstructed entry"
    );

    ArchiveEntry {
        name: spec.name.clone(),
        length: spec.length,
        location: Some(EntryLocation {
            stream: s,
            marker_offset,
            payload_offset: cursor,
            position: stream.base + marker_offset,
        }),
        header: stream.bytes[marker_offset as usize..cursor as usize].to_vec(),
        payload,
        expected_len,
        completeness,
        malformed,
        provenance: provenance(stream, marker_offset, payload_end),
        sha256,
        expected_sha256: spec.sha256.clone(),
    }
}

/// Reassemble the container's entries from extracted segments.
///
/// Fails only when the container description itself is invalid; missing,
/// partial and malformed entries are reported on the result.
pub fn reconstruct(
    segments: &[Segment],
    container: &ContainerSpec,
) -> Result<ReconstructedArchive> {
    let patterns = container.compile()?;
    let (streams, mut diagnostics) = stitch(segments, container.max_stitch_gap);

    // hits[entry][stream] -> marker offsets
    let hits: Vec<Vec<Vec<u64>>> = patterns
        .par_iter()
        .map(|p| streams.iter().map(|s| scan::find_marker(s, p)).collect())
        .collect();

    let (placements, claims) = place_entries(&streams, container, &patterns, &hits);

    // Placed markers plus look-alikes outside every claimed range
    let boundaries: Vec<Vec<u64>> = (0..streams.len())
        .map(|s| {
            let mut all: Vec<u64> = hits
                .iter()
                .flat_map(|h| h[s].iter().copied())
                .filter(|&o| !is_claimed(&claims, s, o))
                .chain(
                    placements
                        .iter()
                        .flatten()
                        .filter(|p| p.stream == s)
                        .map(|p| p.marker_offset),
                )
                .collect();
            all.sort_unstable();
            all.dedup();
            all
        })
        .collect();

    let ctx = EntryContext {
        streams: &streams,
        boundaries: &boundaries,
    };

    let entries: Vec<ArchiveEntry> = container
        .entries
        .par_iter()
        .zip(placements.into_par_iter())
        .map(|(spec, placement)| cut_entry(&ctx, spec, placement))
        .collect();

    let found = entries.iter().filter(|e| e.is_found()).count();
    let outcome = if found == 0 {
        diagnostics.push(format!(
            "no entry marker found in {} stream(s)",
            streams.len()
        ));
        ArchiveOutcome::Unrecoverable
    } else if entries
        .iter()
        .all(|e| e.completeness == Completeness::Complete && e.malformed.is_none())
    {
        ArchiveOutcome::Recovered
    } else {
        ArchiveOutcome::Partial
    };

    tracing::info!(
        entries = entries.len(),
        found,
        outcome = ?outcome,
        "reconstructed archive"
    );

    Ok(ReconstructedArchive {
        entries,
        outcome,
        streams: streams.iter().map(Stream::summary).collect(),
        diagnostics,
    })
}
