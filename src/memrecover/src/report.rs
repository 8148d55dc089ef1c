//! Recovery Report
//!
//! Pure aggregation over the results of correlation, extraction and
//! reconstruction. Nothing here reads the image.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::archive::{ArchiveEntry, ArchiveOutcome, Completeness, Provenance, ReconstructedArchive};
use crate::correlate::{CorrelationResult, VmaMatch};
use crate::extract::{Gap, Segment};
use crate::vma::Backing;

/// Semantic tag -> archive entry name
///
/// A tag with no mapping falls back to an entry of the same name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagMap(BTreeMap<String, String>);

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: impl Into<String>, entry: impl Into<String>) {
        self.0.insert(tag.into(), entry.into());
    }

    pub fn entry_for<'a>(&'a self, tag: &'a str) -> &'a str {
        self.0.get(tag).map(String::as_str).unwrap_or(tag)
    }

    /// Whether `tag` has an explicit mapping
    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressFinding {
    pub address: u64,
    pub tag: String,
    pub expected_len: Option<u64>,
    pub mapped: bool,
    /// Primary VMA first, then continuations
    pub vmas: Vec<VmaMatch>,
    /// Backing of the primary VMA, when it was extracted
    pub backing: Option<Backing>,
    /// Archive entry the tag refers to, when it exists
    pub entry: Option<String>,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ChecksumStatus {
    NotProvided,
    Match,
    Mismatch { expected: String, actual: String },
    /// A digest was expected but the payload is incomplete
    Unverifiable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryFinding {
    pub name: String,
    pub found: bool,
    pub state: String,
    pub completeness_percent: f64,
    pub expected_len: u64,
    pub recovered_len: u64,
    pub missing_bytes: u64,
    pub gaps: Vec<Gap>,
    pub contributors: Vec<Provenance>,
    pub checksum: ChecksumStatus,
    pub malformed: Option<String>,
}

/// Something the investigator should look at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Mismatch {
    /// A tagged address refers to an entry that is partial or missing
    RoleEntryIncomplete {
        address: u64,
        tag: String,
        entry: String,
        state: String,
    },
    /// A tag refers to an entry the container does not describe
    UnknownEntry {
        address: u64,
        tag: String,
        entry: String,
    },
    LengthMismatch {
        address: u64,
        entry: String,
        expected: u64,
        recovered: u64,
    },
    ChecksumMismatch {
        entry: String,
        expected: String,
        actual: String,
    },
    /// The address is mapped, but not inside the bytes the entry came from
    LocationMismatch {
        address: u64,
        entry: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub outcome: ArchiveOutcome,
    pub addresses: Vec<AddressFinding>,
    pub entries: Vec<EntryFinding>,
    pub mismatches: Vec<Mismatch>,
    pub diagnostics: Vec<String>,
}

impl RecoveryReport {
    pub fn entry(&self, name: &str) -> Option<&EntryFinding> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn unmapped(&self) -> impl Iterator<Item = &AddressFinding> {
        self.addresses.iter().filter(|a| !a.mapped)
    }
}

fn checksum_status(entry: &ArchiveEntry) -> ChecksumStatus {
    match (&entry.expected_sha256, &entry.sha256) {
        (None, _) => ChecksumStatus::NotProvided,
        (Some(_), None) => ChecksumStatus::Unverifiable,
        (Some(expected), Some(actual)) if expected.eq_ignore_ascii_case(actual) => {
            ChecksumStatus::Match
        }
        (Some(expected), Some(actual)) => ChecksumStatus::Mismatch {
            expected: expected.clone(),
            actual: actual.clone(),
        },
    }
}

fn entry_finding(entry: &ArchiveEntry) -> EntryFinding {
    let gaps = match &entry.completeness {
        Completeness::Partial { gaps } => gaps.clone(),
        Completeness::Missing if entry.expected_len > 0 => vec![Gap {
            offset: 0,
            len: entry.expected_len,
        }],
        _ => Vec::new(),
    };

    EntryFinding {
        name: entry.name.clone(),
        found: entry.is_found(),
        state: entry.completeness.label().to_string(),
        completeness_percent: entry.completeness_percent(),
        expected_len: entry.expected_len,
        recovered_len: entry.payload.len() as u64,
        missing_bytes: entry.missing_bytes(),
        gaps,
        contributors: entry.provenance.clone(),
        checksum: checksum_status(entry),
        malformed: entry.malformed.clone(),
    }
}

/// Cross-reference correlations, segments and the archive.
///
/// Output order follows the inputs, so equal inputs give equal reports.
pub fn summarize(
    correlations: &[CorrelationResult],
    segments: &[Segment],
    archive: &ReconstructedArchive,
    tags: &TagMap,
) -> RecoveryReport {
    let entries: Vec<EntryFinding> = archive.entries.iter().map(entry_finding).collect();
    let mut mismatches = Vec::new();
    let mut diagnostics = Vec::new();

    for entry in &archive.entries {
        if let ChecksumStatus::Mismatch { expected, actual } = checksum_status(entry) {
            mismatches.push(Mismatch::ChecksumMismatch {
                entry: entry.name.clone(),
                expected,
                actual,
            });
        }
    }

    let mut addresses = Vec::with_capacity(correlations.len());
    for result in correlations {
        let gt = &result.address;
        let name = tags.entry_for(&gt.tag);
        let entry = archive.entry(name);

        let backing = result.primary_vma().and_then(|id| {
            segments
                .iter()
                .find(|s| s.vma == id)
                .map(|s| s.backing.clone())
        });

        diagnostics.extend(
            result
                .diagnostics
                .iter()
                .map(|d| format!("correlate {:#x}: {}", gt.address, d)),
        );

        match entry {
            None => {
                if tags.contains(&gt.tag) {
                    mismatches.push(Mismatch::UnknownEntry {
                        address: gt.address,
                        tag: gt.tag.clone(),
                        entry: name.to_string(),
                    });
                }
            }
            Some(entry) => {
                if entry.completeness != Completeness::Complete {
                    mismatches.push(Mismatch::RoleEntryIncomplete {
                        address: gt.address,
                        tag: gt.tag.clone(),
                        entry: entry.name.clone(),
                        state: entry.completeness.label().to_string(),
                    });
                }

                if let Some(expected) = gt.expected_len {
                    let recovered = entry.payload.len() as u64;
                    if entry.is_found() && expected != recovered {
                        mismatches.push(Mismatch::LengthMismatch {
                            address: gt.address,
                            entry: entry.name.clone(),
                            expected,
                            recovered,
                        });
                    }
                }

                let inside = entry.provenance.iter().any(|p| p.contains(gt.address));
                if result.is_mapped() && entry.is_found() && !inside {
                    mismatches.push(Mismatch::LocationMismatch {
                        address: gt.address,
                        entry: entry.name.clone(),
                    });
                }
            }
        }

        addresses.push(AddressFinding {
            address: gt.address,
            tag: gt.tag.clone(),
            expected_len: gt.expected_len,
            mapped: result.is_mapped(),
            vmas: result.matches(),
            backing,
            entry: entry.map(|e| e.name.clone()),
            diagnostics: result.diagnostics.clone(),
        });
    }

    for segment in segments {
        diagnostics.extend(
            segment
                .diagnostics
                .iter()
                .map(|d| format!("extract VMA {}: {}", segment.vma, d)),
        );
    }
    diagnostics.extend(archive.diagnostics.iter().map(|d| format!("archive: {}", d)));

    tracing::info!(
        addresses = addresses.len(),
        entries = entries.len(),
        mismatches = mismatches.len(),
        "summarized recovery"
    );

    RecoveryReport {
        outcome: archive.outcome,
        addresses,
        entries,
        mismatches,
        diagnostics,
    }
}
