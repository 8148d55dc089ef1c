//! Address Correlator
//!
//! Binds ground-truth addresses from a live debugging session to the VMAs of
//! the captured process. An address outside every VMA is a finding
//! ([`Correlation::Unmapped`]), never an error.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::input::{de_opt_u64, de_u64};
use crate::vma::{VmaEntry, VmaIndex};

/// An address known to be correct from independent observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundTruthAddress {
    #[serde(deserialize_with = "de_u64")]
    pub address: u64,
    /// Semantic role, e.g. "module object" or "weight tensor storage"
    pub tag: String,
    #[serde(
        default,
        deserialize_with = "de_opt_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_len: Option<u64>,
}

impl GroundTruthAddress {
    pub fn new(address: u64, tag: impl Into<String>, expected_len: Option<u64>) -> Self {
        Self {
            address,
            tag: tag.into(),
            expected_len,
        }
    }
}

/// One VMA hosting (part of) a ground-truth range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmaMatch {
    pub vma: usize,
    /// Offset of the first covered byte from the VMA start
    pub offset: u64,
    /// Covered bytes inside this VMA (to the VMA end when no length was given)
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Correlation {
    Mapped {
        primary: VmaMatch,
        /// Adjacent VMAs covering the rest of `expected_len`
        continuation: Vec<VmaMatch>,
    },
    /// No VMA contains the address
    Unmapped,
}

/// Outcome of correlating one ground-truth address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationResult {
    pub address: GroundTruthAddress,
    pub correlation: Correlation,
    /// Other VMAs that also contain the address (degraded indexes only)
    pub conflicts: Vec<usize>,
    pub diagnostics: Vec<String>,
}

impl CorrelationResult {
    pub fn is_mapped(&self) -> bool {
        matches!(self.correlation, Correlation::Mapped { .. })
    }

    /// Every VMA bound to this address, primary first
    pub fn matches(&self) -> Vec<VmaMatch> {
        match &self.correlation {
            Correlation::Mapped {
                primary,
                continuation,
            } => std::iter::once(*primary)
                .chain(continuation.iter().copied())
                .collect(),
            Correlation::Unmapped => Vec::new(),
        }
    }

    pub fn primary_vma(&self) -> Option<usize> {
        match &self.correlation {
            Correlation::Mapped { primary, .. } => Some(primary.vma),
            Correlation::Unmapped => None,
        }
    }
}

/// All entries containing `address`, lowest id first
fn containing<'a>(index: &'a VmaIndex, address: u64) -> Vec<&'a VmaEntry> {
    let entries = index.entries();
    let idx = entries.partition_point(|e| e.start <= address);

    if index.degraded {
        // An earlier, longer entry may reach past later starts
        let mut hits: Vec<&VmaEntry> = entries[..idx]
            .iter()
            .filter(|e| e.contains(address))
            .collect();
        hits.sort_by_key(|e| e.id);
        hits
    } else {
        idx.checked_sub(1)
            .map(|i| &entries[i])
            .filter(|e| e.contains(address))
            .into_iter()
            .collect()
    }
}

/// Correlate one address against the index
pub fn correlate(ground_truth: &GroundTruthAddress, index: &VmaIndex) -> CorrelationResult {
    let address = ground_truth.address;
    let hits = containing(index, address);
    let mut diagnostics = Vec::new();

    let Some(winner) = hits.first().copied() else {
        tracing::info!(
            address = format_args!("{:#x}", address),
            tag = %ground_truth.tag,
            "address is unmapped"
        );
        return CorrelationResult {
            address: ground_truth.clone(),
            correlation: Correlation::Unmapped,
            conflicts: Vec::new(),
            diagnostics,
        };
    };

    let conflicts: Vec<usize> = hits[1..].iter().map(|e| e.id).collect();
    if !conflicts.is_empty() {
        diagnostics.push(format!(
            "{:#x} lies in overlapping VMAs {:?}; using VMA {}",
            address,
            hits.iter().map(|e| e.id).collect::<Vec<_>>(),
            winner.id
        ));
    }

    let wanted_end = ground_truth
        .expected_len
        .map(|len| address.saturating_add(len))
        .unwrap_or(winner.end);

    let primary = VmaMatch {
        vma: winner.id,
        offset: address - winner.start,
        len: wanted_end.min(winner.end) - address,
    };

    // The expected range may run on into adjacent areas of the same mapping
    let mut continuation = Vec::new();
    let mut cursor = winner.end;
    while cursor < wanted_end {
        match containing(index, cursor).first() {
            Some(next) => {
                continuation.push(VmaMatch {
                    vma: next.id,
                    offset: cursor - next.start,
                    len: wanted_end.min(next.end) - cursor,
                });
                cursor = next.end;
            }
            None => {
                diagnostics.push(format!(
                    "expected range {:#x}-{:#x} is not covered by any VMA",
                    cursor, wanted_end
                ));
                break;
            }
        }
    }

    tracing::debug!(
        address = format_args!("{:#x}", address),
        vma = winner.id,
        continuation = continuation.len(),
        "correlated address"
    );

    CorrelationResult {
        address: ground_truth.clone(),
        correlation: Correlation::Mapped {
            primary,
            continuation,
        },
        conflicts,
        diagnostics,
    }
}

/// Correlate many addresses in parallel; results keep the input order
pub fn correlate_all(addresses: &[GroundTruthAddress], index: &VmaIndex) -> Vec<CorrelationResult> {
    addresses
        .par_iter()
        .map(|gt| correlate(gt, index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vma::{Backing, Permissions};

    fn entry(start: u64, end: u64) -> VmaEntry {
        VmaEntry::new(
            start,
            end,
            Permissions::new(Permissions::READ),
            Backing::Anonymous { label: None },
        )
    }

    fn gt(address: u64, len: Option<u64>) -> GroundTruthAddress {
        GroundTruthAddress::new(address, "module object", len)
    }

    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn test_single_match_contains_address() {
        let mut rng = Lcg(7);
        for _ in 0..200 {
            let mut entries = Vec::new();
            let mut cursor = 0x1000;
            for _ in 0..(rng.next() % 12 + 1) {
                cursor += (rng.next() % 4) * 0x1000;
                let len = (rng.next() % 8 + 1) * 0x1000;
                entries.push(entry(cursor, cursor + len));
                cursor += len;
            }
            let index = VmaIndex::from_entries(entries);
            assert!(!index.degraded);

            for _ in 0..20 {
                let address = rng.next() % (cursor + 0x4000);
                let result = correlate(&gt(address, None), &index);
                let hits: Vec<_> = index.entries().iter().filter(|e| e.contains(address)).collect();
                assert!(hits.len() <= 1);
                match result.correlation {
                    Correlation::Mapped { primary, .. } => {
                        let vma = index.get(primary.vma).unwrap();
                        assert!(vma.contains(address));
                        assert_eq!(primary.offset, address - vma.start);
                        assert!(result.conflicts.is_empty());
                    }
                    Correlation::Unmapped => assert!(hits.is_empty()),
                }
            }
        }
    }

    #[test]
    fn test_unmapped_address() {
        let index = VmaIndex::from_entries(vec![entry(0x1000, 0x3000)]);
        let result = correlate(&gt(0x9000, Some(0x10)), &index);
        assert_eq!(result.correlation, Correlation::Unmapped);
        assert!(!result.is_mapped());
        assert!(result.matches().is_empty());
    }

    #[test]
    fn test_overlap_earliest_wins_and_conflict_recorded() {
        let index = VmaIndex::from_entries(vec![entry(0x1000, 0x8000), entry(0x2000, 0x3000)]);
        assert!(index.degraded);

        let result = correlate(&gt(0x2800, None), &index);
        assert_eq!(result.primary_vma(), Some(0));
        assert_eq!(result.conflicts, vec![1]);
        assert_eq!(result.diagnostics.len(), 1);
    }

    #[test]
    fn test_expected_len_spills_into_adjacent_vma() {
        let index = VmaIndex::from_entries(vec![entry(0x1000, 0x2000), entry(0x2000, 0x4000)]);
        let result = correlate(&gt(0x1f00, Some(0x200)), &index);

        let matches = result.matches();
        assert_eq!(
            matches,
            vec![
                VmaMatch {
                    vma: 0,
                    offset: 0xf00,
                    len: 0x100
                },
                VmaMatch {
                    vma: 1,
                    offset: 0,
                    len: 0x100
                },
            ]
        );
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn test_expected_len_past_last_vma_is_recorded() {
        let index = VmaIndex::from_entries(vec![entry(0x1000, 0x2000)]);
        let result = correlate(&gt(0x1f00, Some(0x200)), &index);
        assert_eq!(result.matches().len(), 1);
        assert_eq!(result.diagnostics.len(), 1);
    }

    #[test]
    fn test_correlate_all_keeps_order() {
        let index = VmaIndex::from_entries(vec![entry(0x1000, 0x2000), entry(0x4000, 0x5000)]);
        let inputs = vec![gt(0x4010, None), gt(0x9000, None), gt(0x1010, None)];
        let results = correlate_all(&inputs, &index);
        let primaries: Vec<_> = results.iter().map(|r| r.primary_vma()).collect();
        assert_eq!(primaries, vec![Some(1), None, Some(0)]);
    }
}
