//! End-to-end recovery run
//!
//! locate process -> index VMAs -> correlate -> extract -> reconstruct -> report
//!
//! Correlation and extraction fan out over rayon; all segments are collected
//! before reconstruction starts. An area larger than the segment cap is cut
//! down to a window around the ground-truth ranges it hosts.

use std::collections::BTreeSet;

use crate::archive::{reconstruct, ContainerSpec, ReconstructedArchive};
use crate::correlate::{correlate_all, CorrelationResult, GroundTruthAddress};
use crate::extract::{extract_many, ExtractRequest, Segment};
use crate::image::PhysicalMemory;
use crate::process::{ProcessContext, ProcessSelector};
use crate::profile::KernelProfile;
use crate::report::{summarize, RecoveryReport, TagMap};
use crate::translate::AddressSpace;
use crate::vma::{Backing, MapsFile, VmaEntry, VmaIndex};
use crate::Result;

/// Where the process and its areas come from
#[derive(Debug, Clone)]
pub enum ProcessSource {
    /// Walk the kernel's task list and memory-area bookkeeping
    Kernel {
        profile: KernelProfile,
        selector: ProcessSelector,
    },
    /// A saved maps file plus the region table of the capture
    Maps { maps: MapsFile, pid: i32 },
    /// Already-built context and index
    Prepared {
        process: ProcessContext,
        index: VmaIndex,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineInputs {
    pub source: ProcessSource,
    pub ground_truth: Vec<GroundTruthAddress>,
    pub container: ContainerSpec,
    pub tags: TagMap,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub process: ProcessContext,
    pub index: VmaIndex,
    pub correlations: Vec<CorrelationResult>,
    pub segments: Vec<Segment>,
    pub archive: ReconstructedArchive,
    pub report: RecoveryReport,
}

/// Largest span copied out of one area (1 GiB)
pub const DEFAULT_MAX_SEGMENT_LEN: u64 = 1 << 30;

/// Virtual ranges of `vma` holding ground-truth data: its own matches, plus
/// file ranges matched in other areas mapped from the same file
fn anchors(
    index: &VmaIndex,
    vma: &VmaEntry,
    correlations: &[CorrelationResult],
) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();

    for m in correlations.iter().flat_map(|c| c.matches()) {
        let Some(host) = index.get(m.vma) else {
            continue;
        };
        let start = host.start + m.offset;
        let end = start.saturating_add(m.len.max(1));

        if host.id == vma.id {
            ranges.push((start, end));
            continue;
        }

        let (Some(file_start), Some(path), Backing::File { path: own, offset }) =
            (host.file_offset_of(start), host.backing.file_path(), &vma.backing)
        else {
            continue;
        };
        if path != own.as_str() {
            continue;
        }
        let lo = file_start.max(*offset);
        let hi = file_start.saturating_add(end - start).min(offset + vma.size());
        if lo < hi {
            ranges.push((vma.start + (lo - offset), vma.start + (hi - offset)));
        }
    }

    ranges
}

/// `max_len` bytes of `vma` centred on the hull of `anchors`
fn window(vma: &VmaEntry, anchors: &[(u64, u64)], max_len: u64) -> Option<(u64, u64)> {
    if vma.size() <= max_len {
        return Some((vma.start, vma.end));
    }

    let lo = anchors.iter().map(|r| r.0).min()?;
    let hi = anchors.iter().map(|r| r.1).max()?.min(vma.end);
    let hull = hi.saturating_sub(lo);
    if hull >= max_len {
        return Some((lo, lo + max_len));
    }

    let margin = (max_len - hull) / 2;
    let end = (lo.saturating_sub(margin).max(vma.start) + max_len).min(vma.end);
    Some((end - max_len, end))
}

pub struct Pipeline<'a> {
    memory: &'a dyn PhysicalMemory,
    max_segment_len: u64,
}

impl<'a> Pipeline<'a> {
    pub fn new(memory: &'a dyn PhysicalMemory) -> Self {
        Self {
            memory,
            max_segment_len: DEFAULT_MAX_SEGMENT_LEN,
        }
    }

    /// Cap the bytes copied out of any single area
    pub fn with_max_segment_len(mut self, max_segment_len: u64) -> Self {
        self.max_segment_len = max_segment_len.max(1);
        self
    }

    /// Resolve the process context and VMA index for a source
    pub fn prepare(&self, source: &ProcessSource) -> Result<(ProcessContext, VmaIndex)> {
        match source {
            ProcessSource::Kernel { profile, selector } => {
                let process = ProcessContext::locate(self.memory, profile, selector)?;
                let index = VmaIndex::build(self.memory, &process, profile)?;
                Ok((process, index))
            }
            ProcessSource::Maps { maps, pid } => {
                let space = AddressSpace::linear(maps.runs.clone())?;
                let process = ProcessContext::from_parts(*pid, "", space);
                Ok((process, VmaIndex::from_entries(maps.vmas.clone())))
            }
            ProcessSource::Prepared { process, index } => Ok((process.clone(), index.clone())),
        }
    }

    /// VMAs to extract: every VMA a ground-truth address landed in, plus
    /// every VMA mapped from the same file as one of those
    pub fn select(index: &VmaIndex, correlations: &[CorrelationResult]) -> Vec<usize> {
        let mut selected: BTreeSet<usize> = correlations
            .iter()
            .flat_map(|c| c.matches())
            .map(|m| m.vma)
            .collect();

        let files: BTreeSet<&str> = selected
            .iter()
            .filter_map(|&id| index.get(id))
            .filter_map(|e| e.backing.file_path())
            .collect();

        for path in files {
            selected.extend(index.backed_by(path).map(|e| e.id));
        }

        selected.into_iter().collect()
    }

    /// Extraction requests for the selected VMAs. Areas up to `max_len` bytes
    /// are taken whole; larger ones are cut to a window around the
    /// ground-truth ranges they host, or skipped when they host none.
    pub fn plan<'i>(
        index: &'i VmaIndex,
        correlations: &[CorrelationResult],
        max_len: u64,
    ) -> (Vec<ExtractRequest<'i>>, Vec<String>) {
        let mut requests = Vec::new();
        let mut diagnostics = Vec::new();

        for vma in Self::select(index, correlations)
            .into_iter()
            .filter_map(|id| index.get(id))
        {
            match window(vma, &anchors(index, vma, correlations), max_len) {
                Some((start, end)) => {
                    if end - start < vma.size() {
                        diagnostics.push(format!(
                            "VMA {} spans {:#x} bytes; extracting {:#x}-{:#x}",
                            vma.id,
                            vma.size(),
                            start,
                            end
                        ));
                    }
                    requests.push(ExtractRequest { vma, start, end });
                }
                None => {
                    tracing::warn!(vma = vma.id, size = vma.size(), "area too large to extract");
                    diagnostics.push(format!(
                        "VMA {} spans {:#x} bytes and hosts no ground-truth range; skipped",
                        vma.id,
                        vma.size()
                    ));
                }
            }
        }

        (requests, diagnostics)
    }

    pub fn run(&self, inputs: &PipelineInputs) -> Result<PipelineOutput> {
        let (process, index) = self.prepare(&inputs.source)?;

        let correlations = correlate_all(&inputs.ground_truth, &index);
        let unmapped = correlations.iter().filter(|c| !c.is_mapped()).count();
        if unmapped > 0 {
            tracing::warn!(unmapped, "some ground-truth addresses are unmapped");
        }

        let (requests, plan_diagnostics) = Self::plan(&index, &correlations, self.max_segment_len);

        tracing::info!(
            pid = process.pid,
            addresses = correlations.len(),
            vmas = requests.len(),
            "extracting selected areas"
        );

        let segments = extract_many(self.memory, &process.space, &requests)?;
        let archive = reconstruct(&segments, &inputs.container)?;

        let mut report = summarize(&correlations, &segments, &archive, &inputs.tags);
        let mut diagnostics: Vec<String> = index
            .diagnostics
            .iter()
            .map(|d| format!("vma index: {}", d))
            .chain(plan_diagnostics.iter().map(|d| format!("extract: {}", d)))
            .collect();
        diagnostics.append(&mut report.diagnostics);
        report.diagnostics = diagnostics;

        Ok(PipelineOutput {
            process,
            index,
            correlations,
            segments,
            archive,
            report,
        })
    }
}
