//! Recovery command handlers (`correlate`, `extract`, `recover`)

use anyhow::{bail, Context, Result};
use memrecover::input::load_document;
use memrecover::pipeline::{Pipeline, PipelineInputs, DEFAULT_MAX_SEGMENT_LEN};
use memrecover::{extract, ContainerSpec, GroundTruthAddress, TagMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cli::{ImageArgs, OutputFormat, ProcessArgs};
use crate::commands::{open_image, process_source};
use crate::config::Config;
use crate::output::{emit, print_correlations, render_report};

fn load_ground_truth(path: &Path) -> Result<Vec<GroundTruthAddress>> {
    load_document(path).with_context(|| format!("Failed to load ground truth {}", path.display()))
}

/// Handle the `correlate` command
pub fn correlate(
    args: &ImageArgs,
    process: &ProcessArgs,
    ground_truth: &Path,
    format: OutputFormat,
    config: &Config,
) -> Result<()> {
    let image = open_image(args, config)?;
    let (_, index) = Pipeline::new(&image).prepare(&process_source(process, config)?)?;
    let addresses = load_ground_truth(ground_truth)?;

    let results = memrecover::correlate_all(&addresses, &index);
    emit(&results, format, |results| print_correlations(results))
}

/// Sidecar path holding the presence vector of `output`
pub fn presence_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".presence.json");
    PathBuf::from(name)
}

/// Handle the `extract` command
pub fn extract_vma(
    args: &ImageArgs,
    process: &ProcessArgs,
    vma: usize,
    range: (Option<u64>, Option<u64>),
    output: &Path,
    config: &Config,
) -> Result<()> {
    let image = open_image(args, config)?;
    let (context, index) = Pipeline::new(&image).prepare(&process_source(process, config)?)?;

    let Some(entry) = index.get(vma) else {
        bail!("No VMA {} (the index has {} areas)", vma, index.len());
    };
    let start = range.0.unwrap_or(entry.start);
    let end = range.1.unwrap_or(entry.end);

    let segment = extract(&image, &context.space, entry, start, end)?;
    for diag in &segment.diagnostics {
        tracing::warn!("{}", diag);
    }

    fs::write(output, &segment.payload)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    let sidecar = presence_path(output);
    fs::write(&sidecar, serde_json::to_string_pretty(&segment)?)
        .with_context(|| format!("Failed to write {}", sidecar.display()))?;

    println!(
        "Wrote {:#x} bytes from VMA {} ({:#x}-{:#x}) to {}",
        segment.len(),
        vma,
        segment.start,
        segment.end(),
        output.display()
    );
    if !segment.is_complete() {
        println!(
            "{:#x} bytes were not captured; see {}",
            segment.presence.missing_bytes(),
            sidecar.display()
        );
    }

    Ok(())
}

pub struct RecoverPaths<'a> {
    pub ground_truth: &'a Path,
    pub container: &'a Path,
    pub tags: Option<&'a Path>,
    pub output: &'a Path,
}

/// Handle the `recover` command
pub fn recover(
    args: &ImageArgs,
    process: &ProcessArgs,
    paths: &RecoverPaths<'_>,
    stitch_gap: Option<u64>,
    max_segment_len: Option<u64>,
    format: OutputFormat,
    config: &Config,
) -> Result<()> {
    let image = open_image(args, config)?;

    let mut container: ContainerSpec = load_document(paths.container)
        .with_context(|| format!("Failed to load container {}", paths.container.display()))?;
    if let Some(gap) = stitch_gap.or(config.stitch_gap) {
        container.max_stitch_gap = gap;
    }

    let tags: TagMap = match paths.tags {
        Some(path) => load_document(path)
            .with_context(|| format!("Failed to load tag map {}", path.display()))?,
        None => TagMap::default(),
    };

    let inputs = PipelineInputs {
        source: process_source(process, config)?,
        ground_truth: load_ground_truth(paths.ground_truth)?,
        container,
        tags,
    };
    let output = Pipeline::new(&image)
        .with_max_segment_len(max_segment_len.unwrap_or(DEFAULT_MAX_SEGMENT_LEN))
        .run(&inputs)?;

    let written = output.archive.write_to_dir(paths.output)?;
    let archive_path = paths.output.join("archive.bin");
    fs::write(&archive_path, output.archive.to_container_bytes())
        .with_context(|| format!("Failed to write {}", archive_path.display()))?;
    let report_path = paths.output.join("report.json");
    fs::write(&report_path, serde_json::to_string_pretty(&output.report)?)
        .with_context(|| format!("Failed to write {}", report_path.display()))?;

    tracing::info!(
        files = written.len(),
        output = %paths.output.display(),
        "wrote recovered archive"
    );

    emit(&output.report, format, |report| {
        print!("{}", render_report(report));
        println!("\nWrote {} files to {}", written.len() + 2, paths.output.display());
    })
}
