//! Process command handlers (`processes`, `vmas`)

use anyhow::{Context, Result};
use memrecover::pipeline::Pipeline;
use memrecover::process::walk_tasks;
use std::path::Path;

use crate::cli::{ImageArgs, OutputFormat, ProcessArgs};
use crate::commands::{load_profile, open_image, process_source};
use crate::config::Config;
use crate::output::{emit, print_vmas};

/// Handle the `processes` command
pub fn processes(
    args: &ImageArgs,
    profile: Option<&Path>,
    format: OutputFormat,
    config: &Config,
) -> Result<()> {
    let image = open_image(args, config)?;
    let profile = load_profile(profile, config)?;
    profile.validate()?;

    let walk = walk_tasks(&image, &profile).context("Task list walk failed")?;
    emit(&walk, format, |walk| {
        println!("{:>8}  {:<16}  {:>12}  {:>12}", "PID", "COMM", "TASK", "MM");
        for task in &walk.tasks {
            let mm = task
                .mm
                .map(|mm| format!("{:#x}", mm))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:>8}  {:<16}  {:>12}  {:>12}",
                task.pid,
                task.comm,
                format!("{:#x}", task.task),
                mm
            );
        }
        for diag in &walk.diagnostics {
            println!("! {}", diag);
        }
    })
}

/// Handle the `vmas` command
pub fn vmas(
    args: &ImageArgs,
    process: &ProcessArgs,
    format: OutputFormat,
    config: &Config,
) -> Result<()> {
    let image = open_image(args, config)?;
    let source = process_source(process, config)?;
    let (context, index) = Pipeline::new(&image).prepare(&source)?;

    tracing::debug!(pid = context.pid, areas = index.len(), "indexed process");
    emit(&index, format, print_vmas)
}
