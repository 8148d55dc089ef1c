//! Command implementations
//!
//! Each submodule handles one group of subcommands.

pub mod configure;
pub mod image;
pub mod process;
pub mod recover;

use anyhow::{bail, Context, Result};
use memrecover::image::ImageOptions;
use memrecover::input::{load_document, parse_ranges};
use memrecover::pipeline::ProcessSource;
use memrecover::vma::parse_maps;
use memrecover::{KernelProfile, MemoryImage, ProcessSelector};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cli::{ImageArgs, ProcessArgs};
use crate::config::Config;

/// Open the image named by `args`, with config defaults filled in
pub fn open_image(args: &ImageArgs, config: &Config) -> Result<MemoryImage> {
    let mut options = ImageOptions {
        format: args.image_format,
        ..ImageOptions::default()
    };
    if let Some(page_size) = args.page_size.or(config.page_size) {
        options.page_size = page_size;
    }
    if let Some(path) = &args.absent {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read absent ranges from {}", path.display()))?;
        options.absent = parse_ranges(&text)
            .with_context(|| format!("Failed to parse absent ranges in {}", path.display()))?;
    }

    MemoryImage::open(&args.image, &options)
        .with_context(|| format!("Failed to open image {}", args.image.display()))
}

pub fn load_profile(flag: Option<&Path>, config: &Config) -> Result<KernelProfile> {
    let path: PathBuf = match flag.or(config.profile.as_deref()) {
        Some(path) => path.to_path_buf(),
        None => bail!("No kernel profile given (use --profile or `memrecover configure --profile`)"),
    };
    load_document(&path).with_context(|| format!("Failed to load profile {}", path.display()))
}

/// Turn process arguments into a pipeline source
pub fn process_source(args: &ProcessArgs, config: &Config) -> Result<ProcessSource> {
    if let Some(path) = &args.maps {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read maps file {}", path.display()))?;
        let maps = parse_maps(&text)
            .with_context(|| format!("Failed to parse maps file {}", path.display()))?;
        if maps.runs.is_empty() {
            bail!(
                "{} has no region table lines; cannot place its areas in the image",
                path.display()
            );
        }
        return Ok(ProcessSource::Maps {
            maps,
            pid: args.pid.unwrap_or(0),
        });
    }

    let selector = match (args.pid, &args.name) {
        (Some(pid), _) => ProcessSelector::Pid(pid),
        (None, Some(name)) => ProcessSelector::Name(name.clone()),
        (None, None) => bail!("Select a process with --pid or --name"),
    };
    let profile = load_profile(args.profile.as_deref(), config)?;

    Ok(ProcessSource::Kernel { profile, selector })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_args() -> ProcessArgs {
        ProcessArgs {
            profile: None,
            pid: None,
            name: None,
            maps: None,
        }
    }

    #[test]
    fn test_kernel_source_needs_a_selector() {
        let err = process_source(&process_args(), &Config::default()).unwrap_err();
        assert!(err.to_string().contains("--pid"));
    }

    #[test]
    fn test_kernel_source_needs_a_profile() {
        let args = ProcessArgs {
            pid: Some(1),
            ..process_args()
        };
        let err = process_source(&args, &Config::default()).unwrap_err();
        assert!(err.to_string().contains("No kernel profile"));
    }

    #[test]
    fn test_maps_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maps.txt");
        fs::write(
            &path,
            "7f0000000000-7f0000002000 r--p 00000000 08:01 77 /srv/models/net.pt\n\
             0x7f0000000000 0x7f0000002000 0x2000 0x1000\n",
        )
        .unwrap();

        let args = ProcessArgs {
            maps: Some(path),
            pid: Some(4242),
            ..process_args()
        };
        match process_source(&args, &Config::default()).unwrap() {
            ProcessSource::Maps { maps, pid } => {
                assert_eq!(pid, 4242);
                assert_eq!(maps.vmas.len(), 1);
                assert_eq!(maps.runs[0].phys_start, 0x1000);
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_maps_without_region_table_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maps.txt");
        fs::write(&path, "400000-401000 r-xp 00000000 08:01 1 /bin/true\n").unwrap();

        let args = ProcessArgs {
            maps: Some(path),
            ..process_args()
        };
        assert!(process_source(&args, &Config::default()).is_err());
    }
}
