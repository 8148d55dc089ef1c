//! Core CLI definitions

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::source::{ImageArgs, ProcessArgs};

/// clap value parser for hex (`0x`) or decimal numbers
pub fn parse_number(s: &str) -> Result<u64, String> {
    memrecover::input::parse_u64(s).map_err(|e| e.to_string())
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

#[derive(Parser)]
#[command(name = "memrecover")]
#[command(about = "Recover model archives from physical memory captures", long_about = None)]
pub struct Cli {
    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show format, size and page residency of an image
    Info {
        #[command(flatten)]
        image: ImageArgs,

        /// Output format (defaults to the configured format)
        #[arg(short, long)]
        format: Option<OutputFormat>,
    },

    /// Hex dump physical memory; absent pages are filled and flagged
    Read {
        #[command(flatten)]
        image: ImageArgs,

        /// Physical offset (hex, e.g. 0x1000)
        #[arg(long, value_parser = parse_number)]
        offset: u64,

        /// Number of bytes to read
        #[arg(short, long, default_value = "256", value_parser = parse_number)]
        size: u64,
    },

    /// List tasks found on the kernel task list
    #[command(visible_alias = "ps")]
    Processes {
        #[command(flatten)]
        image: ImageArgs,

        /// Kernel profile (YAML/JSON); defaults to the configured profile
        #[arg(long)]
        profile: Option<PathBuf>,

        #[arg(short, long)]
        format: Option<OutputFormat>,
    },

    /// Print the VMA index of a process
    Vmas {
        #[command(flatten)]
        image: ImageArgs,

        #[command(flatten)]
        process: ProcessArgs,

        #[arg(short, long)]
        format: Option<OutputFormat>,
    },

    /// Bind ground-truth addresses to VMAs
    Correlate {
        #[command(flatten)]
        image: ImageArgs,

        #[command(flatten)]
        process: ProcessArgs,

        /// Ground-truth address list (YAML/JSON)
        #[arg(short, long)]
        ground_truth: PathBuf,

        #[arg(short, long)]
        format: Option<OutputFormat>,
    },

    /// Copy one VMA (or part of it) out of the image
    Extract {
        #[command(flatten)]
        image: ImageArgs,

        #[command(flatten)]
        process: ProcessArgs,

        /// VMA id from `memrecover vmas`
        #[arg(long)]
        vma: usize,

        /// First virtual address (defaults to the VMA start)
        #[arg(long, value_parser = parse_number)]
        start: Option<u64>,

        /// End virtual address, exclusive (defaults to the VMA end)
        #[arg(long, value_parser = parse_number)]
        end: Option<u64>,

        /// Payload output path; the presence vector goes to <output>.presence.json
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Run the whole pipeline and write the recovered archive
    #[command(visible_alias = "r")]
    Recover {
        #[command(flatten)]
        image: ImageArgs,

        #[command(flatten)]
        process: ProcessArgs,

        /// Ground-truth address list (YAML/JSON)
        #[arg(short, long)]
        ground_truth: PathBuf,

        /// Container description (YAML/JSON)
        #[arg(short, long)]
        container: PathBuf,

        /// Tag to entry-name map (YAML/JSON)
        #[arg(short, long)]
        tags: Option<PathBuf>,

        /// Largest file-offset gap bridged when stitching segments
        #[arg(long, value_parser = parse_number)]
        stitch_gap: Option<u64>,

        /// Largest span copied out of one VMA; bigger areas are windowed
        /// around the ground-truth addresses they host
        #[arg(long, value_parser = parse_number)]
        max_segment_len: Option<u64>,

        /// Output directory for entries, manifest, archive.bin and report
        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long)]
        format: Option<OutputFormat>,
    },

    /// Configure default settings
    #[command(visible_alias = "c")]
    Configure {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Default presence-map page size
        #[arg(long, value_parser = parse_number)]
        page_size: Option<u64>,

        /// Default stitch gap for `recover`
        #[arg(long, value_parser = parse_number)]
        stitch_gap: Option<u64>,

        /// Byte shown in place of absent memory by `read`
        #[arg(long, value_parser = parse_fill)]
        display_fill: Option<u8>,

        /// Default kernel profile
        #[arg(long)]
        profile: Option<PathBuf>,

        /// Default output format
        #[arg(long)]
        format: Option<OutputFormat>,
    },
}

fn parse_fill(s: &str) -> Result<u8, String> {
    let value = parse_number(s)?;
    u8::try_from(value).map_err(|_| format!("{} does not fit in a byte", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_recover_arguments() {
        let cli = Cli::try_parse_from([
            "memrecover",
            "-v",
            "recover",
            "--image",
            "mem.lime",
            "--pid",
            "4242",
            "--ground-truth",
            "gt.yaml",
            "--container",
            "torchscript.yaml",
            "--stitch-gap",
            "0x2000",
            "--output",
            "out",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Recover {
                image,
                process,
                stitch_gap,
                format,
                ..
            } => {
                assert_eq!(image.image, PathBuf::from("mem.lime"));
                assert_eq!(process.pid, Some(4242));
                assert_eq!(stitch_gap, Some(0x2000));
                assert_eq!(format, None);
            }
            _ => panic!("expected recover"),
        }
    }

    #[test]
    fn test_maps_conflicts_with_profile() {
        let result = Cli::try_parse_from([
            "memrecover",
            "vmas",
            "--image",
            "mem.raw",
            "--maps",
            "maps.txt",
            "--profile",
            "p.yaml",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_display_fill_must_fit_a_byte() {
        assert_eq!(parse_fill("0xcc"), Ok(0xcc));
        assert!(parse_fill("0x100").is_err());
    }
}
