//! Command dispatch
//!
//! Maps parsed subcommands onto their handlers.

use anyhow::Result;

use crate::cli::Commands;
use crate::commands;
use crate::commands::configure::Settings;
use crate::commands::recover::RecoverPaths;
use crate::config::Config;

pub fn dispatch(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Info { image, format } => {
            commands::image::info(&image, config.format(format), config)
        }

        Commands::Read {
            image,
            offset,
            size,
        } => commands::image::read(&image, offset, size, config),

        Commands::Processes {
            image,
            profile,
            format,
        } => commands::process::processes(
            &image,
            profile.as_deref(),
            config.format(format),
            config,
        ),

        Commands::Vmas {
            image,
            process,
            format,
        } => commands::process::vmas(&image, &process, config.format(format), config),

        Commands::Correlate {
            image,
            process,
            ground_truth,
            format,
        } => commands::recover::correlate(
            &image,
            &process,
            &ground_truth,
            config.format(format),
            config,
        ),

        Commands::Extract {
            image,
            process,
            vma,
            start,
            end,
            output,
        } => commands::recover::extract_vma(&image, &process, vma, (start, end), &output, config),

        Commands::Recover {
            image,
            process,
            ground_truth,
            container,
            tags,
            stitch_gap,
            max_segment_len,
            output,
            format,
        } => commands::recover::recover(
            &image,
            &process,
            &RecoverPaths {
                ground_truth: &ground_truth,
                container: &container,
                tags: tags.as_deref(),
                output: &output,
            },
            stitch_gap,
            max_segment_len,
            config.format(format),
            config,
        ),

        Commands::Configure {
            show,
            page_size,
            stitch_gap,
            display_fill,
            profile,
            format,
        } => commands::configure::handle(
            Settings {
                page_size,
                stitch_gap,
                display_fill,
                profile,
                format,
            },
            show,
        ),
    }
}
