//! Configuration command handlers
//!
//! Handles the `configure` subcommand for setting memrecover defaults.

use crate::cli::OutputFormat;
use crate::config::Config;
use anyhow::Result;
use std::path::PathBuf;

/// New defaults given on the command line
#[derive(Debug, Default)]
pub struct Settings {
    pub page_size: Option<u64>,
    pub stitch_gap: Option<u64>,
    pub display_fill: Option<u8>,
    pub profile: Option<PathBuf>,
    pub format: Option<OutputFormat>,
}

impl Settings {
    fn is_empty(&self) -> bool {
        self.page_size.is_none()
            && self.stitch_gap.is_none()
            && self.display_fill.is_none()
            && self.profile.is_none()
            && self.format.is_none()
    }
}

/// Handle the configure command
pub fn handle(settings: Settings, show: bool) -> Result<()> {
    let mut config = Config::load()?;

    if show {
        show_config(&config);
        return Ok(());
    }

    if settings.is_empty() {
        show_usage();
        return Ok(());
    }

    apply(&mut config, settings);
    config.save()?;

    println!("Configuration updated");
    if let Ok(path) = Config::config_path() {
        println!("Config saved to: {}", path.display());
    }

    Ok(())
}

/// Merge new settings over the stored ones
fn apply(config: &mut Config, settings: Settings) {
    if let Some(page_size) = settings.page_size {
        config.page_size = Some(page_size);
    }
    if let Some(gap) = settings.stitch_gap {
        config.stitch_gap = Some(gap);
    }
    if let Some(fill) = settings.display_fill {
        config.display_fill = Some(fill);
    }
    if let Some(profile) = settings.profile {
        config.profile = Some(profile);
    }
    if let Some(format) = settings.format {
        config.format = Some(format);
    }
}

/// Display current configuration
fn show_config(config: &Config) {
    let unset = || "(unset)".to_string();
    println!(
        "Page size:    {}",
        config.page_size.map(|v| format!("{:#x}", v)).unwrap_or_else(unset)
    );
    println!(
        "Stitch gap:   {}",
        config.stitch_gap.map(|v| format!("{:#x}", v)).unwrap_or_else(unset)
    );
    println!(
        "Display fill: {}",
        config.display_fill.map(|v| format!("{:#04x}", v)).unwrap_or_else(unset)
    );
    println!(
        "Profile:      {}",
        config
            .profile
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(unset)
    );
    println!(
        "Format:       {}",
        config.format.map(|f| format!("{:?}", f)).unwrap_or_else(unset)
    );

    if let Ok(path) = Config::config_path() {
        println!("Config file:  {}", path.display());
    }
}

/// Show usage help for the configure command
fn show_usage() {
    println!("Usage: memrecover configure [--page-size N] [--stitch-gap N] [--display-fill B]");
    println!("                            [--profile PATH] [--format text|json|yaml]");
    println!("   or: memrecover configure --show");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_keeps_unset_fields() {
        let mut config = Config {
            page_size: Some(0x1000),
            profile: Some(PathBuf::from("old.yaml")),
            ..Config::default()
        };
        apply(
            &mut config,
            Settings {
                profile: Some(PathBuf::from("new.yaml")),
                format: Some(OutputFormat::Json),
                ..Settings::default()
            },
        );

        assert_eq!(config.page_size, Some(0x1000));
        assert_eq!(config.profile, Some(PathBuf::from("new.yaml")));
        assert_eq!(config.format, Some(OutputFormat::Json));
        assert_eq!(config.stitch_gap, None);
    }

    #[test]
    fn test_empty_settings() {
        assert!(Settings::default().is_empty());
        assert!(!Settings {
            stitch_gap: Some(0),
            ..Settings::default()
        }
        .is_empty());
    }

    #[test]
    fn test_config_path_exists() {
        assert!(Config::config_path().is_ok());
    }
}
