mod cli;
mod commands;
mod config;
mod dispatch;
mod output;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::Cli;
use config::Config;

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "memrecover=info",
        1 => "memrecover=debug",
        _ => "memrecover=trace",
    };

    // Logs go to stderr so JSON/YAML on stdout stays parseable
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load()?;
    dispatch::dispatch(cli.command, &config)
}
