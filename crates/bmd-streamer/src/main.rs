//! Stream H.264 video from Blackmagic USB encoders.
//!
//! The MPEG-TS payload goes to stdout (or a per-device child program);
//! all logging stays on stderr.

mod config;
mod sink;
mod supervisor;
mod worker;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = config::Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    supervisor::run(cli.into_config())
}
