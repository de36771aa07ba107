//! envpack - relocatable environment packer CLI

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use envpack_cli::{Cli, run};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli)
}
