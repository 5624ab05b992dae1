use clap::Parser;
use driveradio::cli::{self, Cli};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    cli::run(Cli::parse())
}
