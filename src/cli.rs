//! Command-line surface: `clap` derive parsing plus the dispatch logic for
//! each subcommand. `main` (in `bin/driveradio.rs`) just initializes
//! logging and calls [`run`].

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::radio::{definitions, Radio};
use crate::scheduler::Scheduler;
use crate::source::Source;

#[derive(Debug, Parser)]
#[command(name = "driveradio", about = "A generative radio station engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate station definitions and report any missing referenced files.
    Lint(LintArgs),

    /// Run the station, writing the mixed output to a sink.
    Play(PlayArgs),

    /// Alias for `play`.
    Radio(PlayArgs),

    /// Out of scope: process supervision is left to the operator's own
    /// tooling (screen, systemd, a process manager).
    Start,
    Stop,
    StartAll,
    StopAll,
}

#[derive(Debug, Parser)]
pub struct LintArgs {
    #[arg(required = true)]
    pub definitions: Vec<PathBuf>,

    #[arg(short = 'e', long)]
    pub extensions: Option<String>,
}

#[derive(Debug, Parser)]
pub struct PlayArgs {
    #[arg(required = true)]
    pub definitions: Vec<PathBuf>,

    #[arg(short = 'o', long)]
    pub output: Option<String>,

    #[arg(short = 'e', long)]
    pub extensions: Option<String>,

    #[arg(short = 'm', long = "meta-url")]
    pub meta_url: Option<String>,

    #[arg(short = 's', long = "buffer-seconds", default_value_t = 0.5)]
    pub buffer_seconds: f64,
}

const DEFAULT_EXTENSION: &str = "ogg";
const DEVICE_SAMPLERATE: u32 = 48_000;
const DEVICE_CHANNELS: usize = 2;
const TARGET_LUFS: f64 = -14.0;

fn pick_extension(extensions: &Option<String>) -> String {
    extensions
        .as_ref()
        .and_then(|s| s.split(',').next())
        .unwrap_or(DEFAULT_EXTENSION)
        .to_string()
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Lint(args) => run_lint(args),
        Command::Play(args) | Command::Radio(args) => run_play(args),
        Command::Start | Command::Stop | Command::StartAll | Command::StopAll => {
            anyhow::bail!("process supervision (start/stop/start-all/stop-all) is not implemented in this build")
        }
    }
}

fn run_lint(args: LintArgs) -> anyhow::Result<()> {
    let extension = pick_extension(&args.extensions);
    let defs = definitions::load(&args.definitions, &extension)?;
    if definitions::lint(&defs) {
        Ok(())
    } else {
        anyhow::bail!("one or more referenced files were not found")
    }
}

fn run_play(args: PlayArgs) -> anyhow::Result<()> {
    let extension = pick_extension(&args.extensions);

    // an error loading definitions before we've even opened an output is
    // unrecoverable, same as the first load inside Radio::new.
    definitions::load(&args.definitions, &extension)?;

    let mut sink = crate::sink::open(args.output.as_deref(), DEVICE_SAMPLERATE, DEVICE_CHANNELS)?;
    let block_frames = (args.buffer_seconds * sink.samplerate() as f64).round() as usize;

    let mut root = Scheduler::new(sink.samplerate(), sink.channels());
    root.allocate(block_frames);

    let radio = Radio::new(args.definitions, extension, args.meta_url, TARGET_LUFS)?;
    radio.spawn(root.clone());

    loop {
        let block = root.fill(Some(block_frames));
        sink.write(block)?;
    }
}
