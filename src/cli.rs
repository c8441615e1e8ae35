use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "subwatch",
    version,
    about = "Watches a folder and generates subtitles for new videos"
)]
pub struct Cli {
    /// Config file to use instead of ~/.config/subwatch.yaml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Run(RunArgs),
    /// Show the ceiling, in-flight tasks, and completion counts.
    Status,
    /// Drop in-flight tasks whose source file is gone.
    Prune,
    /// Release every in-flight task.
    Release,
    /// Replace the ledger with an empty one.
    Reset,
    /// Write the default config file if none exists.
    InitConfig,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct RunArgs {
    /// Run a single tick and exit.
    #[arg(long)]
    pub once: bool,
    /// Poll interval in seconds, overriding the config.
    #[arg(long)]
    pub interval: Option<u64>,
}
