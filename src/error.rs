use std::path::PathBuf;
use thiserror::Error;

/// Failure to hand a source file off after its subtitle was detected.
#[derive(Debug, Error)]
pub enum DisposalError {
    #[error("source file missing: {0}")]
    SourceMissing(PathBuf),

    #[error("disposal of {path} failed after {attempts} attempts: {source}")]
    Exhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to start the external subtitle tool.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("subtitle tool not found: {0}")]
    ToolMissing(PathBuf),

    #[error("source file missing: {0}")]
    SourceMissing(PathBuf),

    #[error("spawn {tool}: {source}")]
    Spawn {
        tool: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("subtitle tool exited immediately with {0}")]
    ExitedEarly(std::process::ExitStatus),
}
