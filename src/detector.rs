//! Infers completion of the external subtitle tool from its output file.
//!
//! The tool gives no signal, so each in-flight task is judged by whether
//! `<output_dir>/<stem>.<ext>` exists, how big it is, and how long the task has
//! been running. [`classify`] is the pure decision; [`CompletionDetector`]
//! gathers the filesystem observation it needs.

use crate::storage;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const CONTENT_PREFIX_BYTES: u64 = 500;
const PLAUSIBLE_MIN_CHARS: usize = 50;

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub output_dir: PathBuf,
    pub subtitle_extension: String,
    pub stuck_timeout: Duration,
    pub failure_timeout: Duration,
    pub settle_interval: Duration,
    pub min_artifact_bytes: u64,
}

/// What the output directory showed for one task on this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactObservation {
    Missing,
    Empty,
    /// Non-empty but not above the minimum size.
    Small { size: u64 },
    /// Above the minimum size before and after the settle interval.
    Settled { size: u64, plausible: bool },
    /// Dropped to or below the minimum size while settling.
    Unsettled { before: u64, after: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingReason {
    AwaitingArtifact,
    EmptyArtifact,
    SmallArtifact,
    Settling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// No artifact after the stuck timeout.
    Stuck,
    /// Zero-byte artifact after the failure timeout.
    EmptyArtifact,
    /// Undersized artifact after the failure timeout.
    SmallArtifact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending(PendingReason),
    Success { size: u64, plausible: bool },
    Failed(FailureReason),
}

/// Decides the outcome for one observation. `elapsed` is the time since
/// admission; `None` (unreadable start time) never times out here since the
/// stale sweep already handles it.
pub fn classify(
    observation: &ArtifactObservation,
    elapsed: Option<Duration>,
    settings: &DetectorSettings,
) -> Outcome {
    let exceeded = |limit: Duration| elapsed.is_some_and(|elapsed| elapsed > limit);
    match *observation {
        ArtifactObservation::Missing => {
            if exceeded(settings.stuck_timeout) {
                Outcome::Failed(FailureReason::Stuck)
            } else {
                Outcome::Pending(PendingReason::AwaitingArtifact)
            }
        }
        ArtifactObservation::Empty => {
            if exceeded(settings.failure_timeout) {
                Outcome::Failed(FailureReason::EmptyArtifact)
            } else {
                Outcome::Pending(PendingReason::EmptyArtifact)
            }
        }
        ArtifactObservation::Small { .. } => {
            if exceeded(settings.failure_timeout) {
                Outcome::Failed(FailureReason::SmallArtifact)
            } else {
                Outcome::Pending(PendingReason::SmallArtifact)
            }
        }
        // Plausibility only affects logging.
        ArtifactObservation::Settled { size, plausible } => Outcome::Success { size, plausible },
        ArtifactObservation::Unsettled { .. } => Outcome::Pending(PendingReason::Settling),
    }
}

/// Loose check that a text prefix looks like subtitle content.
pub fn looks_like_subtitles(prefix: &str) -> bool {
    prefix.contains("-->") || prefix.trim().chars().count() > PLAUSIBLE_MIN_CHARS
}

#[derive(Debug, Clone)]
pub struct CompletionDetector {
    settings: DetectorSettings,
}

impl CompletionDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self { settings }
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        storage::artifact_path_for(
            &self.settings.output_dir,
            name,
            &self.settings.subtitle_extension,
        )
    }

    /// Observes the artifact for `name` and classifies it.
    pub fn evaluate(&self, name: &str, elapsed: Option<Duration>) -> io::Result<Outcome> {
        let observation = self.observe(&self.artifact_path(name))?;
        tracing::debug!(name, ?observation, "artifact observed");
        Ok(classify(&observation, elapsed, &self.settings))
    }

    /// Stats the artifact; above the minimum size it reads a prefix, waits the
    /// settle interval and stats again.
    pub fn observe(&self, path: &Path) -> io::Result<ArtifactObservation> {
        let Some(size) = artifact_size(path)? else {
            return Ok(ArtifactObservation::Missing);
        };
        if size == 0 {
            return Ok(ArtifactObservation::Empty);
        }
        if size <= self.settings.min_artifact_bytes {
            return Ok(ArtifactObservation::Small { size });
        }

        let prefix = read_prefix(path)?;
        if !self.settings.settle_interval.is_zero() {
            thread::sleep(self.settings.settle_interval);
        }
        let after = artifact_size(path)?.unwrap_or(0);
        if after > self.settings.min_artifact_bytes {
            Ok(ArtifactObservation::Settled {
                size: after,
                plausible: looks_like_subtitles(&prefix),
            })
        } else {
            Ok(ArtifactObservation::Unsettled {
                before: size,
                after,
            })
        }
    }
}

fn artifact_size(path: &Path) -> io::Result<Option<u64>> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn read_prefix(path: &Path) -> io::Result<String> {
    let mut buf = Vec::new();
    File::open(path)?
        .take(CONTENT_PREFIX_BYTES)
        .read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
