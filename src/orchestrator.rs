//! The poll loop: sweep stale claims, detect completions, then admit new files
//! up to the concurrency ceiling.

use crate::admission;
use crate::config::Config;
use crate::detector::{CompletionDetector, DetectorSettings, Outcome};
use crate::disposal::{Disposer, RetryingDisposer};
use crate::launcher::{CommandLauncher, Launcher};
use crate::ledger::Ledger;
use crate::scanner::{self, Candidate, ScanRules};
use crate::storage;
use anyhow::Result;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, never, select};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub watch_dir: PathBuf,
    pub video_extensions: Vec<String>,
    pub poll_interval: Duration,
    pub stale_timeout: Duration,
    pub max_attempts: Option<u32>,
    pub detector: DetectorSettings,
}

impl WatcherSettings {
    /// Directories are made absolute so ledger entries and tool arguments do
    /// not depend on the tool's working directory.
    pub fn from_config(config: &Config) -> Self {
        Self {
            watch_dir: storage::absolute(&config.watch_dir),
            video_extensions: config.video_extensions.clone(),
            poll_interval: config.poll_interval(),
            stale_timeout: config.stale_timeout(),
            max_attempts: config.max_attempts,
            detector: DetectorSettings {
                output_dir: storage::absolute(&config.output_dir),
                subtitle_extension: config.subtitle_extension.clone(),
                stuck_timeout: config.stuck_timeout(),
                failure_timeout: config.failure_timeout(),
                settle_interval: config.settle_interval(),
                min_artifact_bytes: config.min_artifact_bytes,
            },
        }
    }
}

/// What one tick did, by task name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub swept: Vec<String>,
    pub completed: Vec<String>,
    pub discarded: Vec<String>,
    pub pending: Vec<String>,
    pub admitted: Vec<String>,
    pub launch_failures: Vec<String>,
    pub slots: usize,
}

pub struct Watcher {
    settings: WatcherSettings,
    ledger: Ledger,
    detector: CompletionDetector,
    launcher: Box<dyn Launcher>,
    disposer: Box<dyn Disposer>,
    ceiling: usize,
}

impl Watcher {
    pub fn new(
        settings: WatcherSettings,
        ledger: Ledger,
        launcher: Box<dyn Launcher>,
        disposer: Box<dyn Disposer>,
        ceiling: usize,
    ) -> Self {
        let detector = CompletionDetector::new(settings.detector.clone());
        Self {
            settings,
            ledger,
            detector,
            launcher,
            disposer,
            ceiling,
        }
    }

    pub fn from_config(config: &Config, ledger: Ledger, ceiling: usize) -> Self {
        Self::new(
            WatcherSettings::from_config(config),
            ledger,
            Box::new(CommandLauncher::from_config(config)),
            Box::new(RetryingDisposer::from_config(config)),
            ceiling,
        )
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Ticks until `stop` fires (or its sender goes away), then releases every
    /// in-flight claim. `wake` cuts the wait short when new files show up.
    pub fn run(&mut self, stop: &Receiver<()>, wake: Receiver<()>) -> Result<()> {
        tracing::info!(
            watch_dir = %self.settings.watch_dir.display(),
            output_dir = %self.settings.detector.output_dir.display(),
            ceiling = self.ceiling,
            interval_secs = self.settings.poll_interval.as_secs(),
            "watcher started"
        );
        let mut wake = wake;
        loop {
            self.tick();
            select! {
                recv(stop) -> _ => break,
                recv(wake) -> msg => {
                    if msg.is_err() {
                        tracing::warn!("directory watcher stopped, polling only");
                        wake = never();
                    }
                }
                default(self.settings.poll_interval) => {}
            }
        }
        self.shutdown()?;
        tracing::info!("watcher stopped");
        Ok(())
    }

    /// One full pass. Per-task failures are logged and never abort the tick.
    pub fn tick(&mut self) -> TickReport {
        let now = Utc::now();
        let mut report = TickReport::default();

        match self
            .ledger
            .sweep_stale(self.settings.stale_timeout, now, |path| path.exists())
        {
            Ok(swept) => report.swept = swept,
            Err(err) => tracing::error!(error = %format!("{err:#}"), "stale sweep failed"),
        }

        let in_flight = self.ledger.list_in_flight();
        if !in_flight.is_empty() && !self.settings.detector.output_dir.is_dir() {
            tracing::warn!(
                path = %self.settings.detector.output_dir.display(),
                "output directory missing"
            );
        }
        for name in in_flight {
            self.check_completion(&name, now, &mut report);
        }

        let in_flight = self.ledger.count_in_flight();
        report.slots = admission::available_slots(self.ceiling, in_flight);
        tracing::info!(
            in_flight,
            ceiling = self.ceiling,
            slots = report.slots,
            "admission check"
        );
        if report.slots > 0 {
            let rules = ScanRules {
                extensions: &self.settings.video_extensions,
                max_attempts: self.settings.max_attempts,
            };
            let candidates = scanner::scan(&self.settings.watch_dir, &rules, &self.ledger);
            if !candidates.is_empty() {
                tracing::info!(found = candidates.len(), "new videos found");
            }
            for candidate in candidates.into_iter().take(report.slots) {
                self.admit(candidate, &mut report);
            }
        }

        tracing::debug!(
            swept = report.swept.len(),
            completed = report.completed.len(),
            discarded = report.discarded.len(),
            pending = report.pending.len(),
            admitted = report.admitted.len(),
            launch_failures = report.launch_failures.len(),
            "tick finished"
        );
        report
    }

    /// Releases all claims so a restart does not wait out the stale timeout.
    pub fn shutdown(&self) -> Result<Vec<String>> {
        let released = self.ledger.release_all()?;
        if released.is_empty() {
            tracing::info!("no in-flight tasks to release");
        } else {
            tracing::info!(count = released.len(), "released in-flight tasks");
        }
        Ok(released)
    }

    fn check_completion(&self, name: &str, now: DateTime<Utc>, report: &mut TickReport) {
        let Some(entry) = self.ledger.in_flight_entry(name) else {
            return;
        };
        let outcome = match self.detector.evaluate(name, entry.elapsed(now)) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(name, error = %err, "cannot inspect subtitle, retrying next tick");
                report.pending.push(name.to_string());
                return;
            }
        };

        match outcome {
            Outcome::Pending(reason) => {
                tracing::debug!(name, ?reason, "subtitle pending");
                report.pending.push(name.to_string());
            }
            Outcome::Success { size, plausible } => {
                if plausible {
                    tracing::info!(name, size, "subtitle ready");
                } else {
                    tracing::warn!(name, size, "subtitle content looks unusual, accepting it");
                }
                if let Err(err) = self.disposer.dispose(&entry.source_path) {
                    tracing::error!(name, error = %err, "disposal failed, task stays in flight");
                    report.pending.push(name.to_string());
                    return;
                }
                match self.ledger.mark_completed(name) {
                    Ok(()) => report.completed.push(name.to_string()),
                    Err(err) => {
                        tracing::error!(name, error = %format!("{err:#}"), "cannot record completion")
                    }
                }
            }
            Outcome::Failed(reason) => {
                tracing::warn!(name, ?reason, "subtitle generation failed, discarding task");
                match self.ledger.discard_as_failure(name) {
                    Ok(_) => report.discarded.push(name.to_string()),
                    Err(err) => {
                        tracing::error!(name, error = %format!("{err:#}"), "cannot discard task")
                    }
                }
            }
        }
    }

    fn admit(&self, candidate: Candidate, report: &mut TickReport) {
        let Candidate { name, path } = candidate;
        if let Err(err) = self.ledger.mark_in_flight(&name, &path) {
            tracing::error!(name = %name, error = %format!("{err:#}"), "cannot claim task");
            return;
        }
        match self.launcher.launch(&path) {
            Ok(()) => report.admitted.push(name),
            Err(err) => {
                tracing::error!(name = %name, error = %err, "launch failed, releasing claim");
                if let Err(err) = self.ledger.discard(&name) {
                    tracing::error!(name = %name, error = %format!("{err:#}"), "cannot release claim");
                }
                report.launch_failures.push(name);
            }
        }
    }
}
