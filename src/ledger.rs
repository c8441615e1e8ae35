//! Durable record of which source files are in flight or completed.
//!
//! The whole document is rewritten on every mutation (temp file + rename), so a
//! crash mid-write leaves either the previous or the next snapshot on disk.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tempfile::NamedTempFile;

const LEGACY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDocument {
    #[serde(default, alias = "processed")]
    pub completed: BTreeSet<String>,
    #[serde(default, alias = "processing")]
    pub in_flight: BTreeMap<String, InFlightEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightEntry {
    #[serde(default, alias = "start_time")]
    pub started_at: String,
    #[serde(default, alias = "file_path")]
    pub source_path: PathBuf,
}

impl InFlightEntry {
    fn new(source_path: &Path, started_at: DateTime<Utc>) -> Self {
        Self {
            started_at: started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            source_path: source_path.to_path_buf(),
        }
    }

    /// Accepts RFC 3339 and the older `YYYY-MM-DD HH:MM:SS` local-time form.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(&self.started_at) {
            return Some(ts.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(&self.started_at, LEGACY_TIME_FORMAT).ok()?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Time since the task was admitted; `None` if the timestamp is unreadable.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let started = self.started_at()?;
        Some((now - started).to_std().unwrap_or(Duration::ZERO))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Untracked,
    InFlight(InFlightEntry),
    Completed,
}

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    doc: Mutex<LedgerDocument>,
}

impl Ledger {
    /// Loads the ledger at `path`, falling back to an empty one when the file is
    /// missing or unreadable. Fails only if the file cannot be created at all.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create ledger dir {}", parent.display()))?;
        }
        let doc = match read_document(&path) {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                let doc = LedgerDocument::default();
                write_document(&path, &doc)?;
                tracing::info!(path = %path.display(), "created empty ledger");
                doc
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "ledger unreadable, starting empty"
                );
                LedgerDocument::default()
            }
        };
        tracing::debug!(
            completed = doc.completed.len(),
            in_flight = doc.in_flight.len(),
            "ledger loaded"
        );
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_completed(&self, name: &str) -> bool {
        self.lock().completed.contains(name)
    }

    /// Completion wins: a completed name is never reported in flight.
    pub fn is_in_flight(&self, name: &str) -> bool {
        let doc = self.lock();
        !doc.completed.contains(name) && doc.in_flight.contains_key(name)
    }

    pub fn state(&self, name: &str) -> TaskState {
        let doc = self.lock();
        if doc.completed.contains(name) {
            return TaskState::Completed;
        }
        match doc.in_flight.get(name) {
            Some(entry) => TaskState::InFlight(entry.clone()),
            None => TaskState::Untracked,
        }
    }

    pub fn in_flight_entry(&self, name: &str) -> Option<InFlightEntry> {
        match self.state(name) {
            TaskState::InFlight(entry) => Some(entry),
            _ => None,
        }
    }

    pub fn mark_in_flight(&self, name: &str, source_path: &Path) -> Result<()> {
        self.mark_in_flight_at(name, source_path, Utc::now())
    }

    /// Last writer wins on `started_at` when the name is already in flight.
    pub fn mark_in_flight_at(
        &self,
        name: &str,
        source_path: &Path,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(|doc| {
            doc.in_flight
                .insert(name.to_string(), InFlightEntry::new(source_path, started_at));
        })?;
        tracing::info!(name, source = %source_path.display(), "task in flight");
        Ok(())
    }

    pub fn mark_completed(&self, name: &str) -> Result<()> {
        self.mutate(|doc| {
            doc.in_flight.remove(name);
            doc.failures.remove(name);
            doc.completed.insert(name.to_string());
        })?;
        tracing::info!(name, "task completed");
        Ok(())
    }

    /// Drops the in-flight claim without recording success. Returns whether a
    /// claim existed.
    pub fn discard(&self, name: &str) -> Result<bool> {
        let removed = self.mutate(|doc| doc.in_flight.remove(name).is_some())?;
        if removed {
            tracing::info!(name, "task discarded");
        }
        Ok(removed)
    }

    /// Discard after a detected failure; bumps and returns the failure count.
    pub fn discard_as_failure(&self, name: &str) -> Result<u32> {
        let count = self.mutate(|doc| {
            doc.in_flight.remove(name);
            let count = doc.failures.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        })?;
        tracing::info!(name, failures = count, "task discarded as failed");
        Ok(count)
    }

    pub fn failure_count(&self, name: &str) -> u32 {
        self.lock().failures.get(name).copied().unwrap_or(0)
    }

    pub fn list_in_flight(&self) -> Vec<String> {
        let doc = self.lock();
        doc.in_flight
            .keys()
            .filter(|name| !doc.completed.contains(*name))
            .cloned()
            .collect()
    }

    /// Re-reads the persisted document before counting, so writes made by
    /// another process are seen.
    pub fn count_in_flight(&self) -> usize {
        self.reload();
        self.list_in_flight().len()
    }

    /// Replaces the in-memory state with the persisted one. On a read failure
    /// the in-memory snapshot (which is what we last wrote) is kept.
    pub fn reload(&self) {
        let mut guard = self.lock();
        self.refresh(&mut guard);
    }

    /// Discards in-flight entries whose source is gone or that started more than
    /// `max_age` ago. Unreadable timestamps count as stale.
    pub fn sweep_stale<F>(&self, max_age: Duration, now: DateTime<Utc>, exists: F) -> Result<Vec<String>>
    where
        F: Fn(&Path) -> bool,
    {
        self.reload();
        let swept = self.mutate(|doc| {
            let stale: Vec<String> = doc
                .in_flight
                .iter()
                .filter(|(_, entry)| {
                    if !exists(entry.source_path.as_path()) {
                        return true;
                    }
                    match entry.elapsed(now) {
                        Some(age) => age > max_age,
                        None => true,
                    }
                })
                .map(|(name, _)| name.clone())
                .collect();
            for name in &stale {
                doc.in_flight.remove(name);
            }
            stale
        })?;
        for name in &swept {
            tracing::info!(name = %name, "stale in-flight entry swept");
        }
        Ok(swept)
    }

    /// Releases every in-flight claim. Used on shutdown.
    pub fn release_all(&self) -> Result<Vec<String>> {
        let released = self.mutate(|doc| {
            let names: Vec<String> = doc.in_flight.keys().cloned().collect();
            doc.in_flight.clear();
            names
        })?;
        for name in &released {
            tracing::info!(name = %name, "in-flight claim released");
        }
        Ok(released)
    }

    pub fn reset(&self) -> Result<()> {
        self.mutate(|doc| *doc = LedgerDocument::default())?;
        tracing::info!(path = %self.path.display(), "ledger reset");
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerDocument {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerDocument> {
        self.doc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refresh(&self, doc: &mut LedgerDocument) {
        match read_document(&self.path) {
            Ok(Some(latest)) => *doc = latest,
            Ok(None) => {
                tracing::warn!(path = %self.path.display(), "ledger file vanished, keeping memory state");
            }
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %format!("{err:#}"),
                    "ledger reload failed, keeping memory state"
                );
            }
        }
    }

    /// Re-reads the file, applies `f` to a copy, persists it, then publishes
    /// it. A failed write leaves the in-memory state untouched.
    fn mutate<T>(&self, f: impl FnOnce(&mut LedgerDocument) -> T) -> Result<T> {
        let mut guard = self.lock();
        self.refresh(&mut guard);
        let mut next = guard.clone();
        let out = f(&mut next);
        if next != *guard {
            write_document(&self.path, &next)?;
            *guard = next;
        }
        Ok(out)
    }
}

fn read_document(path: &Path) -> Result<Option<LedgerDocument>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("read ledger {}", path.display()));
        }
    };
    let doc = serde_json::from_str(&contents)
        .with_context(|| format!("parse ledger {}", path.display()))?;
    Ok(Some(doc))
}

fn write_document(path: &Path, doc: &LedgerDocument) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let json = serde_json::to_string_pretty(doc)?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("create ledger temp in {}", dir.display()))?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("replace ledger {}", path.display()))?;
    Ok(())
}
