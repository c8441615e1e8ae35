use crate::ledger::Ledger;
use crate::storage;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

/// A video in the watched directory that the ledger has not claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ScanRules<'a> {
    pub extensions: &'a [String],
    pub max_attempts: Option<u32>,
}

/// Lists admissible files in `dir` (non-recursive), sorted by name. A missing
/// or unreadable directory yields no candidates.
pub fn scan(dir: &Path, rules: &ScanRules<'_>, ledger: &Ledger) -> Vec<Candidate> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(err) => {
            tracing::error!(path = %dir.display(), error = %err, "cannot read watch directory");
            return Vec::new();
        }
    };

    let mut candidates = Vec::new();
    for entry in read_dir.flatten() {
        let path = entry.path();
        if !path.is_file() || !storage::extension_allowed(&path, rules.extensions) {
            continue;
        }
        let Some(name) = storage::task_name(&path) else {
            continue;
        };
        if ledger.is_completed(&name) || ledger.is_in_flight(&name) {
            continue;
        }
        if let Some(max) = rules.max_attempts {
            let failures = ledger.failure_count(&name);
            if failures >= max {
                tracing::debug!(name = %name, failures, "skipping file after repeated failures");
                continue;
            }
        }
        if let Err(err) = probe_readable(&path) {
            tracing::warn!(name = %name, error = %err, "file busy, skipping for now");
            continue;
        }
        candidates.push(Candidate { name, path });
    }
    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    candidates
}

/// Reads one byte; fails while another process holds the file exclusively.
fn probe_readable(path: &Path) -> std::io::Result<()> {
    let mut buf = [0u8; 1];
    let mut file = File::open(path)?;
    let _read = file.read(&mut buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    fn extensions() -> Vec<String> {
        vec!["mp4".to_string(), ".mkv".to_string()]
    }

    #[test]
    fn scan_filters_extension_and_ledger_state() -> Result<()> {
        let dir = tempdir()?;
        let watch = dir.path().join("watch");
        fs::create_dir_all(watch.join("processed_backup"))?;
        for name in ["a.mp4", "b.MKV", "c.mp4", "d.mp4", "notes.txt"] {
            fs::write(watch.join(name), b"data")?;
        }
        fs::write(watch.join("processed_backup").join("e.mp4"), b"data")?;

        let ledger = Ledger::open(dir.path().join("ledger.json"))?;
        ledger.mark_completed("c.mp4")?;
        ledger.mark_in_flight("d.mp4", &watch.join("d.mp4"))?;

        let ext = extensions();
        let rules = ScanRules {
            extensions: &ext,
            max_attempts: None,
        };
        let names: Vec<String> = scan(&watch, &rules, &ledger)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["a.mp4".to_string(), "b.MKV".to_string()]);
        Ok(())
    }

    #[test]
    fn missing_directory_yields_nothing() -> Result<()> {
        let dir = tempdir()?;
        let ledger = Ledger::open(dir.path().join("ledger.json"))?;
        let ext = extensions();
        let rules = ScanRules {
            extensions: &ext,
            max_attempts: None,
        };
        assert!(scan(&dir.path().join("absent"), &rules, &ledger).is_empty());
        Ok(())
    }

    #[test]
    fn repeated_failures_are_skipped_when_capped() -> Result<()> {
        let dir = tempdir()?;
        let watch = dir.path().join("watch");
        fs::create_dir_all(&watch)?;
        fs::write(watch.join("bad.mp4"), b"data")?;
        let ledger = Ledger::open(dir.path().join("ledger.json"))?;
        ledger.mark_in_flight("bad.mp4", &watch.join("bad.mp4"))?;
        ledger.discard_as_failure("bad.mp4")?;
        ledger.mark_in_flight("bad.mp4", &watch.join("bad.mp4"))?;
        ledger.discard_as_failure("bad.mp4")?;

        let ext = extensions();
        let uncapped = ScanRules {
            extensions: &ext,
            max_attempts: None,
        };
        assert_eq!(scan(&watch, &uncapped, &ledger).len(), 1);

        let capped = ScanRules {
            extensions: &ext,
            max_attempts: Some(2),
        };
        assert!(scan(&watch, &capped, &ledger).is_empty());
        Ok(())
    }
}
