//! What happens to a source video once its subtitle is in place.

use crate::config::{Config, DisposalMode};
use crate::error::DisposalError;
use crate::storage;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Post-success handling of a source file. Implementations retry internally;
/// an `Err` means the file is still where it was.
pub trait Disposer {
    fn dispose(&self, source: &Path) -> Result<(), DisposalError>;
}

/// One attempt at moving a source file out of the watched directory.
pub trait DisposalStrategy {
    fn label(&self) -> &'static str;
    /// Returns the new location, if the file still exists somewhere.
    fn attempt(&self, source: &Path) -> io::Result<Option<PathBuf>>;
}

/// Moves into a sibling directory (`<watch>/<dir_name>/`), suffixing on collision.
#[derive(Debug, Clone)]
pub struct BackupDisposal {
    dir_name: String,
}

impl BackupDisposal {
    pub fn new(dir_name: impl Into<String>) -> Self {
        Self {
            dir_name: dir_name.into(),
        }
    }
}

impl DisposalStrategy for BackupDisposal {
    fn label(&self) -> &'static str {
        "backup"
    }

    fn attempt(&self, source: &Path) -> io::Result<Option<PathBuf>> {
        let parent = source.parent().unwrap_or_else(|| Path::new("."));
        let backup_dir = parent.join(&self.dir_name);
        fs::create_dir_all(&backup_dir)?;
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
        let target = storage::unique_destination(&backup_dir, &file_name);
        storage::move_file(source, &target)?;
        Ok(Some(target))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteDisposal;

impl DisposalStrategy for DeleteDisposal {
    fn label(&self) -> &'static str {
        "delete"
    }

    fn attempt(&self, source: &Path) -> io::Result<Option<PathBuf>> {
        fs::remove_file(source)?;
        Ok(None)
    }
}

/// Recoverable delete. Uses the freedesktop trash where there is one and
/// falls back to a backup move elsewhere.
#[derive(Debug, Clone)]
pub struct TrashDisposal {
    fallback: BackupDisposal,
}

impl TrashDisposal {
    pub fn new(fallback: BackupDisposal) -> Self {
        Self { fallback }
    }
}

impl DisposalStrategy for TrashDisposal {
    fn label(&self) -> &'static str {
        "trash"
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    fn attempt(&self, source: &Path) -> io::Result<Option<PathBuf>> {
        match directories::BaseDirs::new() {
            Some(base) => freedesktop::trash(&base.data_dir().join("Trash"), source).map(Some),
            None => {
                tracing::warn!("no home directory for trash, using backup instead");
                self.fallback.attempt(source)
            }
        }
    }

    #[cfg(not(all(unix, not(target_os = "macos"))))]
    fn attempt(&self, source: &Path) -> io::Result<Option<PathBuf>> {
        tracing::warn!("trash not supported on this platform, using backup instead");
        self.fallback.attempt(source)
    }
}

/// Wraps a strategy with a bounded number of attempts and a fixed delay.
pub struct RetryingDisposer {
    strategy: Box<dyn DisposalStrategy + Send + Sync>,
    attempts: u32,
    delay: Duration,
}

impl RetryingDisposer {
    pub fn new(
        strategy: Box<dyn DisposalStrategy + Send + Sync>,
        attempts: u32,
        delay: Duration,
    ) -> Self {
        Self {
            strategy,
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let backup = BackupDisposal::new(config.backup_dir_name.clone());
        let strategy: Box<dyn DisposalStrategy + Send + Sync> = match config.disposal_mode {
            DisposalMode::Backup => Box::new(backup),
            DisposalMode::Trash => Box::new(TrashDisposal::new(backup)),
            DisposalMode::Delete => Box::new(DeleteDisposal),
        };
        Self::new(
            strategy,
            config.disposal_attempts,
            config.disposal_retry_delay(),
        )
    }
}

impl Disposer for RetryingDisposer {
    fn dispose(&self, source: &Path) -> Result<(), DisposalError> {
        let mut attempt = 1;
        loop {
            if !source.exists() {
                return Err(DisposalError::SourceMissing(source.to_path_buf()));
            }
            match self.strategy.attempt(source) {
                Ok(target) => {
                    match target {
                        Some(target) => tracing::info!(
                            mode = self.strategy.label(),
                            source = %source.display(),
                            target = %target.display(),
                            "source disposed"
                        ),
                        None => tracing::info!(
                            mode = self.strategy.label(),
                            source = %source.display(),
                            "source disposed"
                        ),
                    }
                    return Ok(());
                }
                Err(err) if attempt < self.attempts => {
                    tracing::warn!(
                        mode = self.strategy.label(),
                        source = %source.display(),
                        attempt,
                        error = %err,
                        "disposal failed, retrying"
                    );
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    return Err(DisposalError::Exhausted {
                        path: source.to_path_buf(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
mod freedesktop {
    use crate::storage;
    use chrono::Local;
    use std::fs;
    use std::io::{self, Write};
    use std::path::{Path, PathBuf};

    /// Moves `source` into `trash_root/files` with a matching `.trashinfo`.
    pub fn trash(trash_root: &Path, source: &Path) -> io::Result<PathBuf> {
        let files = trash_root.join("files");
        let info = trash_root.join("info");
        fs::create_dir_all(&files)?;
        fs::create_dir_all(&info)?;

        let original = fs::canonicalize(source)?;
        let file_name = original
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
        let target = storage::unique_destination(&files, &file_name);
        let trashed_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(file_name);
        let info_path = info.join(format!("{trashed_name}.trashinfo"));

        let mut info_file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&info_path)?;
        write!(
            info_file,
            "[Trash Info]\nPath={}\nDeletionDate={}\n",
            encode_path(&original),
            Local::now().format("%Y-%m-%dT%H:%M:%S")
        )?;
        drop(info_file);

        if let Err(err) = storage::move_file(&original, &target) {
            let _ = fs::remove_file(&info_path);
            return Err(err);
        }
        Ok(target)
    }

    fn encode_path(path: &Path) -> String {
        let raw = path.to_string_lossy();
        let mut out = String::with_capacity(raw.len());
        for byte in raw.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                    out.push(byte as char)
                }
                _ => out.push_str(&format!("%{byte:02X}")),
            }
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use anyhow::Result;
        use tempfile::tempdir;

        #[test]
        fn trash_writes_info_and_moves_file() -> Result<()> {
            let dir = tempdir()?;
            let source = dir.path().join("my movie.mp4");
            fs::write(&source, b"video")?;
            let trash_root = dir.path().join("Trash");

            let target = trash(&trash_root, &source)?;
            assert!(!source.exists());
            assert_eq!(target, trash_root.join("files").join("my movie.mp4"));
            let info = fs::read_to_string(trash_root.join("info").join("my movie.mp4.trashinfo"))?;
            assert!(info.starts_with("[Trash Info]\n"));
            assert!(info.contains("my%20movie.mp4"));
            assert!(info.contains("DeletionDate="));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    struct FlakyStrategy {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl DisposalStrategy for FlakyStrategy {
        fn label(&self) -> &'static str {
            "flaky"
        }

        fn attempt(&self, _source: &Path) -> io::Result<Option<PathBuf>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"));
            }
            Ok(None)
        }
    }

    #[test]
    fn backup_moves_into_sibling_dir_with_unique_names() -> Result<()> {
        let dir = tempdir()?;
        let disposer = RetryingDisposer::new(
            Box::new(BackupDisposal::new("processed_backup")),
            3,
            Duration::ZERO,
        );
        let source = dir.path().join("movie.mp4");
        fs::write(&source, b"one")?;
        disposer.dispose(&source)?;
        fs::write(&source, b"two")?;
        disposer.dispose(&source)?;

        let backup_dir = dir.path().join("processed_backup");
        assert!(!source.exists());
        assert_eq!(fs::read(backup_dir.join("movie.mp4"))?, b"one");
        assert_eq!(fs::read_dir(&backup_dir)?.count(), 2);
        Ok(())
    }

    #[test]
    fn delete_removes_file() -> Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("movie.mkv");
        fs::write(&source, b"video")?;
        let disposer = RetryingDisposer::new(Box::new(DeleteDisposal), 1, Duration::ZERO);
        disposer.dispose(&source)?;
        assert!(!source.exists());
        Ok(())
    }

    #[test]
    fn missing_source_is_reported_without_retry() -> Result<()> {
        let dir = tempdir()?;
        let disposer = RetryingDisposer::new(Box::new(DeleteDisposal), 3, Duration::ZERO);
        let err = disposer
            .dispose(&dir.path().join("gone.mp4"))
            .expect_err("missing source");
        assert!(matches!(err, DisposalError::SourceMissing(_)));
        Ok(())
    }

    #[test]
    fn transient_errors_are_retried() -> Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("movie.mp4");
        fs::write(&source, b"video")?;
        let strategy = FlakyStrategy {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        };
        let disposer = RetryingDisposer::new(Box::new(strategy), 3, Duration::ZERO);
        disposer.dispose(&source)?;
        Ok(())
    }

    #[test]
    fn retries_are_bounded() -> Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("movie.mp4");
        fs::write(&source, b"video")?;
        let strategy = FlakyStrategy {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        };
        let disposer = RetryingDisposer::new(Box::new(strategy), 3, Duration::ZERO);
        match disposer.dispose(&source) {
            Err(DisposalError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhausted retries, got {other:?}"),
        }
        assert!(source.exists());
        Ok(())
    }
}
