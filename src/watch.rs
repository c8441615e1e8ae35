use crate::storage;
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, bounded};
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;

/// Keeps the filesystem watcher alive; dropping it stops the nudges.
pub struct DirectoryWaker {
    _watcher: RecommendedWatcher,
}

/// Watches `dir` (non-recursive) and sends a nudge whenever a file with an
/// allowed extension appears. Nudges coalesce: at most one is ever queued.
pub fn watch_directory(dir: &Path, extensions: Vec<String>) -> Result<(DirectoryWaker, Receiver<()>)> {
    let (tx, rx) = bounded(1);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                let arrived = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
                );
                if arrived
                    && event
                        .paths
                        .iter()
                        .any(|path| storage::extension_allowed(path, &extensions))
                {
                    let _ = tx.try_send(());
                }
            }
            Err(err) => tracing::debug!(error = %err, "watch event error"),
        }
    })
    .context("create directory watcher")?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch {}", dir.display()))?;
    tracing::info!(path = %dir.display(), "watching for new files");
    Ok((DirectoryWaker { _watcher: watcher }, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn new_video_nudges() -> Result<()> {
        let dir = tempdir()?;
        let (_waker, rx) = watch_directory(dir.path(), vec!["mp4".to_string()])?;
        fs::write(dir.path().join("movie.mp4"), b"video")?;
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        Ok(())
    }

    #[test]
    fn missing_directory_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        assert!(watch_directory(&dir.path().join("absent"), vec!["mp4".to_string()]).is_err());
        Ok(())
    }
}
