//! Configuration file watching for hot-reload.
//!
//! The parent directory is watched rather than the file itself: editors and
//! deployment tools usually replace the file by renaming a new one over it,
//! which a watch on the old inode never reports.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

/// Watches one configuration file.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    file_name: OsString,
    events: UnboundedReceiver<notify::Result<Event>>,
}

impl ConfigWatcher {
    /// Starts watching `path`.
    pub fn new(path: impl AsRef<Path>) -> notify::Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| notify::Error::path_not_found().add_path(path.to_path_buf()))?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            _watcher: watcher,
            file_name,
            events: rx,
        })
    }

    fn touches_file(&self, event: &Event) -> bool {
        matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_)
        ) && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(self.file_name.as_os_str()))
    }

    /// Waits until the file is written or replaced. `None` means the watcher
    /// stopped delivering events.
    pub async fn changed(&mut self) -> Option<()> {
        loop {
            match self.events.recv().await? {
                Ok(event) if self.touches_file(&event) => return Some(()),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Configuration watch error"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_reports_writes_to_the_watched_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kestrel.yaml");
        std::fs::write(&path, "server: {}\n").unwrap();

        let mut watcher = ConfigWatcher::new(&path).unwrap();

        // Unrelated files in the same directory are ignored.
        std::fs::write(dir.path().join("other.yaml"), "x: 1\n").unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "logging: {{}}").unwrap();
        file.sync_all().unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(10), watcher.changed()).await;
        assert_eq!(changed.unwrap(), Some(()));
    }

    #[test]
    fn test_rejects_path_without_file_name() {
        assert!(ConfigWatcher::new("/").is_err());
    }
}
