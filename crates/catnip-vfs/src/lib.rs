/*!
Directory watching primitive for the Catnip daemon.

Wraps `notify` + `notify-debouncer-full` behind a small `DirWatcher` type that
coalesces filesystem churn into `Create`/`Write`/`Remove` events on a channel,
with a side channel for watcher errors severe enough that a caller should fall
back to polling.
*/

mod watcher;

pub use watcher::{DirWatcher, WatchError, WatchEvent};
