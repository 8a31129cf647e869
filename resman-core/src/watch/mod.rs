//! File-modification watching.
//!
//! The real back-end translates `notify` events (inotify on Linux,
//! `ReadDirectoryChangesW` on Windows) into per-resource reload actions with
//! the save-pattern debounce the registry relies on:
//!
//! - a bare data write schedules a deferred reload [`RELOAD_DEBOUNCE_MS`]
//!   milliseconds out, in case the writer never closes the file;
//! - a close-after-write reloads immediately and cancels the deferred path;
//! - a delete or rename over a watched path (editors like vim save by
//!   rename-replace) re-arms the watch on the new inode and reloads.
//!
//! With the `watch` feature disabled every entry point is a successful no-op.

#[cfg(feature = "watch")]
mod notify_backend;
#[cfg(feature = "watch")]
pub(crate) use notify_backend::FileWatcher;

#[cfg(not(feature = "watch"))]
mod disabled;
#[cfg(not(feature = "watch"))]
pub(crate) use disabled::FileWatcher;

/// How long a bare modify event may sit before it forces a reload.
pub(crate) const RELOAD_DEBOUNCE_MS: u64 = 128;

/// What the polling thread should do about a watched resource.
pub(crate) enum WatchAction {
    /// Schedule a reload for `now + RELOAD_DEBOUNCE_MS` unless a close-write
    /// arrives first.
    Deferred(usize),
    /// Reload on this poll.
    Modified(usize),
}
