//! `notify`-backed watcher.
//!
//! Raw events land on `notify`'s callback thread, which only queues them and
//! signals the waker; all interpretation happens in [`FileWatcher::check`] on
//! the polling thread. Watches are registered per file, keyed by canonical
//! path, so an event is matched to its resource by exact path comparison.

use std::collections::HashMap;
#[cfg(unix)]
use std::os::fd::RawFd;
#[cfg(windows)]
use std::os::windows::io::RawHandle;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::waker::Waker;

use super::WatchAction;

struct EventQueue {
    events: Mutex<Vec<notify::Result<Event>>>,
    waker: Waker,
}

pub(crate) struct FileWatcher {
    watcher: RecommendedWatcher,
    queue: Arc<EventQueue>,
    by_path: HashMap<PathBuf, usize>,
    by_id: HashMap<usize, PathBuf>,
}

impl FileWatcher {
    pub fn new() -> Result<Self> {
        let queue = Arc::new(EventQueue {
            events: Mutex::new(Vec::new()),
            waker: Waker::new()?,
        });
        let sink = Arc::clone(&queue);
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                sink.events.lock().push(res);
                sink.waker.signal();
            },
            NotifyConfig::default(),
        )?;
        Ok(Self {
            watcher,
            queue,
            by_path: HashMap::new(),
            by_id: HashMap::new(),
        })
    }

    /// Becomes readable when events are queued; drained by `check`.
    #[cfg(unix)]
    pub fn wait_fd(&self) -> RawFd {
        self.queue.waker.raw_fd()
    }

    /// Signalled when events are queued.
    #[cfg(windows)]
    pub fn wait_handle(&self) -> RawHandle {
        self.queue.waker.raw_handle()
    }

    /// Begin monitoring `path` for resource `id`. Idempotent per resource.
    pub fn start_watch(&mut self, id: usize, path: &Path) -> Result<()> {
        if self.by_id.contains_key(&id) {
            return Ok(());
        }
        let canon = std::fs::canonicalize(path)?;
        self.watcher.watch(&canon, RecursiveMode::NonRecursive)?;
        debug!("started watching file {} for modification", canon.display());
        self.by_path.insert(canon.clone(), id);
        self.by_id.insert(id, canon);
        Ok(())
    }

    pub fn stop_watch(&mut self, id: usize) {
        if let Some(path) = self.by_id.remove(&id) {
            self.by_path.remove(&path);
            // The watch may already be gone if the file was deleted.
            let _ = self.watcher.unwatch(&path);
        }
    }

    /// Consume queued events and translate them into reload actions, in event
    /// order. Returns promptly; never blocks on the OS.
    pub fn check(&mut self) -> Vec<WatchAction> {
        self.queue.waker.drain();
        let events = std::mem::take(&mut *self.queue.events.lock());

        let mut actions = Vec::new();
        for queued in events {
            let event = match queued {
                Ok(event) => event,
                Err(err) => {
                    warn!("file watch error: {err}");
                    continue;
                }
            };
            let Some((id, path)) = self.matching_watch(&event) else {
                continue;
            };

            match event.kind {
                EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                    actions.push(WatchAction::Modified(id));
                }
                EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) | EventKind::Any => {
                    // Wait for the close-write; some writers never send one,
                    // which is what the deferred deadline is for.
                    actions.push(WatchAction::Deferred(id));
                }
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                    // The inode went away under the watch. Editors that save
                    // by rename-replace leave a fresh file at the same path.
                    if self.rearm(id, &path) {
                        actions.push(WatchAction::Modified(id));
                    }
                }
                _ => {}
            }
        }
        actions
    }

    fn matching_watch(&self, event: &Event) -> Option<(usize, PathBuf)> {
        for path in &event.paths {
            if let Some(&id) = self.by_path.get(path) {
                return Some((id, path.clone()));
            }
        }
        None
    }

    fn rearm(&mut self, id: usize, path: &Path) -> bool {
        let _ = self.watcher.unwatch(path);
        match self.watcher.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => {
                info!("restarting watch for file {}", path.display());
                true
            }
            Err(err) => {
                warn!(
                    "file {} was deleted, dropping watch: {err}",
                    path.display()
                );
                self.by_path.remove(path);
                self.by_id.remove(&id);
                false
            }
        }
    }
}
