//! No-op watcher for builds without the `watch` feature.

use std::path::Path;

use crate::error::Result;

use super::WatchAction;

pub(crate) struct FileWatcher;

impl FileWatcher {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }

    pub fn start_watch(&mut self, _id: usize, _path: &Path) -> Result<()> {
        Ok(())
    }

    pub fn stop_watch(&mut self, _id: usize) {}

    pub fn check(&mut self) -> Vec<WatchAction> {
        Vec::new()
    }
}
