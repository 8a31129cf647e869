//! Resource registry: path-deduplicated slots, the two-stage load pipeline,
//! and the polling loop that dispatches done/destroy callbacks and reloads.
//!
//! The registry hands out dense integer ids. Loads run on the shared worker
//! pool; everything user-visible after a load (`done`, `destroy`) runs on the
//! thread that owns the [`Resman`] handle and calls [`Resman::poll`]. The
//! handle is deliberately not `Send`, which pins that contract down at
//! compile time.

use std::collections::HashSet;
use std::fmt;
#[cfg(unix)]
use std::os::fd::RawFd;
#[cfg(windows)]
use std::os::windows::io::RawHandle;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::clock;
use crate::error::{ResmanError, Result};
use crate::pool::ThreadPool;
#[cfg(unix)]
use crate::waker::wait_readable;
#[cfg(windows)]
use crate::waker::wait_signaled;
use crate::watch::{FileWatcher, RELOAD_DEBOUNCE_MS, WatchAction};

/// Stable identifier of a registered resource. Equal to the slot index the
/// resource occupies; slots of removed resources are reused by later adds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ResourceId(pub(crate) usize);

impl ResourceId {
    /// The underlying slot index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Integer options tuned with [`Resman::set_opt`].
#[non_exhaustive]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opt {
    /// Millisecond budget `poll` may spend dispatching done callbacks before
    /// deferring the rest to the next call. `0` removes the cap.
    Timeslice,
}

/// Default [`Opt::Timeslice`] value, matched to a 60 Hz frame.
pub const DEFAULT_TIMESLICE_MS: i32 = 16;

/// Background load callback: runs on a worker thread, parses `path` and
/// stores the artifact through `&mut D`. Returns 0 on success, negative on
/// failure; the value is recorded and readable via [`Resman::res_result`].
pub type LoadFn<D> = dyn Fn(&Path, ResourceId, &mut D) -> i32 + Send + Sync;

type DoneFn<D> = dyn FnMut(ResourceId, &mut D) -> i32;
type DestroyFn<D> = dyn FnMut(ResourceId, &mut D);

#[derive(Default)]
struct SlotFlags {
    /// Last load result code.
    result: i32,
    /// Enqueued or executing on a worker.
    pending: bool,
    /// Load finished, done callback not dispatched yet.
    done_pending: bool,
    /// Marked for removal at the next poll.
    delete_pending: bool,
    /// Loaded without a done callback; the poll thread arms the watch.
    watch_pending: bool,
    /// A watch was armed at some point. Stays set when the watch is later
    /// abandoned, so a dead watch is not re-armed behind the app's back.
    watched: bool,
    /// Completed loads. 0 until the first successful load/done round-trip.
    num_loads: u32,
    /// Absolute deadline for a debounced reload, if one is scheduled.
    reload_deadline: Option<u64>,
}

struct Slot<D> {
    id: usize,
    path: PathBuf,
    flags: Mutex<SlotFlags>,
    /// Held across the load callback, so metadata stays reachable while a
    /// worker parses the file.
    data: Mutex<D>,
}

struct Shared<D> {
    pool: Arc<ThreadPool>,
    slots: Mutex<Vec<Option<Arc<Slot<D>>>>>,
    load_fn: RwLock<Option<Arc<LoadFn<D>>>>,
    /// Workers branch on this: with a done callback the load result is
    /// adjudicated on the polling thread, without one in the worker itself.
    has_done_fn: AtomicBool,
}

impl<D: Send + 'static> Shared<D> {
    fn slot(&self, idx: usize) -> Option<Arc<Slot<D>>> {
        self.slots.lock().get(idx).and_then(Clone::clone)
    }

    fn live_slots(&self) -> Vec<Arc<Slot<D>>> {
        self.slots.lock().iter().flatten().cloned().collect()
    }

    /// Queue a (re)load job; `pending` stays set until the worker returns.
    fn reload(self: &Arc<Self>, slot: &Arc<Slot<D>>) {
        slot.flags.lock().pending = true;
        let shared = Arc::clone(self);
        let slot = Arc::clone(slot);
        self.pool.enqueue(move || load_job(&shared, &slot));
    }
}

/// First-stage loading, on a worker thread.
fn load_job<D: Send + 'static>(shared: &Shared<D>, slot: &Slot<D>) {
    let load_fn = shared.load_fn.read().clone();
    let result = match load_fn {
        Some(load) => {
            let mut data = slot.data.lock();
            load(&slot.path, ResourceId(slot.id), &mut data)
        }
        // Nothing to run; count it as a trivially successful load.
        None => 0,
    };

    let mut flags = slot.flags.lock();
    flags.result = result;
    flags.pending = false;

    if shared.has_done_fn.load(Ordering::Acquire) {
        flags.done_pending = true;
    } else if result < 0 {
        // No done callback to adjudicate the failure: drop a resource that
        // never loaded, keep one that used to be valid.
        if flags.num_loads == 0 {
            flags.delete_pending = true;
        }
    } else {
        flags.num_loads += 1;
        flags.watch_pending = true;
    }
}

/// The resource manager.
///
/// `D` is the per-resource user data; the load callback fills it in on a
/// worker thread and the done/destroy callbacks consume it on the polling
/// thread. The handle itself must stay on one thread (it is not `Send`);
/// that thread is the polling thread.
pub struct Resman<D = ()> {
    shared: Arc<Shared<D>>,
    done_fn: Option<Box<DoneFn<D>>>,
    destroy_fn: Option<Box<DestroyFn<D>>>,
    watcher: FileWatcher,
    timeslice_ms: i32,
    #[cfg(unix)]
    wait_fds: Vec<RawFd>,
    #[cfg(windows)]
    wait_handles: Vec<RawHandle>,
}

/// Registries created through [`Resman::new`] share one worker pool, sized
/// once from `RESMAN_THREADS`. Held weakly so the pool dies with the last
/// registry instead of lingering as a process singleton.
static SHARED_POOL: Mutex<Weak<ThreadPool>> = Mutex::new(Weak::new());

fn shared_pool() -> Result<Arc<ThreadPool>> {
    let mut stash = SHARED_POOL.lock();
    if let Some(pool) = stash.upgrade() {
        return Ok(pool);
    }
    let threads = env_thread_count(std::env::var("RESMAN_THREADS").ok().as_deref());
    let pool = Arc::new(ThreadPool::new(threads)?);
    *stash = Arc::downgrade(&pool);
    Ok(pool)
}

/// An explicit positive `RESMAN_THREADS` wins; anything else (absent, zero,
/// garbage) means processors minus one, keeping a core free for the polling
/// thread, with a floor of one.
fn env_thread_count(var: Option<&str>) -> usize {
    match var.and_then(|v| v.trim().parse::<i64>().ok()) {
        Some(n) if n >= 1 => n as usize,
        _ => crate::pool::num_processors().saturating_sub(1).max(1),
    }
}

impl<D: Send + 'static> Resman<D> {
    /// Create a registry on the process-shared worker pool, creating the
    /// pool on first use (`RESMAN_THREADS` controls its size).
    pub fn new() -> Result<Self> {
        Self::with_pool(shared_pool()?)
    }

    /// Create a registry with a private pool of `num_threads` workers
    /// (`0` = one per processor). Useful for tests and embedders that do not
    /// want cross-registry sharing.
    pub fn with_threads(num_threads: usize) -> Result<Self> {
        Self::with_pool(Arc::new(ThreadPool::new(num_threads)?))
    }

    fn with_pool(pool: Arc<ThreadPool>) -> Result<Self> {
        // Anchor the clock before any deadline math happens.
        clock::now_ms();

        let watcher = FileWatcher::new()?;

        #[cfg(unix)]
        let wait_fds = {
            #[allow(unused_mut)]
            let mut fds = vec![pool.wait_fd()];
            #[cfg(feature = "watch")]
            fds.push(watcher.wait_fd());
            fds
        };
        #[cfg(windows)]
        let wait_handles = {
            #[allow(unused_mut)]
            let mut handles = vec![pool.wait_handle()];
            #[cfg(feature = "watch")]
            handles.push(watcher.wait_handle());
            handles
        };

        Ok(Self {
            shared: Arc::new(Shared {
                pool,
                slots: Mutex::new(Vec::new()),
                load_fn: RwLock::new(None),
                has_done_fn: AtomicBool::new(false),
            }),
            done_fn: None,
            destroy_fn: None,
            watcher,
            timeslice_ms: DEFAULT_TIMESLICE_MS,
            #[cfg(unix)]
            wait_fds,
            #[cfg(windows)]
            wait_handles,
        })
    }

    /// Register the background load callback.
    pub fn set_load_fn<F>(&mut self, load: F)
    where
        F: Fn(&Path, ResourceId, &mut D) -> i32 + Send + Sync + 'static,
    {
        *self.shared.load_fn.write() = Some(Arc::new(load));
    }

    /// Register the done callback, dispatched from [`poll`](Self::poll) after
    /// each load. Returning `-1` for a resource that has never loaded
    /// successfully removes it; on a reload the resource is kept.
    pub fn set_done_fn<F>(&mut self, done: F)
    where
        F: FnMut(ResourceId, &mut D) -> i32 + 'static,
    {
        self.done_fn = Some(Box::new(done));
        self.shared.has_done_fn.store(true, Ordering::Release);
    }

    /// Register the destroy callback, dispatched from `poll` (or drop) when a
    /// resource is removed.
    pub fn set_destroy_fn<F>(&mut self, destroy: F)
    where
        F: FnMut(ResourceId, &mut D) + 'static,
    {
        self.destroy_fn = Some(Box::new(destroy));
    }

    /// Set an integer option.
    pub fn set_opt(&mut self, opt: Opt, value: i32) {
        match opt {
            Opt::Timeslice => self.timeslice_ms = value,
        }
    }

    /// Read an integer option.
    pub fn get_opt(&self, opt: Opt) -> i32 {
        match opt {
            Opt::Timeslice => self.timeslice_ms,
        }
    }

    /// Register `path` and start loading it. Idempotent: a path that is
    /// already registered returns its existing id and queues nothing.
    pub fn add(&self, path: impl Into<PathBuf>, data: D) -> ResourceId {
        let path = path.into();
        if let Some(id) = self.find(&path) {
            return id;
        }

        let mut slots = self.shared.slots.lock();
        // Reuse the first vacated slot, append otherwise.
        let idx = slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(slots.len());
        let slot = Arc::new(Slot {
            id: idx,
            path,
            flags: Mutex::new(SlotFlags::default()),
            data: Mutex::new(data),
        });
        if idx == slots.len() {
            slots.push(Some(Arc::clone(&slot)));
        } else {
            slots[idx] = Some(Arc::clone(&slot));
        }
        drop(slots);

        self.shared.reload(&slot);
        ResourceId(idx)
    }

    /// Backward-compatible alias for [`add`](Self::add).
    pub fn lookup(&self, path: impl Into<PathBuf>, data: D) -> ResourceId {
        self.add(path, data)
    }

    /// Find a registered path without side effects.
    pub fn find(&self, path: impl AsRef<Path>) -> Option<ResourceId> {
        let path = path.as_ref();
        self.shared
            .slots
            .lock()
            .iter()
            .flatten()
            .find(|slot| slot.path == path)
            .map(|slot| ResourceId(slot.id))
    }

    /// Mark a resource for removal. The destroy callback runs during the
    /// next [`poll`](Self::poll) once no worker is loading the resource.
    pub fn remove(&self, id: ResourceId) -> Result<()> {
        let slot = self
            .shared
            .slot(id.0)
            .ok_or(ResmanError::UnknownResource(id.0))?;
        slot.flags.lock().delete_pending = true;
        Ok(())
    }

    /// Total queued plus active jobs on the worker pool.
    pub fn pending(&self) -> usize {
        self.shared.pool.pending_jobs()
    }

    /// Block until the load of `id` has finished. Unknown ids return
    /// immediately.
    pub fn wait_job(&self, id: ResourceId) {
        let Some(slot) = self.shared.slot(id.0) else {
            return;
        };
        while slot.flags.lock().pending {
            let cur = self.shared.pool.pending_jobs();
            self.shared.pool.wait_pending(cur.saturating_sub(1));
        }
    }

    /// Block until any one pending job completes.
    pub fn wait_any(&self) {
        let cur = self.shared.pool.pending_jobs();
        self.shared.pool.wait_pending(cur.saturating_sub(1));
    }

    /// Block until every pending job completes.
    pub fn wait_all(&self) {
        self.shared.pool.wait();
    }

    /// Drive the registry: destroy removed resources, consume file events,
    /// and dispatch pending done callbacks (bounded by [`Opt::Timeslice`]).
    /// Call this regularly from the polling thread; every user-visible
    /// callback fires inside it.
    pub fn poll(&mut self) {
        let shared = Arc::clone(&self.shared);

        // Destruction pass: everything flagged while off the queues/workers.
        for slot in shared.live_slots() {
            let flags = slot.flags.lock();
            if flags.delete_pending && !flags.pending {
                drop(flags);
                remove_slot(&shared, &mut self.watcher, &mut self.destroy_fn, slot.id);
            }
        }

        // File events: schedule deferred reloads, queue immediate ones once
        // per resource no matter how many events piled up.
        let actions = self.watcher.check();
        let now = clock::now_ms();
        let mut modified = HashSet::new();
        for action in actions {
            match action {
                WatchAction::Deferred(idx) => {
                    if let Some(slot) = shared.slot(idx) {
                        slot.flags.lock().reload_deadline = Some(now + RELOAD_DEBOUNCE_MS);
                    }
                }
                WatchAction::Modified(idx) => {
                    if let Some(slot) = shared.slot(idx) {
                        slot.flags.lock().reload_deadline = None;
                        modified.insert(idx);
                    }
                }
            }
        }
        for idx in modified {
            if let Some(slot) = shared.slot(idx) {
                debug!("file {} modified", slot.path.display());
                shared.reload(&slot);
            }
        }

        // Watches requested by workers (loads that completed with no done
        // callback registered). Watcher calls stay on this thread.
        for slot in shared.live_slots() {
            let mut flags = slot.flags.lock();
            if flags.watch_pending {
                flags.watch_pending = false;
                drop(flags);
                arm_watch(&mut self.watcher, &slot);
            }
        }

        // Completion notifications are edge hints, not a count.
        self.shared.pool.waker().drain();

        let Some(done_fn) = self.done_fn.as_mut() else {
            return;
        };
        let watcher = &mut self.watcher;
        let destroy_fn = &mut self.destroy_fn;

        let start_time = clock::now_ms();
        let timeslice = self.timeslice_ms;

        for slot in shared.live_slots() {
            let mut flags = slot.flags.lock();
            if !flags.done_pending {
                // Debounced modify with no close-write behind it: reload once
                // the grace window has passed.
                if flags.reload_deadline.is_some_and(|d| d <= start_time) {
                    flags.reload_deadline = None;
                    drop(flags);
                    debug!("file {} modified, delayed reload", slot.path.display());
                    shared.reload(&slot);
                }
                continue;
            }

            flags.done_pending = false;
            if flags.delete_pending {
                // Removal already requested; the destruction pass owns it.
                continue;
            }
            drop(flags);

            let ret = done_fn(ResourceId(slot.id), &mut slot.data.lock());

            let mut flags = slot.flags.lock();
            if ret == -1 && flags.num_loads == 0 {
                // Rejected on first load; a rejected reload keeps the
                // resource around in case it becomes valid again.
                drop(flags);
                remove_slot(&shared, watcher, destroy_fn, slot.id);
                continue;
            }
            flags.num_loads += 1;
            drop(flags);

            arm_watch(watcher, &slot);

            if timeslice > 0 && clock::now_ms() - start_time > timeslice as u64 {
                // Out of budget; the rest is deferred to the next poll.
                break;
            }
        }
    }

    /// Block until any event source has data: a job completed or, with the
    /// `watch` feature, a watched file changed. Pair with `poll`.
    pub fn wait(&self) {
        #[cfg(unix)]
        if let Err(err) = wait_readable(&self.wait_fds) {
            warn!("failed to wait for events: {err}");
        }
        #[cfg(windows)]
        if let Err(err) = wait_signaled(&self.wait_handles) {
            warn!("failed to wait for events: {err}");
        }
    }

    /// File descriptors an application event loop can `select`/`poll` on to
    /// learn that [`poll`](Self::poll) has work to do.
    #[cfg(unix)]
    pub fn wait_fds(&self) -> &[RawFd] {
        &self.wait_fds
    }

    /// Waitable handles for `WaitForMultipleObjects`-style event loops.
    #[cfg(windows)]
    pub fn wait_handles(&self) -> &[RawHandle] {
        &self.wait_handles
    }

    /// Path a resource was registered under.
    pub fn res_name(&self, id: ResourceId) -> Option<PathBuf> {
        self.shared.slot(id.0).map(|slot| slot.path.clone())
    }

    /// Last load result code.
    pub fn res_result(&self, id: ResourceId) -> Option<i32> {
        self.shared.slot(id.0).map(|slot| slot.flags.lock().result)
    }

    /// Completed load count (0 before the first successful load).
    pub fn res_load_count(&self, id: ResourceId) -> Option<u32> {
        self.shared
            .slot(id.0)
            .map(|slot| slot.flags.lock().num_loads)
    }

    /// Clone of the resource's user data.
    pub fn res_data(&self, id: ResourceId) -> Option<D>
    where
        D: Clone,
    {
        self.shared.slot(id.0).map(|slot| slot.data.lock().clone())
    }

    /// Run `f` against the resource's user data. Blocks while a worker is
    /// loading the same resource.
    pub fn with_res_data<R>(&self, id: ResourceId, f: impl FnOnce(&D) -> R) -> Option<R> {
        self.shared.slot(id.0).map(|slot| f(&slot.data.lock()))
    }

    /// As [`with_res_data`](Self::with_res_data), mutably.
    pub fn with_res_data_mut<R>(&self, id: ResourceId, f: impl FnOnce(&mut D) -> R) -> Option<R> {
        self.shared.slot(id.0).map(|slot| f(&mut slot.data.lock()))
    }

    /// Replace the resource's user data.
    pub fn set_res_data(&self, id: ResourceId, data: D) -> Result<()> {
        let slot = self
            .shared
            .slot(id.0)
            .ok_or(ResmanError::UnknownResource(id.0))?;
        *slot.data.lock() = data;
        Ok(())
    }

    /// The worker pool this registry runs on.
    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.shared.pool
    }
}

fn arm_watch<D>(watcher: &mut FileWatcher, slot: &Slot<D>) {
    if slot.flags.lock().watched {
        return;
    }
    match watcher.start_watch(slot.id, &slot.path) {
        Ok(()) => slot.flags.lock().watched = true,
        Err(err) => warn!("failed to watch {}: {err}", slot.path.display()),
    }
}

fn remove_slot<D>(
    shared: &Shared<D>,
    watcher: &mut FileWatcher,
    destroy_fn: &mut Option<Box<DestroyFn<D>>>,
    idx: usize,
) {
    let slot = {
        let mut slots = shared.slots.lock();
        slots.get_mut(idx).and_then(Option::take)
    };
    let Some(slot) = slot else {
        return;
    };
    watcher.stop_watch(idx);
    if let Some(destroy) = destroy_fn.as_mut() {
        destroy(ResourceId(idx), &mut slot.data.lock());
    }
}

impl<D> Drop for Resman<D> {
    fn drop(&mut self) {
        // Let this registry's own in-flight loads return before their
        // resources are destroyed; removal never cancels a running job. The
        // pool is shared, so other registries may keep it busy indefinitely
        // and a pool-wide wait is off the table. The timed wait wakes on any
        // completion and re-checks only our slots.
        loop {
            let busy = self
                .shared
                .slots
                .lock()
                .iter()
                .flatten()
                .any(|slot| slot.flags.lock().pending);
            if !busy {
                break;
            }
            self.shared.pool.timedwait(10);
        }

        let slots: Vec<_> = self.shared.slots.lock().iter().flatten().cloned().collect();
        for slot in slots {
            if let Some(destroy) = self.destroy_fn.as_mut() {
                destroy(ResourceId(slot.id), &mut slot.data.lock());
            }
        }
    }
}

impl<D> fmt::Debug for Resman<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.shared.slots.lock();
        let live = slots.iter().flatten().count();
        f.debug_struct("Resman")
            .field("slots", &slots.len())
            .field("live", &live)
            .field("timeslice_ms", &self.timeslice_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::atomic::AtomicUsize;

    fn quiet_rman() -> Resman<i32> {
        Resman::with_threads(2).unwrap()
    }

    #[test]
    fn basic_load_dispatches_both_stages() {
        let mut rman = quiet_rman();

        let main_thread = std::thread::current().id();
        let load_calls = Arc::new(AtomicUsize::new(0));
        let load_off_main = Arc::new(AtomicBool::new(false));
        let done_calls = Rc::new(Cell::new(0));
        let done_on_main = Rc::new(Cell::new(false));

        {
            let load_calls = Arc::clone(&load_calls);
            let load_off_main = Arc::clone(&load_off_main);
            rman.set_load_fn(move |_path, _id, data| {
                load_calls.fetch_add(1, Ordering::SeqCst);
                load_off_main.store(
                    std::thread::current().id() != main_thread,
                    Ordering::SeqCst,
                );
                *data = 42;
                0
            });
        }
        {
            let done_calls = Rc::clone(&done_calls);
            let done_on_main = Rc::clone(&done_on_main);
            rman.set_done_fn(move |_id, data| {
                assert_eq!(*data, 42);
                done_calls.set(done_calls.get() + 1);
                done_on_main.set(std::thread::current().id() == main_thread);
                0
            });
        }

        let id = rman.add("textures/grid.png", 0);
        rman.wait_all();
        rman.poll();

        assert_eq!(load_calls.load(Ordering::SeqCst), 1);
        assert!(load_off_main.load(Ordering::SeqCst));
        assert_eq!(done_calls.get(), 1);
        assert!(done_on_main.get());
        assert_eq!(rman.res_result(id), Some(0));
        assert_eq!(rman.res_load_count(id), Some(1));
        assert_eq!(rman.res_data(id), Some(42));
    }

    #[test]
    fn add_deduplicates_by_path() {
        let mut rman = quiet_rman();
        let load_calls = Arc::new(AtomicUsize::new(0));
        {
            let load_calls = Arc::clone(&load_calls);
            rman.set_load_fn(move |_, _, _| {
                load_calls.fetch_add(1, Ordering::SeqCst);
                0
            });
        }
        rman.set_done_fn(|_, _| 0);

        let a = rman.add("meshes/ship.obj", 0);
        let b = rman.add("meshes/ship.obj", 0);
        assert_eq!(a, b);

        rman.wait_all();
        rman.poll();
        assert_eq!(load_calls.load(Ordering::SeqCst), 1);
        assert_eq!(rman.find("meshes/ship.obj"), Some(a));
    }

    #[test]
    fn find_without_add_is_none() {
        let rman = quiet_rman();
        assert_eq!(rman.find("nope.dat"), None);
    }

    #[test]
    fn first_load_failure_without_done_removes() {
        let mut rman = quiet_rman();
        rman.set_load_fn(|_, _, _| -1);
        let destroyed = Rc::new(Cell::new(0));
        {
            let destroyed = Rc::clone(&destroyed);
            rman.set_destroy_fn(move |_, _| destroyed.set(destroyed.get() + 1));
        }

        let id = rman.add("broken.dat", 0);
        rman.wait_all();
        rman.poll();
        rman.poll();

        assert_eq!(rman.find("broken.dat"), None);
        assert_eq!(destroyed.get(), 1);
        assert_eq!(rman.res_result(id), None);
    }

    #[test]
    fn done_rejecting_first_load_removes() {
        let mut rman = quiet_rman();
        rman.set_load_fn(|_, _, _| -1);
        rman.set_done_fn(|_, _| -1);
        let destroyed = Rc::new(Cell::new(0));
        {
            let destroyed = Rc::clone(&destroyed);
            rman.set_destroy_fn(move |_, _| destroyed.set(destroyed.get() + 1));
        }

        rman.add("bad.png", 0);
        rman.wait_all();
        rman.poll();

        assert_eq!(rman.find("bad.png"), None);
        assert_eq!(destroyed.get(), 1);
    }

    #[test]
    fn remove_then_poll_vacates_and_reuses_slot() {
        let mut rman = quiet_rman();
        rman.set_load_fn(|_, _, _| 0);
        rman.set_done_fn(|_, _| 0);
        let destroyed = Rc::new(Cell::new(0));
        {
            let destroyed = Rc::clone(&destroyed);
            rman.set_destroy_fn(move |_, _| destroyed.set(destroyed.get() + 1));
        }

        let a = rman.add("a.dat", 0);
        let b = rman.add("b.dat", 0);
        rman.wait_all();
        rman.poll();

        rman.remove(a).unwrap();
        rman.wait_all();
        rman.poll();

        assert_eq!(rman.find("a.dat"), None);
        assert_eq!(destroyed.get(), 1);
        assert_eq!(rman.find("b.dat"), Some(b));

        // The vacated slot is handed to the next add.
        let c = rman.add("c.dat", 0);
        assert_eq!(c, a);
    }

    #[test]
    fn remove_unknown_id_errors() {
        let rman = quiet_rman();
        assert!(matches!(
            rman.remove(ResourceId(7)),
            Err(ResmanError::UnknownResource(7))
        ));
    }

    #[test]
    fn delete_pending_suppresses_done() {
        let mut rman = quiet_rman();
        rman.set_load_fn(|_, _, _| 0);
        let done_calls = Rc::new(Cell::new(0));
        {
            let done_calls = Rc::clone(&done_calls);
            rman.set_done_fn(move |_, _| {
                done_calls.set(done_calls.get() + 1);
                0
            });
        }

        let id = rman.add("gone.dat", 0);
        rman.wait_all();
        // Removed before the done callback ever ran.
        rman.remove(id).unwrap();
        rman.poll();
        rman.poll();

        assert_eq!(done_calls.get(), 0);
        assert_eq!(rman.find("gone.dat"), None);
    }

    #[test]
    fn wait_job_blocks_until_loaded() {
        let mut rman = quiet_rman();
        rman.set_load_fn(|_, _, _| {
            std::thread::sleep(std::time::Duration::from_millis(20));
            0
        });
        rman.set_done_fn(|_, _| 0);

        let id = rman.add("slow.dat", 0);
        rman.wait_job(id);
        rman.poll();
        assert_eq!(rman.res_load_count(id), Some(1));
    }

    #[test]
    fn metadata_accessors() {
        let mut rman = quiet_rman();
        rman.set_load_fn(|_, _, data| {
            *data += 1;
            0
        });
        rman.set_done_fn(|_, _| 0);

        let id = rman.add("meta.dat", 10);
        rman.wait_all();
        rman.poll();

        assert_eq!(rman.res_name(id).as_deref(), Some(Path::new("meta.dat")));
        assert_eq!(rman.res_data(id), Some(11));
        rman.set_res_data(id, 99).unwrap();
        assert_eq!(rman.with_res_data(id, |d| *d), Some(99));
        rman.with_res_data_mut(id, |d| *d = 100);
        assert_eq!(rman.res_data(id), Some(100));

        let missing = ResourceId(42);
        assert_eq!(rman.res_name(missing), None);
        assert_eq!(rman.res_result(missing), None);
        assert!(rman.set_res_data(missing, 0).is_err());
    }

    #[test]
    fn timeslice_option_roundtrip() {
        let mut rman = quiet_rman();
        assert_eq!(rman.get_opt(Opt::Timeslice), DEFAULT_TIMESLICE_MS);
        rman.set_opt(Opt::Timeslice, 0);
        assert_eq!(rman.get_opt(Opt::Timeslice), 0);
    }

    #[test]
    fn drop_runs_destroy_for_live_resources() {
        let destroyed = Rc::new(Cell::new(0));
        {
            let mut rman = quiet_rman();
            rman.set_load_fn(|_, _, _| 0);
            rman.set_done_fn(|_, _| 0);
            let destroyed = Rc::clone(&destroyed);
            rman.set_destroy_fn(move |_, _| destroyed.set(destroyed.get() + 1));

            rman.add("x.dat", 0);
            rman.add("y.dat", 0);
            rman.wait_all();
            rman.poll();
        }
        assert_eq!(destroyed.get(), 2);
    }

    #[test]
    fn drop_does_not_wait_for_other_registries() {
        // Both registries ride the process-shared pool.
        let mut busy: Resman<i32> = Resman::new().unwrap();
        busy.set_load_fn(|_, _, _| {
            std::thread::sleep(std::time::Duration::from_millis(200));
            0
        });
        let idle: Resman<i32> = Resman::new().unwrap();

        busy.add("slow-a.dat", 0);
        busy.add("slow-b.dat", 0);

        // Tearing down a registry with no pending loads of its own must not
        // block on the other registry's reload traffic.
        let start = std::time::Instant::now();
        drop(idle);
        assert!(start.elapsed() < std::time::Duration::from_millis(150));

        busy.wait_all();
    }

    #[test]
    fn env_thread_count_parsing() {
        assert_eq!(env_thread_count(Some("4")), 4);
        assert_eq!(env_thread_count(Some(" 2 ")), 2);

        let auto = crate::pool::num_processors().saturating_sub(1).max(1);
        assert_eq!(env_thread_count(None), auto);
        assert_eq!(env_thread_count(Some("0")), auto);
        assert_eq!(env_thread_count(Some("-3")), auto);
        assert_eq!(env_thread_count(Some("lots")), auto);
    }
}
