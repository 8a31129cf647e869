//! Worker thread pool with completion accounting.
//!
//! A FIFO queue of boxed jobs serviced by a fixed set of OS threads, plus the
//! bookkeeping the registry needs on top of plain job execution: queued and
//! active counts, blocking and timed waits, batch submission, and a
//! waker-backed completion notifier that integrates with external event
//! loops. Registries share one pool per process by cloning an
//! `Arc<ThreadPool>`; the pool shuts down when the last reference drops.

use std::collections::VecDeque;
#[cfg(unix)]
use std::os::fd::RawFd;
#[cfg(windows)]
use std::os::windows::io::RawHandle;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::debug;

use crate::error::{ResmanError, Result};
use crate::waker::Waker;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct WorkItem {
    work: Callback,
    /// Runs on the same worker immediately after `work`, if present.
    done: Option<Callback>,
}

struct PoolState {
    queue: VecDeque<WorkItem>,
    /// Workers currently executing a job (not sleeping).
    nactive: usize,
    should_quit: bool,
    /// Suppresses worker wakeups between `begin_batch` and `end_batch`.
    in_batch: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    job_done: Condvar,
    waker: Waker,
}

/// Fixed-size worker pool. Dropping the handle joins every worker after it
/// finishes its current job; queued jobs that never started are discarded.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    num_threads: usize,
}

impl ThreadPool {
    /// Spawn a pool with `num_threads` workers; `0` means one per processor.
    pub fn new(num_threads: usize) -> Result<Self> {
        let num_threads = if num_threads == 0 {
            num_processors()
        } else {
            num_threads
        };

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                nactive: 0,
                should_quit: false,
                in_batch: false,
            }),
            work_available: Condvar::new(),
            job_done: Condvar::new(),
            waker: Waker::new().map_err(ResmanError::Io)?,
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let worker_shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("resman-worker-{i}"))
                .spawn(move || worker_loop(&worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    // Partial startup: tear down what already runs.
                    shared.state.lock().should_quit = true;
                    shared.work_available.notify_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(ResmanError::PoolStartup(err));
                }
            }
        }

        Ok(Self {
            shared,
            workers,
            num_threads,
        })
    }

    /// Number of worker threads.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Queue a job. Wakes a worker immediately unless inside a batch.
    pub fn enqueue<W>(&self, work: W)
    where
        W: FnOnce() + Send + 'static,
    {
        self.push(WorkItem {
            work: Box::new(work),
            done: None,
        });
    }

    /// Queue a job with a completion callback that runs on the worker right
    /// after the job itself.
    pub fn enqueue_with_done<W, F>(&self, work: W, done: F)
    where
        W: FnOnce() + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.push(WorkItem {
            work: Box::new(work),
            done: Some(Box::new(done)),
        });
    }

    fn push(&self, item: WorkItem) {
        let in_batch;
        {
            let mut state = self.shared.state.lock();
            state.queue.push_back(item);
            in_batch = state.in_batch;
        }
        if !in_batch {
            self.shared.work_available.notify_all();
        }
    }

    /// Stop waking workers on enqueue until [`end_batch`](Self::end_batch).
    /// Lets a burst of jobs be queued without the first few workers racing
    /// the submitter for the queue lock.
    pub fn begin_batch(&self) {
        self.shared.state.lock().in_batch = true;
    }

    /// End a batch and wake the workers for everything queued meanwhile.
    pub fn end_batch(&self) {
        self.shared.state.lock().in_batch = false;
        self.shared.work_available.notify_all();
    }

    /// Drop every queued job. Jobs already running are not cancelled.
    pub fn clear(&self) {
        self.shared.state.lock().queue.clear();
    }

    /// Number of jobs waiting in the queue.
    pub fn queued_jobs(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Number of jobs currently executing on a worker.
    pub fn active_jobs(&self) -> usize {
        self.shared.state.lock().nactive
    }

    /// Queued plus active jobs.
    pub fn pending_jobs(&self) -> usize {
        let state = self.shared.state.lock();
        state.queue.len() + state.nactive
    }

    /// Block until no job is queued or running.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while state.nactive > 0 || !state.queue.is_empty() {
            self.shared.job_done.wait(&mut state);
        }
    }

    /// Block until the pending count drops to `target` or below. To wait for
    /// a single completion: `wait_pending(pending_jobs() - 1)`.
    pub fn wait_pending(&self, target: usize) {
        let mut state = self.shared.state.lock();
        while state.queue.len() + state.nactive > target {
            self.shared.job_done.wait(&mut state);
        }
    }

    /// As [`wait`](Self::wait), giving up after `timeout_ms`. Returns the
    /// milliseconds actually spent waiting.
    pub fn timedwait(&self, timeout_ms: u64) -> u64 {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(timeout_ms);

        let mut state = self.shared.state.lock();
        while state.nactive > 0 || !state.queue.is_empty() {
            if self
                .shared
                .job_done
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        drop(state);

        start.elapsed().as_millis() as u64
    }

    /// Readable end of the completion pipe: one byte is written per finished
    /// job. Drain it with nonblocking reads whenever it becomes readable.
    #[cfg(unix)]
    pub fn wait_fd(&self) -> RawFd {
        self.shared.waker.raw_fd()
    }

    /// Auto-reset event signalled once per finished job (signals coalesce).
    #[cfg(windows)]
    pub fn wait_handle(&self) -> RawHandle {
        self.shared.waker.raw_handle()
    }

    pub(crate) fn waker(&self) -> &Waker {
        &self.shared.waker
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.clear();
        self.shared.state.lock().should_quit = true;
        self.shared.work_available.notify_all();

        debug!(
            "thread pool: waiting for {} worker threads to stop",
            self.num_threads
        );
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }

        // Wake anyone blocked in a wait_* call or on the notifier.
        self.shared.job_done.notify_all();
        self.shared.waker.signal();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads)
            .field("queued", &state.queue.len())
            .field("active", &state.nactive)
            .finish()
    }
}

fn worker_loop(shared: &PoolShared) {
    let mut state = shared.state.lock();
    while !state.should_quit {
        if state.queue.is_empty() {
            shared.work_available.wait(&mut state);
            if state.should_quit {
                break;
            }
        }

        while !state.should_quit {
            let Some(job) = state.queue.pop_front() else {
                break;
            };
            state.nactive += 1;
            drop(state);

            (job.work)();
            if let Some(done) = job.done {
                done();
            }

            state = shared.state.lock();
            // Everyone interested learns we finished this job.
            shared.job_done.notify_all();
            shared.waker.signal();
            state.nactive -= 1;
        }
    }
}

/// Number of processors on the system; individual cores count as processors.
pub fn num_processors() -> usize {
    num_cpus::get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn auto_thread_count() {
        let pool = ThreadPool::new(0).unwrap();
        assert!(pool.num_threads() >= 1);
    }

    #[test]
    fn runs_enqueued_jobs() {
        let pool = ThreadPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
        assert_eq!(pool.pending_jobs(), 0);
    }

    #[test]
    fn done_runs_after_work() {
        let pool = ThreadPool::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let work_order = Arc::clone(&order);
        let done_order = Arc::clone(&order);
        pool.enqueue_with_done(
            move || work_order.lock().push("work"),
            move || done_order.lock().push("done"),
        );
        pool.wait();
        assert_eq!(*order.lock(), vec!["work", "done"]);
    }

    #[test]
    fn batch_defers_wakeup() {
        let pool = ThreadPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        // Batching suppresses wakeups; it does not stop a worker that has not
        // parked yet from grabbing the queue. Let the workers reach their
        // condvar first.
        std::thread::sleep(Duration::from_millis(50));

        pool.begin_batch();
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.active_jobs(), 0);
        assert_eq!(pool.queued_jobs(), 100);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        pool.end_batch();
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn clear_discards_queued_jobs() {
        let pool = ThreadPool::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        std::thread::sleep(Duration::from_millis(50));
        pool.begin_batch();
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.clear();
        pool.end_batch();
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wait_pending_target() {
        let pool = ThreadPool::new(1).unwrap();
        for _ in 0..4 {
            pool.enqueue(|| std::thread::sleep(Duration::from_millis(10)));
        }
        pool.wait_pending(2);
        assert!(pool.pending_jobs() <= 2);
        pool.wait();
    }

    #[test]
    fn timedwait_gives_up() {
        let pool = ThreadPool::new(1).unwrap();
        pool.enqueue(|| std::thread::sleep(Duration::from_millis(300)));
        let elapsed = pool.timedwait(30);
        assert!(elapsed >= 30);
        pool.wait();
    }

    #[cfg(unix)]
    #[test]
    fn completion_signals_wait_fd() {
        use crate::waker::wait_readable;

        let pool = ThreadPool::new(1).unwrap();
        let fd = pool.wait_fd();
        pool.enqueue(|| {});
        pool.wait();
        wait_readable(&[fd]).unwrap();
        pool.waker().drain();
    }

    #[test]
    fn num_processors_positive() {
        assert!(num_processors() >= 1);
    }
}
