//! Asynchronous resource data-file manager.
//!
//! Applications reference data files by path; the registry loads and parses
//! them on background worker threads, invokes a done callback on the polling
//! thread when each load completes, and reloads watched files automatically
//! when they change on disk. The split between a background `load` and a
//! polling-thread `done` exists for artifacts that must be finalized on a
//! specific thread, such as GPU uploads from a render loop, but nothing in
//! the crate knows about file formats or GPUs: the application supplies all
//! three callbacks.
//!
//! ```no_run
//! use resman_core::Resman;
//!
//! # fn main() -> resman_core::Result<()> {
//! let mut rman: Resman<Vec<u8>> = Resman::new()?;
//!
//! // Runs on a worker thread.
//! rman.set_load_fn(|path, _id, data| match std::fs::read(path) {
//!     Ok(bytes) => {
//!         *data = bytes;
//!         0
//!     }
//!     Err(_) => -1,
//! });
//!
//! // Runs on the thread that calls poll().
//! rman.set_done_fn(|id, data| {
//!     println!("resource {id}: {} bytes ready", data.len());
//!     0
//! });
//!
//! let _texture = rman.add("assets/texture.png", Vec::new());
//! for _ in 0..3 {
//!     rman.wait(); // block until a load completes or a file changes
//!     rman.poll(); // dispatch callbacks, consume file events
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Reloads follow editor save patterns: an immediate reload on
//! close-after-write, a short debounce window for writers that never close,
//! and watch re-arming when a file is replaced by rename.

pub mod pool;

mod clock;
mod error;
mod registry;
mod waker;
mod watch;

pub use error::{ResmanError, Result};
pub use pool::ThreadPool;
pub use registry::{DEFAULT_TIMESLICE_MS, LoadFn, Opt, Resman, ResourceId};
