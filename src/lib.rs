//! # coalescer
//!
//! This crate coalesces concurrent calls for the same key into a single
//! shared computation: at most one computation per key is in flight at any
//! moment, and every caller that requests that key while it is running
//! receives a clone of the one computation's output instead of triggering a
//! duplicate. This is the classic defense against thundering-herd
//! recomputation, e.g. many tasks simultaneously missing a cache for the same
//! key and all recomputing it.
//!
//! It exposes an async API and has no opinion about the runtime; the tests
//! use `tokio`.
//!
//! Results are shared only while the call is in flight. Once a computation
//! completes its key is released, and the next call for that key computes
//! again. Caching, TTLs and retries are left to the caller.
//!
//! ## Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use coalescer::Group;
//! use futures_util::future;
//!
//! async fn load_config(runs: &AtomicUsize) -> u32 {
//!     runs.fetch_add(1, Ordering::SeqCst);
//!     42
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let runs = AtomicUsize::new(0);
//! let group = Group::new();
//!
//! // The first call starts the computation; the second joins it.
//! let first = group.execute(&"config", || load_config(&runs));
//! let second = group.execute(&"config", || load_config(&runs));
//!
//! let ((value1, joined1), (value2, joined2)) = future::join(first, second).await;
//! assert_eq!((value1, joined1), (42, false));
//! assert_eq!((value2, joined2), (42, true));
//! assert_eq!(runs.load(Ordering::SeqCst), 1);
//! # }
//! ```

mod group;

pub use group::Group;
