//! In-process introspection for live debugging.
//!
//! Two snapshots are available on demand: the call stack of every live
//! thread, and a census of tracked heap values grouped by type. Each comes as
//! a structured report plus a plain-text formatter, so an embedding tool (a
//! debug signal handler, an HTTP debug endpoint) only has to move strings.
//!
//! ```no_run
//! let text = pry::show_threads();
//! eprintln!("{text}");
//!
//! let map = pry::Tracked::new(std::collections::HashMap::<u32, u32>::new());
//! eprintln!("{}", pry::show_heap());
//! drop(map);
//! ```

mod allocator;
mod census;
mod config;
mod error;
mod export;
mod format;
mod registry;
mod sampler;
mod snapshot;
mod source;
mod stack;
mod state;

use {
  backtrace::SymbolName,
  crossbeam_queue::ArrayQueue,
  dashmap::DashMap,
  nohash_hasher::BuildNoHashHasher,
  serde::Serialize,
  std::{
    alloc::{GlobalAlloc, Layout, System},
    any::TypeId,
    collections::HashMap,
    ffi::c_void,
    fmt::{self, Display, Formatter, Write as _},
    fs,
    hash::{Hash, Hasher},
    io::{self, Write},
    mem::size_of_val,
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    sync::{
      Arc, Mutex, MutexGuard, OnceLock, PoisonError,
      atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime},
  },
  tracing::{debug, trace, warn},
};

pub use {
  allocator::{AllocatorStats, CountingAllocator},
  census::{Tracked, track_alloc, track_free},
  config::InspectorConfig,
  error::PryError,
  export::{JsonLinesWriter, ReportStreamWriter},
  format::{format_heap_delta, format_heap_stats, format_thread_stacks},
  registry::{ThreadGuard, ThreadIdent, register_thread, spawn},
  snapshot::{HeapDelta, HeapDeltaRow, HeapReport, HeapTotals, HeapTypeRow},
  stack::{StackFrame, ThreadReport, ThreadSnapshot},
  state::{Inspector, InspectorBuilder},
};

/// Capture the stack of every live thread using the process-wide inspector.
///
/// Other threads are interrupted by a signal to record their stacks; see
/// [`Inspector`] for the `EINTR` this can cause.
#[inline(never)]
#[must_use]
pub fn collect_thread_stacks() -> ThreadReport {
  state::global().collect_thread_stacks()
}

/// Census of every tracked heap value using the process-wide inspector.
#[must_use]
pub fn collect_heap_stats() -> HeapReport {
  state::global().collect_heap_stats()
}

/// Like [`collect_heap_stats`], with the average size of each type filled in.
#[must_use]
pub fn collect_heap_stats_with_averages() -> HeapReport {
  state::global().collect_heap_stats_with_averages()
}

/// Collect and format the thread stacks in one call.
#[inline(never)]
#[must_use]
pub fn show_threads() -> String {
  state::global().show_threads()
}

/// Collect and format the heap census in one call.
#[must_use]
pub fn show_heap() -> String {
  state::global().show_heap()
}
