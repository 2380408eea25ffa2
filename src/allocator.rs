use super::*;

static ACTIVE: AtomicBool = AtomicBool::new(false);
static LIVE_ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static LIVE_BYTES: AtomicU64 = AtomicU64::new(0);
static TOTAL_ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static TOTAL_BYTES: AtomicU64 = AtomicU64::new(0);

/// Global allocator wrapper that keeps process-wide allocation totals.
///
/// The counts are untyped; they show how much of the heap the typed census
/// does not cover.
///
/// ```no_run
/// #[global_allocator]
/// static ALLOC: pry::CountingAllocator = pry::CountingAllocator::system();
/// ```
#[derive(Debug, Default)]
pub struct CountingAllocator<A = System> {
  inner: A,
}

impl CountingAllocator<System> {
  #[must_use]
  pub const fn system() -> Self {
    Self { inner: System }
  }
}

impl<A> CountingAllocator<A> {
  #[must_use]
  pub const fn new(inner: A) -> Self {
    Self { inner }
  }
}

fn on_allocation(size: usize) {
  let size = size as u64;
  ACTIVE.store(true, Ordering::Relaxed);
  LIVE_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
  LIVE_BYTES.fetch_add(size, Ordering::Relaxed);
  TOTAL_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
  TOTAL_BYTES.fetch_add(size, Ordering::Relaxed);
}

fn on_deallocation(size: usize) {
  let size = size as u64;
  let _ = LIVE_ALLOCATIONS
    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
      Some(value.saturating_sub(1))
    });
  let _ = LIVE_BYTES.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
    Some(value.saturating_sub(size))
  });
}

// SAFETY: every call is forwarded unchanged to the wrapped allocator; the
// bookkeeping only touches atomics and never allocates.
unsafe impl<A: GlobalAlloc> GlobalAlloc for CountingAllocator<A> {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.inner.alloc(layout) };
    if !ptr.is_null() {
      on_allocation(layout.size());
    }
    ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.inner.alloc_zeroed(layout) };
    if !ptr.is_null() {
      on_allocation(layout.size());
    }
    ptr
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    on_deallocation(layout.size());
    unsafe { self.inner.dealloc(ptr, layout) };
  }

  unsafe fn realloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
    new_size: usize,
  ) -> *mut u8 {
    let result = unsafe { self.inner.realloc(ptr, layout, new_size) };
    if !result.is_null() {
      on_deallocation(layout.size());
      on_allocation(new_size);
    }
    result
  }
}

/// Process-wide allocator totals, present when [`CountingAllocator`] is the
/// global allocator.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct AllocatorStats {
  pub live_allocations: u64,
  pub live_bytes: u64,
  pub total_allocations: u64,
  pub total_bytes: u64,
}

impl AllocatorStats {
  /// Totals at this instant, or `None` if no allocation has gone through a
  /// [`CountingAllocator`].
  #[must_use]
  pub fn current() -> Option<Self> {
    if !ACTIVE.load(Ordering::Relaxed) {
      return None;
    }

    Some(Self {
      live_allocations: LIVE_ALLOCATIONS.load(Ordering::Relaxed),
      live_bytes: LIVE_BYTES.load(Ordering::Relaxed),
      total_allocations: TOTAL_ALLOCATIONS.load(Ordering::Relaxed),
      total_bytes: TOTAL_BYTES.load(Ordering::Relaxed),
    })
  }
}
