//! Per-type live object table.
//!
//! Rust has no collector to walk, so objects enter the census when they are
//! created through [`Tracked`] (or the [`track_alloc`] hook) and leave it when
//! dropped. Sizes are shallow: the value's own footprint, not what it points
//! to.

use {super::*, std::borrow::Borrow};

#[derive(Debug)]
struct TypeCounters {
  bytes: AtomicU64,
  count: AtomicU64,
  name: &'static str,
}

impl TypeCounters {
  fn new(name: &'static str) -> Self {
    Self {
      bytes: AtomicU64::new(0),
      count: AtomicU64::new(0),
      name,
    }
  }

  fn on_alloc(&self, bytes: u64) {
    saturating_add(&self.count, 1);
    saturating_add(&self.bytes, bytes);
  }

  /// Returns false when more was released than had been recorded.
  fn on_free(&self, bytes: u64) -> bool {
    let count_ok = saturating_sub(&self.count, 1);
    let bytes_ok = saturating_sub(&self.bytes, bytes);
    count_ok && bytes_ok
  }
}

fn saturating_add(counter: &AtomicU64, amount: u64) {
  let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
    Some(value.saturating_add(amount))
  });
}

fn saturating_sub(counter: &AtomicU64, amount: u64) -> bool {
  let previous = counter
    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
      Some(value.saturating_sub(amount))
    })
    .unwrap_or_else(|value| value);

  previous >= amount
}

/// Live count and bytes of one type at the moment it was read.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct TypeTally {
  pub(crate) bytes: u64,
  pub(crate) count: u64,
  pub(crate) name: &'static str,
}

#[derive(Debug, Default)]
pub(crate) struct Census {
  types: DashMap<TypeId, TypeCounters>,
}

impl Census {
  pub(crate) fn record<T: ?Sized + 'static>(&self, bytes: usize) {
    let bytes = u64::try_from(bytes).unwrap_or(u64::MAX);

    if let Some(counters) = self.types.get(&TypeId::of::<T>()) {
      counters.on_alloc(bytes);
      return;
    }

    self
      .types
      .entry(TypeId::of::<T>())
      .or_insert_with(|| TypeCounters::new(std::any::type_name::<T>()))
      .on_alloc(bytes);
  }

  pub(crate) fn release<T: ?Sized + 'static>(&self, bytes: usize) {
    let bytes = u64::try_from(bytes).unwrap_or(u64::MAX);

    let Some(counters) = self.types.get(&TypeId::of::<T>()) else {
      trace!(
        type_name = std::any::type_name::<T>(),
        "release of a type that was never recorded"
      );
      return;
    };

    if !counters.on_free(bytes) {
      trace!(type_name = counters.name, bytes, "census release saturated");
    }
  }

  /// Tally of every type with live objects, in no particular order.
  #[must_use]
  pub(crate) fn tallies(&self) -> Vec<TypeTally> {
    self
      .types
      .iter()
      .filter_map(|entry| {
        let counters = entry.value();
        let count = counters.count.load(Ordering::Relaxed);
        let bytes = counters.bytes.load(Ordering::Relaxed);

        (count > 0).then_some(TypeTally {
          bytes,
          count,
          name: counters.name,
        })
      })
      .collect()
  }
}

static CENSUS: OnceLock<Census> = OnceLock::new();

pub(crate) fn census() -> &'static Census {
  CENSUS.get_or_init(Census::default)
}

/// Record one live object of type `T` occupying `bytes`.
///
/// Use this for values whose storage is managed elsewhere (arenas, pools,
/// unsized values). Every call should be paired with [`track_free`].
pub fn track_alloc<T: ?Sized + 'static>(bytes: usize) {
  census().record::<T>(bytes);
}

/// Remove one object of type `T` occupying `bytes` from the census.
///
/// Releasing more than was recorded clamps the counters at zero.
pub fn track_free<T: ?Sized + 'static>(bytes: usize) {
  census().release::<T>(bytes);
}

/// Owning heap handle whose value is counted in the heap census for as long
/// as the handle lives.
pub struct Tracked<T: 'static> {
  value: Box<T>,
}

impl<T: 'static> Tracked<T> {
  /// Move `value` to the heap and count it.
  #[must_use]
  pub fn new(value: T) -> Self {
    let value = Box::new(value);
    census().record::<T>(size_of_val(&*value));
    Self { value }
  }

  /// Stop counting the value and hand it back.
  #[must_use]
  pub fn into_inner(self) -> T {
    let this = std::mem::ManuallyDrop::new(self);
    census().release::<T>(size_of_val(&*this.value));

    // SAFETY: `this` is never dropped, so the box is moved out exactly once.
    let value = unsafe { std::ptr::read(&this.value) };
    *value
  }
}

impl<T: 'static> Drop for Tracked<T> {
  fn drop(&mut self) {
    census().release::<T>(size_of_val(&*self.value));
  }
}

impl<T: 'static> Deref for Tracked<T> {
  type Target = T;

  fn deref(&self) -> &T {
    &self.value
  }
}

impl<T: 'static> DerefMut for Tracked<T> {
  fn deref_mut(&mut self) -> &mut T {
    &mut self.value
  }
}

impl<T: 'static> AsRef<T> for Tracked<T> {
  fn as_ref(&self) -> &T {
    &self.value
  }
}

impl<T: 'static> Borrow<T> for Tracked<T> {
  fn borrow(&self) -> &T {
    &self.value
  }
}

impl<T: Clone + 'static> Clone for Tracked<T> {
  fn clone(&self) -> Self {
    Self::new((*self.value).clone())
  }
}

impl<T: Default + 'static> Default for Tracked<T> {
  fn default() -> Self {
    Self::new(T::default())
  }
}

impl<T: fmt::Debug + 'static> fmt::Debug for Tracked<T> {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&*self.value, f)
  }
}

impl<T: Display + 'static> Display for Tracked<T> {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    Display::fmt(&*self.value, f)
  }
}

impl<T: PartialEq + 'static> PartialEq for Tracked<T> {
  fn eq(&self, other: &Self) -> bool {
    *self.value == *other.value
  }
}

impl<T: Eq + 'static> Eq for Tracked<T> {}

impl<T: Hash + 'static> Hash for Tracked<T> {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.value.hash(state);
  }
}

impl<T: 'static> From<T> for Tracked<T> {
  fn from(value: T) -> Self {
    Self::new(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tally<T: ?Sized + 'static>(census: &Census) -> Option<TypeTally> {
    census
      .tallies()
      .into_iter()
      .find(|tally| tally.name == std::any::type_name::<T>())
  }

  #[test]
  fn records_and_releases_per_type() {
    let census = Census::default();
    census.record::<u64>(8);
    census.record::<u64>(8);
    census.record::<String>(24);
    census.release::<u64>(8);

    assert_eq!(
      tally::<u64>(&census),
      Some(TypeTally {
        bytes: 8,
        count: 1,
        name: "u64"
      })
    );
    assert_eq!(tally::<String>(&census).map(|t| t.bytes), Some(24));
  }

  #[test]
  fn types_without_live_objects_are_hidden() {
    let census = Census::default();
    census.record::<u32>(4);
    census.release::<u32>(4);

    assert!(tally::<u32>(&census).is_none());
  }

  #[test]
  fn over_release_clamps_at_zero() {
    let census = Census::default();
    census.record::<u16>(2);
    census.release::<u16>(64);
    census.release::<u16>(2);
    census.release::<[u8]>(1);

    assert!(tally::<u16>(&census).is_none());
    census.record::<u16>(2);
    assert_eq!(tally::<u16>(&census).map(|t| (t.count, t.bytes)), Some((1, 2)));
  }

  #[test]
  fn counters_saturate_instead_of_wrapping() {
    let counter = AtomicU64::new(u64::MAX - 1);
    saturating_add(&counter, 10);
    assert_eq!(counter.load(Ordering::Relaxed), u64::MAX);
  }

  struct OnlyInThisTest([u8; 48]);

  #[test]
  fn tracked_handle_counts_while_alive() {
    let name = std::any::type_name::<OnlyInThisTest>();
    let live = || {
      census()
        .tallies()
        .into_iter()
        .find(|tally| tally.name == name)
        .map(|tally| (tally.count, tally.bytes))
    };

    let first = Tracked::new(OnlyInThisTest([0; 48]));
    let second = Tracked::new(OnlyInThisTest(first.0));
    assert_eq!(live(), Some((2, 96)));

    let inner = second.into_inner();
    assert_eq!(inner.0.len(), 48);
    assert_eq!(live(), Some((1, 48)));

    drop(first);
    assert_eq!(live(), None);
  }
}
