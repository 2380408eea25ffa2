use {super::*, std::marker::PhantomData};

/// Raw bit pattern of an OS thread identifier.
///
/// Some identifier sources are signed (`pid_t` on Linux); they are
/// reinterpreted at pointer width so the id always renders as unsigned hex.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadIdent(usize);

impl ThreadIdent {
  #[must_use]
  pub const fn as_raw(self) -> usize {
    self.0
  }

  /// Identifier of the calling thread.
  #[must_use]
  pub fn current() -> Self {
    current_ident()
  }

  #[must_use]
  pub const fn from_raw(bits: usize) -> Self {
    Self(bits)
  }

  #[must_use]
  pub const fn from_signed(raw: isize) -> Self {
    Self(raw as usize)
  }
}

impl Display for ThreadIdent {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{:x}", self.0)
  }
}

impl Serialize for ThreadIdent {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.collect_str(self)
  }
}

impl nohash_hasher::IsEnabled for ThreadIdent {}

#[cfg(target_os = "linux")]
fn current_ident() -> ThreadIdent {
  // SAFETY: gettid has no preconditions and cannot fail.
  let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::pid_t;
  ThreadIdent::from_signed(tid as isize)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn current_ident() -> ThreadIdent {
  // SAFETY: pthread_self has no preconditions and cannot fail.
  let id = unsafe { libc::pthread_self() };
  ThreadIdent::from_raw(id as usize)
}

#[cfg(not(unix))]
fn current_ident() -> ThreadIdent {
  static NEXT: AtomicUsize = AtomicUsize::new(1);

  thread_local! {
    static IDENT: usize = NEXT.fetch_add(1, Ordering::Relaxed);
  }

  IDENT.with(|ident| ThreadIdent::from_raw(*ident))
}

/// Name the OS knows the thread by, for threads that never registered.
///
/// On Linux this is the `comm` entry, which std sets for named threads and
/// truncates to 15 bytes.
#[cfg(target_os = "linux")]
pub(crate) fn os_thread_name(ident: ThreadIdent) -> Option<String> {
  let path = format!("/proc/self/task/{}/comm", ident.as_raw() as libc::pid_t);

  match fs::read_to_string(&path) {
    Ok(comm) => {
      let name = comm.trim_end_matches('\n');
      (!name.is_empty()).then(|| name.to_string())
    }
    Err(err) => {
      trace!(thread = %ident, %err, "no comm entry");
      None
    }
  }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn os_thread_name(ident: ThreadIdent) -> Option<String> {
  (ident == ThreadIdent::current())
    .then(|| thread::current().name().map(str::to_string))
    .flatten()
}

/// Metadata a thread registered about itself.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct ThreadInfo {
  pub(crate) daemon: bool,
  pub(crate) name: String,
}

pub(crate) type Registry =
  HashMap<ThreadIdent, ThreadInfo, BuildNoHashHasher<ThreadIdent>>;

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn lock_registry() -> MutexGuard<'static, Registry> {
  REGISTRY
    .get_or_init(|| Mutex::new(Registry::default()))
    .lock()
    .unwrap_or_else(PoisonError::into_inner)
}

/// Copy of the registry at this instant.
pub(crate) fn registered_threads() -> Registry {
  lock_registry().clone()
}

/// Deregisters the thread that created it when dropped.
///
/// The guard is tied to its thread and cannot be sent elsewhere.
#[derive(Debug)]
#[must_use = "the thread is deregistered as soon as the guard is dropped"]
pub struct ThreadGuard {
  ident: ThreadIdent,
  _not_send: PhantomData<*const ()>,
}

impl ThreadGuard {
  #[must_use]
  pub fn ident(&self) -> ThreadIdent {
    self.ident
  }
}

impl Drop for ThreadGuard {
  fn drop(&mut self) {
    lock_registry().remove(&self.ident);
  }
}

/// Record the calling thread's name and daemon flag for thread reports.
///
/// Registering again from the same thread replaces the earlier entry.
pub fn register_thread(name: impl Into<String>, daemon: bool) -> ThreadGuard {
  let ident = current_ident();
  let info = ThreadInfo {
    daemon,
    name: name.into(),
  };

  if let Some(previous) = lock_registry().insert(ident, info) {
    debug!(thread = %ident, previous = %previous.name, "thread re-registered");
  }

  ThreadGuard {
    ident,
    _not_send: PhantomData,
  }
}

/// Spawn a named thread that stays registered for as long as it runs.
///
/// # Errors
///
/// Returns the error from [`std::thread::Builder::spawn`] if the OS refuses
/// to create the thread.
pub fn spawn<F, T>(
  name: impl Into<String>,
  daemon: bool,
  f: F,
) -> io::Result<thread::JoinHandle<T>>
where
  F: FnOnce() -> T + Send + 'static,
  T: Send + 'static,
{
  let name = name.into();

  thread::Builder::new().name(name.clone()).spawn(move || {
    let _guard = register_thread(name, daemon);
    f()
  })
}
