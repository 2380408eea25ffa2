//! Raw stack capture.
//!
//! The calling thread walks its own stack directly. Every other thread is
//! sent the capture signal and records its instruction pointers from inside
//! the handler into a preallocated slot. Symbolication happens later on the
//! collecting thread, never in the handler.

use super::*;

/// Upper bound on instruction pointers recorded per thread, before internal
/// frames are stripped.
const MAX_CAPTURE_FRAMES: usize = 512;

/// How the stack was captured, which decides which leading frames belong to
/// the capture machinery.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum CaptureOrigin {
  /// Walked by the thread itself, from inside the collector.
  Direct,
  /// Walked from inside the capture signal handler.
  Signal,
}

/// Unsymbolicated stack of one thread, innermost frame first.
#[derive(Debug, Clone)]
pub(crate) struct RawStack {
  pub(crate) ident: ThreadIdent,
  pub(crate) ips: Vec<usize>,
  pub(crate) origin: CaptureOrigin,
}

/// Walk the calling thread's own stack.
#[inline(never)]
pub(crate) fn capture_current() -> RawStack {
  let mut ips = Vec::with_capacity(64);

  backtrace::trace(|frame| {
    ips.push(frame.ip() as usize);
    ips.len() < MAX_CAPTURE_FRAMES
  });

  RawStack {
    ident: ThreadIdent::current(),
    ips,
    origin: CaptureOrigin::Direct,
  }
}

/// Captures other threads' stacks by signalling them one at a time.
#[derive(Debug)]
pub(crate) struct SignalSampler {
  signal: i32,
  timeout: Duration,
}

#[cfg(target_os = "linux")]
mod imp {
  use {
    super::*,
    std::{mem, ptr},
  };

  /// Shared between the collector and the signal handler. Only atomics and a
  /// preallocated lock-free queue, so the handler never allocates or locks.
  struct CaptureSlot {
    done: AtomicBool,
    in_handler: AtomicUsize,
    ips: ArrayQueue<usize>,
    target: AtomicUsize,
    truncated: AtomicBool,
  }

  /// Raw id of no thread; real tids are always positive.
  const IDLE: usize = 0;

  static SLOT: OnceLock<CaptureSlot> = OnceLock::new();
  static INSTALLED_SIGNAL: Mutex<Option<i32>> = Mutex::new(None);
  static CAPTURE_LOCK: Mutex<()> = Mutex::new(());

  fn slot() -> &'static CaptureSlot {
    SLOT.get_or_init(|| CaptureSlot {
      done: AtomicBool::new(false),
      in_handler: AtomicUsize::new(0),
      ips: ArrayQueue::new(MAX_CAPTURE_FRAMES),
      target: AtomicUsize::new(IDLE),
      truncated: AtomicBool::new(false),
    })
  }

  extern "C" fn on_capture_signal(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut c_void,
  ) {
    let Some(slot) = SLOT.get() else {
      return;
    };

    slot.in_handler.fetch_add(1, Ordering::SeqCst);

    // SAFETY: errno is thread-local and the location is always valid.
    let saved_errno = unsafe { *libc::__errno_location() };

    let own = ThreadIdent::current().as_raw();

    if slot.target.load(Ordering::SeqCst) == own
      && !slot.done.load(Ordering::Acquire)
    {
      // SAFETY: only the targeted thread walks its stack, and the collector
      // holds the capture lock for the whole exchange.
      unsafe {
        backtrace::trace_unsynchronized(|frame| {
          if slot.ips.push(frame.ip() as usize).is_err() {
            slot.truncated.store(true, Ordering::Relaxed);
            return false;
          }
          true
        });
      }

      slot.done.store(true, Ordering::Release);
    }

    // SAFETY: see above.
    unsafe { *libc::__errno_location() = saved_errno };

    slot.in_handler.fetch_sub(1, Ordering::SeqCst);
  }

  impl SignalSampler {
    pub(crate) fn install(
      signal: i32,
      timeout: Duration,
    ) -> Result<Self, PryError> {
      let mut installed = INSTALLED_SIGNAL
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

      match *installed {
        Some(existing) if existing == signal => {
          return Ok(Self { signal, timeout });
        }
        Some(_) => return Err(PryError::SignalConflict { signal }),
        None => {}
      }

      let _ = slot();

      // SAFETY: both sigaction structs are fully initialised before use and
      // the handler only touches async-signal-safe state.
      unsafe {
        let mut previous: libc::sigaction = mem::zeroed();
        if libc::sigaction(signal, ptr::null(), &mut previous) != 0 {
          return Err(PryError::SignalInstall {
            signal,
            source: io::Error::last_os_error(),
          });
        }

        if previous.sa_sigaction != libc::SIG_DFL
          && previous.sa_sigaction != libc::SIG_IGN
        {
          return Err(PryError::SignalConflict { signal });
        }

        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = on_capture_signal as *const () as usize;
        // SA_RESTART does not cover every call; epoll_wait, poll and
        // nanosleep in the target thread still see EINTR.
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);

        if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
          return Err(PryError::SignalInstall {
            signal,
            source: io::Error::last_os_error(),
          });
        }
      }

      debug!(signal, "installed stack capture handler");
      *installed = Some(signal);

      Ok(Self { signal, timeout })
    }

    /// Stacks of every live thread in the process, in `/proc` order.
    #[inline(never)]
    pub(crate) fn capture_all(&self) -> Vec<RawStack> {
      let _capture =
        CAPTURE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

      let own = ThreadIdent::current();
      let slot = slot();
      let mut stacks = Vec::new();
      let mut captured_self = false;

      if slot.in_handler.load(Ordering::SeqCst) != 0 {
        warn!("a previous capture handler never returned; skipping other threads");
        stacks.push(capture_current());
        return stacks;
      }

      for ident in live_threads() {
        if ident == own {
          stacks.push(capture_current());
          captured_self = true;
          continue;
        }

        match self.capture_thread(slot, ident) {
          Capture::Stack(stack) => stacks.push(stack),
          Capture::NoAnswer => {}
          Capture::Stuck => {
            warn!(thread = %ident, "capture handler did not return; stopping");
            break;
          }
        }
      }

      if !captured_self {
        stacks.push(capture_current());
      }

      stacks
    }

    fn capture_thread(
      &self,
      slot: &CaptureSlot,
      ident: ThreadIdent,
    ) -> Capture {
      while slot.ips.pop().is_some() {}
      slot.truncated.store(false, Ordering::Relaxed);
      slot.done.store(false, Ordering::SeqCst);
      slot.target.store(ident.as_raw(), Ordering::SeqCst);

      let answered = send_signal(ident, self.signal)
        && wait_until(self.timeout, || slot.done.load(Ordering::Acquire));

      slot.target.store(IDLE, Ordering::SeqCst);

      if !wait_until(self.timeout, || {
        slot.in_handler.load(Ordering::SeqCst) == 0
      }) {
        return Capture::Stuck;
      }

      if !answered {
        debug!(thread = %ident, "thread did not answer the capture signal");
        return Capture::NoAnswer;
      }

      let mut ips = Vec::with_capacity(slot.ips.len());
      while let Some(ip) = slot.ips.pop() {
        ips.push(ip);
      }

      if slot.truncated.load(Ordering::Relaxed) {
        trace!(thread = %ident, frames = ips.len(), "stack truncated");
      }

      Capture::Stack(RawStack {
        ident,
        ips,
        origin: CaptureOrigin::Signal,
      })
    }
  }

  enum Capture {
    NoAnswer,
    Stack(RawStack),
    Stuck,
  }

  fn live_threads() -> Vec<ThreadIdent> {
    let entries = match fs::read_dir("/proc/self/task") {
      Ok(entries) => entries,
      Err(err) => {
        warn!(%err, "cannot enumerate threads");
        return Vec::new();
      }
    };

    entries
      .filter_map(Result::ok)
      .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
      .map(|tid| ThreadIdent::from_signed(tid as isize))
      .collect()
  }

  fn send_signal(ident: ThreadIdent, signal: i32) -> bool {
    // SAFETY: tgkill only delivers a signal; a stale tid yields ESRCH.
    let result = unsafe {
      libc::syscall(
        libc::SYS_tgkill,
        libc::c_long::from(libc::getpid()),
        ident.as_raw() as libc::c_long,
        libc::c_long::from(signal),
      )
    };

    if result != 0 {
      trace!(thread = %ident, err = %io::Error::last_os_error(), "tgkill failed");
    }

    result == 0
  }

  fn wait_until(timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
      if ready() {
        return true;
      }
      if Instant::now() >= deadline {
        return false;
      }
      thread::sleep(Duration::from_micros(100));
    }
  }
}

#[cfg(not(target_os = "linux"))]
impl SignalSampler {
  pub(crate) fn install(
    _signal: i32,
    _timeout: Duration,
  ) -> Result<Self, PryError> {
    Err(PryError::Unsupported)
  }

  #[inline(never)]
  pub(crate) fn capture_all(&self) -> Vec<RawStack> {
    vec![capture_current()]
  }
}

impl SignalSampler {
  #[must_use]
  pub(crate) fn signal(&self) -> i32 {
    self.signal
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn direct_capture_records_frames() {
    let stack = capture_current();

    assert_eq!(stack.origin, CaptureOrigin::Direct);
    assert_eq!(stack.ident, ThreadIdent::current());
    assert!(!stack.ips.is_empty());
    assert!(stack.ips.len() <= MAX_CAPTURE_FRAMES);
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn captures_a_parked_thread() {
    use std::sync::mpsc;

    let sampler = SignalSampler::install(
      libc::SIGPROF,
      Duration::from_millis(500),
    )
    .expect("install handler");

    let (ident_tx, ident_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
      ident_tx.send(ThreadIdent::current()).expect("send ident");
      let _ = release_rx.recv();
    });
    let ident = ident_rx.recv().expect("receive ident");

    let stacks = sampler.capture_all();
    release_tx.send(()).expect("release thread");
    handle.join().expect("join thread");

    let own = ThreadIdent::current();
    assert!(stacks.iter().any(|stack| stack.ident == own
      && stack.origin == CaptureOrigin::Direct));

    let parked = stacks
      .iter()
      .find(|stack| stack.ident == ident)
      .expect("parked thread should answer");
    assert_eq!(parked.origin, CaptureOrigin::Signal);
    assert!(!parked.ips.is_empty());
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn reinstalling_a_different_signal_conflicts() {
    let _ = SignalSampler::install(libc::SIGPROF, Duration::from_millis(10))
      .expect("install handler");

    let err = SignalSampler::install(libc::SIGUSR2, Duration::from_millis(10))
      .expect_err("second signal must be rejected");
    assert!(matches!(err, PryError::SignalConflict { signal } if signal == libc::SIGUSR2));
  }
}
