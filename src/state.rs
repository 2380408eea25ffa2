use {
  super::*,
  census::census,
  registry::{os_thread_name, registered_threads},
  sampler::{RawStack, SignalSampler},
  snapshot::HEAP_CAVEAT,
  stack::FrameResolver,
};

/// Thin builder that customizes `InspectorConfig` without exposing all knobs
/// up front.
#[derive(Debug, Default)]
pub struct InspectorBuilder {
  config: InspectorConfig,
}

impl InspectorBuilder {
  #[must_use]
  pub fn abbreviation_markers<I, S>(mut self, markers: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.config.abbreviation_markers =
      markers.into_iter().map(Into::into).collect();
    self
  }

  #[must_use]
  pub fn capture_signal(mut self, signal: i32) -> Self {
    self.config.capture_signal = signal;
    self
  }

  /// Install the capture handler and build the inspector.
  ///
  /// # Errors
  ///
  /// Returns a `PryError` if other threads cannot be captured on this
  /// platform, or if the capture signal cannot be claimed.
  pub fn finish(self) -> Result<Inspector, PryError> {
    Inspector::with_config(self.config)
  }

  #[must_use]
  pub fn heap_averages(mut self, enabled: bool) -> Self {
    self.config.heap_averages = enabled;
    self
  }

  #[must_use]
  pub fn heap_totals(mut self, enabled: bool) -> Self {
    self.config.heap_totals = enabled;
    self
  }

  #[must_use]
  pub fn include_source(mut self, enabled: bool) -> Self {
    self.config.include_source = enabled;
    self
  }

  #[must_use]
  pub fn max_stack_depth(mut self, depth: u16) -> Self {
    self.config.max_stack_depth = depth;
    self
  }

  #[must_use]
  pub fn new() -> Self {
    Self {
      config: InspectorConfig::default(),
    }
  }

  #[must_use]
  pub fn signal_timeout(mut self, timeout: Duration) -> Self {
    self.config.signal_timeout = timeout;
    self
  }

  #[must_use]
  pub fn with_config(mut self, config: InspectorConfig) -> Self {
    self.config = config;
    self
  }
}

#[derive(Debug)]
struct InspectorInner {
  config: InspectorConfig,
  sampler: Option<SignalSampler>,
}

/// Entry point for taking thread and heap reports.
///
/// Cloning is cheap; clones share the configuration and the installed
/// capture handler.
///
/// Capturing other threads interrupts them with the capture signal. The
/// handler is installed with `SA_RESTART`, but calls the kernel never
/// restarts (`epoll_wait`, `poll`, `nanosleep`, `sigtimedwait` and the like)
/// still return `EINTR` in the interrupted thread. Code running in an
/// inspected process must retry on `EINTR`.
#[derive(Clone, Debug)]
pub struct Inspector {
  inner: Arc<InspectorInner>,
}

impl Inspector {
  #[must_use]
  pub fn builder() -> InspectorBuilder {
    InspectorBuilder::new()
  }

  #[inline(never)]
  fn capture(&self) -> ThreadReport {
    let stacks = match &self.inner.sampler {
      Some(signals) => signals.capture_all(),
      None => vec![sampler::capture_current()],
    };

    self.join(&stacks)
  }

  /// The signal used to capture other threads, if any.
  #[must_use]
  pub fn capture_signal(&self) -> Option<i32> {
    self.inner.sampler.as_ref().map(SignalSampler::signal)
  }

  /// Census of every tracked heap value, shaped by the configuration.
  #[must_use]
  pub fn collect_heap_stats(&self) -> HeapReport {
    self.heap_report(self.inner.config.heap_averages)
  }

  #[must_use]
  pub fn collect_heap_stats_with_averages(&self) -> HeapReport {
    self.heap_report(true)
  }

  /// Stacks of every live thread, sorted by name.
  ///
  /// Names come from [`register_thread`] when the thread registered, and
  /// from the OS otherwise. Every other thread is interrupted by the capture
  /// signal, which can make its blocking calls fail with `EINTR`.
  #[inline(never)]
  #[must_use]
  pub fn collect_thread_stacks(&self) -> ThreadReport {
    self.capture()
  }

  #[must_use]
  pub fn config(&self) -> &InspectorConfig {
    &self.inner.config
  }

  /// An inspector that never signals other threads; reports hold only the
  /// calling thread. Works on every platform.
  #[must_use]
  pub fn current_thread_only(config: InspectorConfig) -> Self {
    Self {
      inner: Arc::new(InspectorInner {
        config,
        sampler: None,
      }),
    }
  }

  fn heap_report(&self, averages: bool) -> HeapReport {
    let rows = census()
      .tallies()
      .into_iter()
      .map(HeapTypeRow::from)
      .collect();

    let mut report = HeapReport::new(rows);

    if averages {
      report = report.with_averages();
    }

    if self.inner.config.heap_totals {
      report = report.with_totals();
    }

    if let Some(stats) = AllocatorStats::current() {
      report = report.with_allocator(stats);
    }

    report.with_message(HEAP_CAVEAT)
  }

  fn join(&self, stacks: &[RawStack]) -> ThreadReport {
    let registry = registered_threads();
    let mut resolver = FrameResolver::new(&self.inner.config);

    let threads = stacks
      .iter()
      .map(|stack| {
        let info = registry.get(&stack.ident);

        ThreadSnapshot {
          daemon: info.map(|info| info.daemon),
          frames: resolver.resolve(stack),
          id: stack.ident,
          name: info
            .map(|info| info.name.clone())
            .or_else(|| os_thread_name(stack.ident))
            .unwrap_or_default(),
        }
      })
      .collect();

    ThreadReport::new(threads)
  }

  /// Install the capture handler with the default configuration.
  ///
  /// # Errors
  ///
  /// See [`InspectorBuilder::finish`].
  pub fn new() -> Result<Self, PryError> {
    Self::with_config(InspectorConfig::default())
  }

  #[must_use]
  pub fn show_heap(&self) -> String {
    format_heap_stats(&self.collect_heap_stats())
  }

  #[inline(never)]
  #[must_use]
  pub fn show_threads(&self) -> String {
    format_thread_stacks(&self.capture())
  }

  /// Install the capture handler described by `config`.
  ///
  /// # Errors
  ///
  /// See [`InspectorBuilder::finish`].
  pub fn with_config(config: InspectorConfig) -> Result<Self, PryError> {
    let sampler =
      SignalSampler::install(config.capture_signal, config.signal_timeout)?;

    Ok(Self {
      inner: Arc::new(InspectorInner {
        config,
        sampler: Some(sampler),
      }),
    })
  }
}

static GLOBAL: OnceLock<Inspector> = OnceLock::new();

/// Process-wide inspector behind the free functions. Built once; if the
/// capture handler cannot be installed, reports cover the calling thread
/// only.
pub(crate) fn global() -> &'static Inspector {
  GLOBAL.get_or_init(|| {
    Inspector::new().unwrap_or_else(|err| {
      warn!(%err, "cannot capture other threads; reporting the calling thread only");
      Inspector::current_thread_only(InspectorConfig::default())
    })
  })
}
