use {
  super::*,
  sampler::{CaptureOrigin, RawStack},
  source::{SourceCache, abbreviate_path},
};

/// A single frame in a thread's stack.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize)]
pub struct StackFrame {
  pub filename: Arc<str>,
  pub function: Arc<str>,
  /// Source text at `lineno`, empty when the file is unavailable.
  pub line: Arc<str>,
  pub lineno: u32,
}

impl StackFrame {
  #[must_use]
  pub fn new(
    filename: impl Into<String>,
    function: impl Into<String>,
    lineno: u32,
  ) -> Self {
    Self {
      filename: Arc::<str>::from(filename.into()),
      function: Arc::<str>::from(function.into()),
      line: Arc::<str>::from(""),
      lineno,
    }
  }

  #[must_use]
  pub fn with_line(mut self, line: impl Into<String>) -> Self {
    self.line = Arc::<str>::from(line.into());
    self
  }
}

/// Stack of one live thread at the moment of collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadSnapshot {
  /// `None` when the thread never registered itself.
  pub daemon: Option<bool>,
  /// Innermost (currently executing) frame first.
  pub frames: Vec<StackFrame>,
  pub id: ThreadIdent,
  pub name: String,
}

/// Stacks of every live thread, ordered by thread name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThreadReport {
  threads: Vec<ThreadSnapshot>,
}

impl ThreadReport {
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.threads.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.threads.len()
  }

  /// Build a report, sorting by name. Threads sharing a name keep the order
  /// they were given in.
  #[must_use]
  pub fn new(mut threads: Vec<ThreadSnapshot>) -> Self {
    threads.sort_by(|a, b| a.name.cmp(&b.name));
    Self { threads }
  }

  #[must_use]
  pub fn thread(&self, id: ThreadIdent) -> Option<&ThreadSnapshot> {
    self.threads.iter().find(|thread| thread.id == id)
  }

  #[must_use]
  pub fn threads(&self) -> &[ThreadSnapshot] {
    &self.threads
  }
}

/// Functions on the collection path. A directly captured stack starts with
/// these, and they are not part of what the caller was doing.
const COLLECTOR_FRAMES: &[&str] = &[
  concat!(env!("CARGO_CRATE_NAME"), "::collect_thread_stacks"),
  concat!(env!("CARGO_CRATE_NAME"), "::show_threads"),
  concat!(env!("CARGO_CRATE_NAME"), "::sampler::capture_current"),
  concat!(
    env!("CARGO_CRATE_NAME"),
    "::sampler::imp::<impl ",
    env!("CARGO_CRATE_NAME"),
    "::sampler::SignalSampler>::capture_all"
  ),
  concat!(env!("CARGO_CRATE_NAME"), "::sampler::SignalSampler::capture_all"),
  concat!(env!("CARGO_CRATE_NAME"), "::state::Inspector::capture"),
  concat!(
    env!("CARGO_CRATE_NAME"),
    "::state::Inspector::collect_thread_stacks"
  ),
  concat!(env!("CARGO_CRATE_NAME"), "::state::Inspector::show_threads"),
];

const SIGNAL_HANDLER: &str =
  concat!(env!("CARGO_CRATE_NAME"), "::sampler::imp::on_capture_signal");

/// Kernel and libc frames that return from a signal handler.
const TRAMPOLINES: &[&str] =
  &["__restore_rt", "__kernel_rt_sigreturn", "_sigtramp", "__sigreturn"];

const UNKNOWN: &str = "<unknown>";

/// One symbol resolved from an instruction pointer. Inlined calls resolve to
/// several symbols for the same pointer.
#[derive(Debug, Clone)]
struct ResolvedSymbol {
  filename: Option<PathBuf>,
  function: String,
  lineno: Option<u32>,
}

/// Turns raw stacks into frames, sharing symbol and source lookups across
/// every thread of one report.
pub(crate) struct FrameResolver<'a> {
  config: &'a InspectorConfig,
  sources: SourceCache,
  symbols: HashMap<usize, Arc<[ResolvedSymbol]>>,
}

impl<'a> FrameResolver<'a> {
  #[must_use]
  pub(crate) fn new(config: &'a InspectorConfig) -> Self {
    Self {
      config,
      sources: SourceCache::new(),
      symbols: HashMap::new(),
    }
  }

  pub(crate) fn resolve(&mut self, stack: &RawStack) -> Vec<StackFrame> {
    let mut symbols = Vec::with_capacity(stack.ips.len());
    for &ip in &stack.ips {
      symbols.extend(self.symbols_for(ip).iter().cloned());
    }

    let skip = match stack.origin {
      CaptureOrigin::Direct => leading_collector_frames(&symbols),
      CaptureOrigin::Signal => handler_frames(&symbols),
    };

    symbols
      .into_iter()
      .skip(skip)
      .take(self.config.max_frames())
      .map(|symbol| self.frame(symbol))
      .collect()
  }

  fn frame(&mut self, symbol: ResolvedSymbol) -> StackFrame {
    let lineno = symbol.lineno.unwrap_or(0);

    let Some(path) = symbol.filename else {
      return StackFrame::new("<native>", symbol.function, lineno);
    };

    let line = if self.config.include_source {
      self.sources.line(&path, lineno)
    } else {
      String::new()
    };

    let filename = abbreviate_path(
      &path.to_string_lossy(),
      &self.config.abbreviation_markers,
    );

    StackFrame::new(filename, symbol.function, lineno).with_line(line)
  }

  fn symbols_for(&mut self, ip: usize) -> Arc<[ResolvedSymbol]> {
    self
      .symbols
      .entry(ip)
      .or_insert_with(|| resolve_ip(ip))
      .clone()
  }
}

fn resolve_ip(ip: usize) -> Arc<[ResolvedSymbol]> {
  let mut symbols = Vec::new();

  backtrace::resolve(ip as *mut c_void, |symbol| {
    symbols.push(ResolvedSymbol {
      filename: symbol.filename().map(Path::to_path_buf),
      function: symbol
        .name()
        .map_or_else(|| UNKNOWN.to_string(), |name| symbol_name_to_string(&name)),
      lineno: symbol.lineno(),
    });
  });

  if symbols.is_empty() {
    symbols.push(ResolvedSymbol {
      filename: None,
      function: UNKNOWN.to_string(),
      lineno: None,
    });
  }

  symbols.into()
}

/// Demangled name without the trailing hash.
fn symbol_name_to_string(name: &SymbolName<'_>) -> String {
  format!("{name:#}")
}

fn strip_closures(mut function: &str) -> &str {
  while let Some(outer) = function.strip_suffix("::{{closure}}") {
    function = outer;
  }
  function
}

fn is_collector_frame(function: &str) -> bool {
  let function = strip_closures(function);

  function.starts_with("backtrace::")
    || function.starts_with("_Unwind_")
    || COLLECTOR_FRAMES.contains(&function)
}

/// Frames from the top of the stack through the last collector frame. Std
/// shims between collector frames are skipped with them.
fn leading_collector_frames(symbols: &[ResolvedSymbol]) -> usize {
  let mut skip = 0;

  for (index, symbol) in symbols.iter().enumerate() {
    if is_collector_frame(&symbol.function) {
      skip = index + 1;
    } else if !is_std_shim(&symbol.function) {
      break;
    }
  }

  skip
}

fn is_std_shim(function: &str) -> bool {
  function == UNKNOWN
    || ["core::", "std::", "alloc::"]
      .iter()
      .any(|prefix| function.starts_with(prefix))
}

/// Frames up to and including the signal handler and the return trampoline
/// right after it. The trampoline often has no exported symbol, so it is
/// skipped by position rather than by name.
fn handler_frames(symbols: &[ResolvedSymbol]) -> usize {
  let Some(handler) = symbols
    .iter()
    .rposition(|symbol| strip_closures(&symbol.function) == SIGNAL_HANDLER)
  else {
    return leading_collector_frames(symbols);
  };

  let mut skip = (handler + 2).min(symbols.len());

  skip += symbols[skip..]
    .iter()
    .take_while(|symbol| TRAMPOLINES.contains(&symbol.function.as_str()))
    .count();

  skip
}

#[cfg(test)]
mod tests {
  use super::*;

  fn symbol(function: &str) -> ResolvedSymbol {
    ResolvedSymbol {
      filename: None,
      function: function.to_string(),
      lineno: None,
    }
  }

  fn snapshot(name: &str, id: usize) -> ThreadSnapshot {
    ThreadSnapshot {
      daemon: Some(false),
      frames: Vec::new(),
      id: ThreadIdent::from_raw(id),
      name: name.to_string(),
    }
  }

  #[test]
  fn sorts_threads_by_name() {
    let report = ThreadReport::new(vec![
      snapshot("worker-b", 1),
      snapshot("", 2),
      snapshot("main", 3),
      snapshot("worker-a", 4),
    ]);

    let names: Vec<_> =
      report.threads().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["", "main", "worker-a", "worker-b"]);
  }

  #[test]
  fn equal_names_keep_encounter_order() {
    let report = ThreadReport::new(vec![
      snapshot("pool", 7),
      snapshot("io", 1),
      snapshot("pool", 3),
      snapshot("pool", 5),
    ]);

    let ids: Vec<_> =
      report.threads().iter().map(|t| t.id.as_raw()).collect();
    assert_eq!(ids, [1, 7, 3, 5]);
  }

  #[test]
  fn ordering_does_not_depend_on_enumeration_order() {
    let threads: Vec<_> = ["gamma", "alpha", "delta", "beta", "epsilon"]
      .iter()
      .enumerate()
      .map(|(id, name)| snapshot(name, id))
      .collect();

    let expected = ThreadReport::new(threads.clone());

    for rotation in 0..threads.len() {
      let mut shuffled = threads.clone();
      shuffled.rotate_left(rotation);
      assert_eq!(ThreadReport::new(shuffled.clone()), expected);

      shuffled.reverse();
      assert_eq!(ThreadReport::new(shuffled), expected);
    }
  }

  #[test]
  fn strips_collector_frames_from_direct_captures() {
    let crate_name = env!("CARGO_CRATE_NAME");
    let symbols = vec![
      symbol("backtrace::backtrace::libunwind::trace"),
      symbol(&format!("{crate_name}::sampler::capture_current::{{{{closure}}}}")),
      symbol("backtrace::backtrace::trace"),
      symbol(&format!("{crate_name}::sampler::capture_current")),
      symbol(&format!("{crate_name}::state::Inspector::collect_thread_stacks")),
      symbol(&format!("{crate_name}::collect_thread_stacks")),
      symbol("app::handlers::dump"),
      symbol("app::main"),
    ];

    assert_eq!(leading_collector_frames(&symbols), 6);
  }

  #[test]
  fn strips_through_signal_trampoline() {
    let symbols = vec![
      symbol("backtrace::backtrace::trace_unsynchronized"),
      symbol(&format!("{SIGNAL_HANDLER}::{{{{closure}}}}")),
      symbol(SIGNAL_HANDLER),
      symbol("__restore_rt"),
      symbol("std::sys::pal::unix::futex::futex_wait"),
      symbol("app::worker"),
    ];

    assert_eq!(handler_frames(&symbols), 4);
  }

  #[test]
  fn strips_unnamed_trampoline_after_handler() {
    let symbols = vec![
      symbol("backtrace::backtrace::libunwind::trace"),
      symbol(SIGNAL_HANDLER),
      symbol(UNKNOWN),
      symbol("app::spin"),
      symbol("app::main"),
    ];

    assert_eq!(handler_frames(&symbols), 3);

    let handler_last = vec![symbol("backtrace::trace"), symbol(SIGNAL_HANDLER)];
    assert_eq!(handler_frames(&handler_last), 2);
  }

  #[test]
  fn skips_std_shims_between_collector_frames() {
    let crate_name = env!("CARGO_CRATE_NAME");
    let symbols = vec![
      symbol("backtrace::backtrace::trace"),
      symbol("core::ops::function::FnOnce::call_once"),
      symbol(&format!("{crate_name}::show_threads")),
      symbol("std::thread::sleep"),
      symbol("app::main"),
    ];

    assert_eq!(leading_collector_frames(&symbols), 3);
  }

  #[test]
  fn frames_inside_user_code_are_kept() {
    let symbols = vec![symbol("app::main"), symbol("backtrace::trace")];
    assert_eq!(leading_collector_frames(&symbols), 0);
  }

  #[test]
  fn unresolved_frames_render_as_native() {
    let config = InspectorConfig::default();
    let mut resolver = FrameResolver::new(&config);

    let frame = resolver.frame(symbol(UNKNOWN));
    assert_eq!(frame.filename.as_ref(), "<native>");
    assert_eq!(frame.function.as_ref(), UNKNOWN);
    assert_eq!(frame.lineno, 0);
    assert!(frame.line.is_empty());
  }

  #[test]
  fn abbreviates_resolved_paths() {
    let config = InspectorConfig::default();
    let mut resolver = FrameResolver::new(&config);

    let frame = resolver.frame(ResolvedSymbol {
      filename: Some(PathBuf::from(
        "/home/dev/.cargo/registry/src/index.crates.io-6f17/log-0.4.0/src/lib.rs",
      )),
      function: "log::info".to_string(),
      lineno: Some(12),
    });

    assert_eq!(
      frame.filename.as_ref(),
      ".../index.crates.io-6f17/log-0.4.0/src/lib.rs"
    );
    assert_eq!(frame.lineno, 12);
  }

  #[test]
  fn resolves_own_stack_with_caller_innermost() {
    let config = InspectorConfig::default();
    let mut resolver = FrameResolver::new(&config);

    let frames = resolver.resolve(&sampler::capture_current());

    let innermost = frames.first().expect("at least one frame");
    assert!(
      innermost
        .function
        .ends_with("resolves_own_stack_with_caller_innermost"),
      "unexpected innermost frame {innermost:?}"
    );
  }
}
