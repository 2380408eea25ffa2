use super::*;

/// Controls how the inspector captures and renders its reports.
#[derive(Debug, Clone)]
pub struct InspectorConfig {
  /// Path fragments that mark an internal root. Everything up to and
  /// including the last occurrence is replaced with `.../`.
  pub abbreviation_markers: Vec<String>,
  /// Signal delivered to other threads to make them record their stack.
  pub capture_signal: i32,
  /// Fill in the average size of each type in heap reports.
  pub heap_averages: bool,
  /// Attach grand totals to heap reports.
  pub heap_totals: bool,
  /// Read the source text of every frame's line.
  pub include_source: bool,
  /// Maximum number of frames kept per thread.
  pub max_stack_depth: u16,
  /// How long to wait for a signalled thread to record its stack.
  pub signal_timeout: Duration,
}

impl Default for InspectorConfig {
  fn default() -> Self {
    Self {
      abbreviation_markers: vec![
        "/.cargo/registry/src/".to_string(),
        "/.cargo/git/checkouts/".to_string(),
        "/rustc/".to_string(),
      ],
      capture_signal: default_capture_signal(),
      heap_averages: false,
      heap_totals: true,
      include_source: true,
      max_stack_depth: 128,
      signal_timeout: Duration::from_millis(250),
    }
  }
}

impl InspectorConfig {
  /// Builder-style helper to adjust the maximum stack depth.
  #[must_use]
  pub fn with_max_stack_depth(mut self, depth: u16) -> Self {
    self.max_stack_depth = depth;
    self
  }

  /// Skip reading source files when rendering frames.
  #[must_use]
  pub fn without_source(mut self) -> Self {
    self.include_source = false;
    self
  }

  pub(crate) fn max_frames(&self) -> usize {
    usize::from(self.max_stack_depth.max(1))
  }
}

#[cfg(unix)]
fn default_capture_signal() -> i32 {
  libc::SIGPROF
}

#[cfg(not(unix))]
fn default_capture_signal() -> i32 {
  0
}
