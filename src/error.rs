use super::*;

/// Errors surfaced while setting up an inspector or exporting a report.
///
/// Collecting a report never fails; these only cover construction and I/O.
#[derive(Debug, thiserror::Error)]
pub enum PryError {
  #[error("i/o error during export: {0}")]
  Io(#[from] io::Error),
  #[error("failed to encode report as json: {0}")]
  Json(#[from] serde_json::Error),
  #[error("signal {signal} already has a handler not owned by pry")]
  SignalConflict { signal: i32 },
  #[error("failed to install handler for signal {signal}: {source}")]
  SignalInstall { signal: i32, source: io::Error },
  #[error("stack capture of other threads is not supported on this platform")]
  Unsupported,
}
