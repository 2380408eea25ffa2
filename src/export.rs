use super::*;

/// Streaming interface for tools that ship reports somewhere as they are
/// taken.
pub trait ReportStreamWriter {
  /// # Errors
  ///
  /// Returns a `PryError` if the report cannot be serialized or if the
  /// underlying writer fails.
  fn write_heap(
    &mut self,
    report: &HeapReport,
    timestamp: Option<SystemTime>,
  ) -> Result<(), PryError>;

  /// # Errors
  ///
  /// Returns a `PryError` if the report cannot be serialized or if the
  /// underlying writer fails.
  fn write_threads(
    &mut self,
    report: &ThreadReport,
    timestamp: Option<SystemTime>,
  ) -> Result<(), PryError>;
}

/// JSON lines exporter that writes one JSON object per report.
pub struct JsonLinesWriter<W: Write> {
  writer: W,
}

impl<W: Write> ReportStreamWriter for JsonLinesWriter<W> {
  fn write_heap(
    &mut self,
    report: &HeapReport,
    timestamp: Option<SystemTime>,
  ) -> Result<(), PryError> {
    self.write_chunk(&StreamChunk::new("heap", report, timestamp))
  }

  fn write_threads(
    &mut self,
    report: &ThreadReport,
    timestamp: Option<SystemTime>,
  ) -> Result<(), PryError> {
    self.write_chunk(&StreamChunk::new("threads", report, timestamp))
  }
}

impl<W: Write> JsonLinesWriter<W> {
  pub fn into_inner(self) -> W {
    self.writer
  }

  pub fn new(writer: W) -> Self {
    Self { writer }
  }

  fn write_chunk<R: Serialize>(
    &mut self,
    chunk: &StreamChunk<'_, R>,
  ) -> Result<(), PryError> {
    serde_json::to_writer(&mut self.writer, chunk)?;
    self.writer.write_all(b"\n")?;
    Ok(())
  }
}

#[derive(Serialize)]
struct StreamChunk<'a, R> {
  kind: &'static str,
  report: &'a R,
  #[serde(skip_serializing_if = "Option::is_none")]
  timestamp_ns: Option<u128>,
}

impl<'a, R> StreamChunk<'a, R> {
  fn new(
    kind: &'static str,
    report: &'a R,
    timestamp: Option<SystemTime>,
  ) -> Self {
    Self {
      kind,
      report,
      timestamp_ns: timestamp.and_then(system_time_to_nanos),
    }
  }
}

fn system_time_to_nanos(ts: SystemTime) -> Option<u128> {
  ts.duration_since(SystemTime::UNIX_EPOCH)
    .ok()
    .map(|duration| duration.as_nanos())
}

impl ThreadReport {
  /// Serialize the report to JSON using the provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization to JSON fails.
  pub fn export_json<W: Write>(&self, writer: W) -> Result<(), PryError> {
    serde_json::to_writer(writer, self)?;
    Ok(())
  }
}

impl HeapReport {
  /// Serialize the report to JSON using the provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization to JSON fails.
  pub fn export_json<W: Write>(&self, writer: W) -> Result<(), PryError> {
    serde_json::to_writer(writer, self)?;
    Ok(())
  }
}

impl HeapDelta {
  /// Serialize the delta to JSON using the provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization to JSON fails.
  pub fn export_json<W: Write>(&self, writer: W) -> Result<(), PryError> {
    serde_json::to_writer(writer, self)?;
    Ok(())
  }
}
