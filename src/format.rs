//! Plain-text rendering of reports. Every formatter is a pure function of
//! its input.

use super::*;

const THREADS_BANNER: &str = "Threads:\n\n";
const HEAP_HEADER: &str = "Objects (total bytes, count, type):\n\n";
const HEAP_HEADER_AVERAGES: &str =
  "Objects (total bytes, count, average bytes, type):\n\n";
const DELTA_HEADER: &str = "Object growth (bytes, count, type):\n\n";

/// Render thread stacks traceback style: outermost caller first, the frame
/// that was executing last.
#[must_use]
pub fn format_thread_stacks(report: &ThreadReport) -> String {
  let mut out = String::from(THREADS_BANNER);

  for thread in report.threads() {
    let daemon = thread.daemon.map(|daemon| daemon.to_string());

    let _ = writeln!(
      out,
      "--- Thread {} (name: {}) (daemon: {}) stack: ---",
      thread.id,
      thread.name,
      daemon.as_deref().unwrap_or_default()
    );

    for frame in thread.frames.iter().rev() {
      let _ = writeln!(
        out,
        "  File \"{}\", line {}, in {}",
        frame.filename, frame.lineno, frame.function
      );

      let line = frame.line.trim();
      if !line.is_empty() {
        let _ = writeln!(out, "    {line}");
      }
    }
  }

  out
}

/// Render a census as fixed-width columns followed by the totals and the
/// caveat, when present.
#[must_use]
pub fn format_heap_stats(report: &HeapReport) -> String {
  let averages = report.has_averages();

  let mut out = String::from(if averages {
    HEAP_HEADER_AVERAGES
  } else {
    HEAP_HEADER
  });

  for row in report.rows() {
    if averages {
      let average = row
        .average_bytes
        .map(|average| format!("{average:.1}"))
        .unwrap_or_default();

      let _ = writeln!(
        out,
        "{:>12} {:>12} {:>12}  {}",
        row.total_bytes, row.count, average, row.type_name
      );
    } else {
      let _ = writeln!(
        out,
        "{:>12} {:>12}  {}",
        row.total_bytes, row.count, row.type_name
      );
    }
  }

  if let Some(totals) = report.totals() {
    let _ = write!(
      out,
      "\nTotal bytes: {}\nTotal number of objects: {}\n",
      totals.bytes, totals.objects
    );
  }

  if let Some(stats) = report.allocator() {
    if report.totals().is_none() {
      out.push('\n');
    }

    let _ = write!(
      out,
      "Allocator live bytes: {}\nAllocator live allocations: {}\n",
      stats.live_bytes, stats.live_allocations
    );
  }

  if let Some(message) = report.message() {
    out.push_str("\n\n");
    out.push_str(message);
  }

  out
}

/// Render per-type growth between two censuses with signed columns.
#[must_use]
pub fn format_heap_delta(delta: &HeapDelta) -> String {
  let mut out = String::from(DELTA_HEADER);

  for row in delta.rows() {
    let _ = writeln!(
      out,
      "{:>+12} {:>+12}  {}",
      row.bytes, row.count, row.type_name
    );
  }

  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn thread_report() -> ThreadReport {
    ThreadReport::new(vec![
      ThreadSnapshot {
        daemon: Some(true),
        frames: vec![
          StackFrame::new("src/worker.rs", "app::worker::poll", 42)
            .with_line("        queue.recv()"),
          StackFrame::new("src/main.rs", "app::main", 7),
        ],
        id: ThreadIdent::from_raw(0x1f2e),
        name: "worker".to_string(),
      },
      ThreadSnapshot {
        daemon: None,
        frames: Vec::new(),
        id: ThreadIdent::from_signed(-2),
        name: String::new(),
      },
    ])
  }

  #[test]
  fn renders_threads_outermost_first() {
    let text = format_thread_stacks(&thread_report());
    let negative = ThreadIdent::from_signed(-2);

    let expected = format!(
      "Threads:\n\n\
       --- Thread {negative} (name: ) (daemon: ) stack: ---\n\
       --- Thread 1f2e (name: worker) (daemon: true) stack: ---\n  \
       File \"src/main.rs\", line 7, in app::main\n  \
       File \"src/worker.rs\", line 42, in app::worker::poll\n    \
       queue.recv()\n"
    );

    assert_eq!(text, expected);
    assert!(!text.contains("Thread -"));
  }

  #[test]
  fn formatting_is_repeatable() {
    let report = thread_report();
    assert_eq!(format_thread_stacks(&report), format_thread_stacks(&report));

    let heap = HeapReport::new(vec![HeapTypeRow::new("u8", 1, 1)]).with_totals();
    assert_eq!(format_heap_stats(&heap), format_heap_stats(&heap));
  }

  #[test]
  fn renders_heap_columns_and_summary() {
    let report = HeapReport::new(vec![
      HeapTypeRow::new("app::Session", 2, 512),
      HeapTypeRow::new("u8", 10, 10),
    ])
    .with_totals()
    .with_message("Caution: partial.\n");

    let text = format_heap_stats(&report);
    let expected = "Objects (total bytes, count, type):\n\n         \
                    512            2  app::Session\n          \
                    10           10  u8\n\
                    \nTotal bytes: 522\nTotal number of objects: 12\n\
                    \n\nCaution: partial.\n";

    assert_eq!(text, expected);
  }

  #[test]
  fn renders_average_column() {
    let report =
      HeapReport::new(vec![HeapTypeRow::new("app::Peer", 3, 100)]).with_averages();

    let text = format_heap_stats(&report);
    assert!(text.starts_with(HEAP_HEADER_AVERAGES));
    assert!(text.contains("         100            3         33.3  app::Peer\n"));
  }

  #[test]
  fn renders_allocator_totals() {
    let report = HeapReport::new(Vec::new()).with_allocator(AllocatorStats {
      live_allocations: 3,
      live_bytes: 4096,
      total_allocations: 9,
      total_bytes: 8192,
    });

    let text = format_heap_stats(&report);
    assert!(text.ends_with(
      "\nAllocator live bytes: 4096\nAllocator live allocations: 3\n"
    ));
  }

  #[test]
  fn renders_signed_delta() {
    let older = HeapReport::new(vec![HeapTypeRow::new("app::Peer", 3, 96)]);
    let newer = HeapReport::new(vec![HeapTypeRow::new("app::Cache", 1, 64)]);

    let text = format_heap_delta(&HeapDelta::between(&newer, &older));
    assert_eq!(
      text,
      "Object growth (bytes, count, type):\n\n         \
       +64           +1  app::Cache\n         \
       -96           -3  app::Peer\n"
    );
  }
}
