use {super::*, census::TypeTally};

/// Advisory attached to every census: only tracked values are visible.
pub(crate) const HEAP_CAVEAT: &str = "\
Caution: the census only shows values owned by a Tracked handle or
registered with track_alloc, so it does not include plain values, or the
heap buffers of untracked containers.
";

/// Live objects of one type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeapTypeRow {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub average_bytes: Option<f64>,
  pub count: u64,
  pub total_bytes: u64,
  pub type_name: String,
}

impl HeapTypeRow {
  #[must_use]
  pub fn new(type_name: impl Into<String>, count: u64, total_bytes: u64) -> Self {
    Self {
      average_bytes: None,
      count,
      total_bytes,
      type_name: type_name.into(),
    }
  }

  /// Fill in `total_bytes / count`. Rows with no objects have no average.
  #[must_use]
  pub fn with_average(mut self) -> Self {
    self.average_bytes =
      (self.count > 0).then(|| self.total_bytes as f64 / self.count as f64);
    self
  }
}

impl From<TypeTally> for HeapTypeRow {
  fn from(tally: TypeTally) -> Self {
    Self::new(tally.name, tally.count, tally.bytes)
  }
}

/// Grand totals across every row of a census.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct HeapTotals {
  pub bytes: u64,
  pub objects: u64,
}

/// Census of live tracked objects, largest types first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HeapReport {
  #[serde(skip_serializing_if = "Option::is_none")]
  allocator: Option<AllocatorStats>,
  #[serde(skip_serializing_if = "Option::is_none")]
  message: Option<String>,
  rows: Vec<HeapTypeRow>,
  #[serde(skip_serializing_if = "Option::is_none")]
  totals: Option<HeapTotals>,
}

impl HeapReport {
  #[must_use]
  pub fn allocator(&self) -> Option<&AllocatorStats> {
    self.allocator.as_ref()
  }

  /// Whether the rows carry an average size column.
  #[must_use]
  pub fn has_averages(&self) -> bool {
    self.rows.iter().any(|row| row.average_bytes.is_some())
  }

  #[must_use]
  pub fn message(&self) -> Option<&str> {
    self.message.as_deref()
  }

  /// Build a report, sorting rows by total bytes, largest first. Rows with
  /// equal bytes are ordered by type name.
  #[must_use]
  pub fn new(mut rows: Vec<HeapTypeRow>) -> Self {
    rows.sort_by(|a, b| {
      b.total_bytes
        .cmp(&a.total_bytes)
        .then_with(|| a.type_name.cmp(&b.type_name))
    });

    Self {
      allocator: None,
      message: None,
      rows,
      totals: None,
    }
  }

  #[must_use]
  pub fn row(&self, type_name: &str) -> Option<&HeapTypeRow> {
    self.rows.iter().find(|row| row.type_name == type_name)
  }

  #[must_use]
  pub fn rows(&self) -> &[HeapTypeRow] {
    &self.rows
  }

  #[must_use]
  pub fn totals(&self) -> Option<HeapTotals> {
    self.totals
  }

  #[must_use]
  pub fn with_allocator(mut self, stats: AllocatorStats) -> Self {
    self.allocator = Some(stats);
    self
  }

  #[must_use]
  pub fn with_averages(mut self) -> Self {
    self.rows = self.rows.into_iter().map(HeapTypeRow::with_average).collect();
    self
  }

  #[must_use]
  pub fn with_message(mut self, message: impl Into<String>) -> Self {
    self.message = Some(message.into());
    self
  }

  /// Attach totals summed from the rows.
  #[must_use]
  pub fn with_totals(mut self) -> Self {
    let totals =
      self
        .rows
        .iter()
        .fold(HeapTotals::default(), |totals, row| HeapTotals {
          bytes: totals.bytes.saturating_add(row.total_bytes),
          objects: totals.objects.saturating_add(row.count),
        });

    self.totals = Some(totals);
    self
  }
}

/// Change of one type between two censuses.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct HeapDeltaRow {
  pub bytes: i64,
  pub count: i64,
  pub type_name: String,
}

/// Per-type growth between two censuses, largest growth first.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct HeapDelta {
  rows: Vec<HeapDeltaRow>,
}

impl HeapDelta {
  /// Difference `newer - older`. Types present in only one report count as
  /// zero in the other; types that did not change are left out.
  #[must_use]
  pub fn between(newer: &HeapReport, older: &HeapReport) -> Self {
    let mut baseline: HashMap<&str, &HeapTypeRow> = older
      .rows()
      .iter()
      .map(|row| (row.type_name.as_str(), row))
      .collect();

    let mut rows = Vec::new();

    for row in newer.rows() {
      let (count, bytes) = match baseline.remove(row.type_name.as_str()) {
        Some(prev) => (
          difference(row.count, prev.count),
          difference(row.total_bytes, prev.total_bytes),
        ),
        None => (difference(row.count, 0), difference(row.total_bytes, 0)),
      };

      rows.push(HeapDeltaRow {
        bytes,
        count,
        type_name: row.type_name.clone(),
      });
    }

    for prev in baseline.into_values() {
      rows.push(HeapDeltaRow {
        bytes: difference(0, prev.total_bytes),
        count: difference(0, prev.count),
        type_name: prev.type_name.clone(),
      });
    }

    rows.retain(|row| row.count != 0 || row.bytes != 0);
    rows.sort_by(|a, b| {
      b.bytes
        .cmp(&a.bytes)
        .then_with(|| a.type_name.cmp(&b.type_name))
    });

    Self { rows }
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }

  #[must_use]
  pub fn rows(&self) -> &[HeapDeltaRow] {
    &self.rows
  }
}

fn difference(newer: u64, older: u64) -> i64 {
  let delta = i128::from(newer) - i128::from(older);

  match i64::try_from(delta) {
    Ok(value) => value,
    Err(_) if delta.is_negative() => i64::MIN,
    Err(_) => i64::MAX,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn report() -> HeapReport {
    HeapReport::new(vec![
      HeapTypeRow::new("alloc::string::String", 4, 96),
      HeapTypeRow::new("u8", 10, 10),
      HeapTypeRow::new("app::Session", 2, 512),
      HeapTypeRow::new("app::Peer", 3, 96),
    ])
  }

  #[test]
  fn rows_are_sorted_by_bytes_descending() {
    let report = report();
    let bytes: Vec<_> = report.rows().iter().map(|r| r.total_bytes).collect();
    assert_eq!(bytes, [512, 96, 96, 10]);

    assert_eq!(report.rows()[1].type_name, "alloc::string::String");
    assert_eq!(report.rows()[2].type_name, "app::Peer");
  }

  #[test]
  fn totals_match_row_sums() {
    let report = report().with_totals();
    let totals = report.totals().expect("totals attached");

    let count: u64 = report.rows().iter().map(|r| r.count).sum();
    assert_eq!(totals.objects, count);
    assert_eq!(totals.bytes, 714);
  }

  #[test]
  fn averages_divide_bytes_by_count() {
    let report = report().with_averages();
    assert!(report.has_averages());

    for row in report.rows() {
      let average = row.average_bytes.expect("average present");
      let expected = row.total_bytes as f64 / row.count as f64;
      assert!((average - expected).abs() < 1e-9);
    }

    let empty = HeapTypeRow::new("unit", 0, 0).with_average();
    assert_eq!(empty.average_bytes, None);
  }

  #[test]
  fn delta_reports_growth_and_shrinkage() {
    let older = report();
    let newer = HeapReport::new(vec![
      HeapTypeRow::new("alloc::string::String", 6, 144),
      HeapTypeRow::new("u8", 10, 10),
      HeapTypeRow::new("app::Session", 1, 256),
      HeapTypeRow::new("app::Cache", 1, 4096),
    ]);

    let delta = HeapDelta::between(&newer, &older);
    let rows: Vec<_> = delta
      .rows()
      .iter()
      .map(|row| (row.type_name.as_str(), row.count, row.bytes))
      .collect();

    assert_eq!(
      rows,
      [
        ("app::Cache", 1, 4096),
        ("alloc::string::String", 2, 48),
        ("app::Peer", -3, -96),
        ("app::Session", -1, -256),
      ]
    );
  }

  #[test]
  fn difference_clamps_to_i64() {
    assert_eq!(difference(u64::MAX, 0), i64::MAX);
    assert_eq!(difference(0, u64::MAX), i64::MIN);
    assert_eq!(difference(5, 7), -2);
  }
}
