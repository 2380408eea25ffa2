use super::*;

/// Replace everything up to and including the last occurrence of any marker
/// with `.../`.
///
/// When several markers match, the one ending furthest into the path wins.
#[must_use]
pub(crate) fn abbreviate_path(path: &str, markers: &[String]) -> String {
  let cut = markers
    .iter()
    .filter(|marker| !marker.is_empty())
    .filter_map(|marker| {
      path.rfind(marker.as_str()).map(|start| start + marker.len())
    })
    .max();

  match cut {
    Some(end) => format!(".../{}", path[end..].trim_start_matches('/')),
    None => path.to_string(),
  }
}

/// Per-report cache of source files, read lazily one file at a time.
///
/// Files that cannot be read are remembered as missing so they are not
/// retried for every frame.
#[derive(Debug, Default)]
pub(crate) struct SourceCache {
  files: HashMap<PathBuf, Option<Arc<[String]>>>,
}

impl SourceCache {
  /// Text of `lineno` (1-based) in `path`, or an empty string.
  pub(crate) fn line(&mut self, path: &Path, lineno: u32) -> String {
    let Some(index) = usize::try_from(lineno)
      .ok()
      .and_then(|lineno| lineno.checked_sub(1))
    else {
      return String::new();
    };

    self
      .lines(path)
      .and_then(|lines| lines.get(index).cloned())
      .unwrap_or_default()
  }

  fn lines(&mut self, path: &Path) -> Option<Arc<[String]>> {
    self
      .files
      .entry(path.to_path_buf())
      .or_insert_with(|| read_lines(path))
      .clone()
  }

  #[must_use]
  pub(crate) fn new() -> Self {
    Self::default()
  }
}

fn read_lines(path: &Path) -> Option<Arc<[String]>> {
  match fs::read(path) {
    Ok(bytes) => Some(
      String::from_utf8_lossy(&bytes)
        .lines()
        .map(str::to_string)
        .collect(),
    ),
    Err(err) => {
      trace!(path = %path.display(), %err, "source file unavailable");
      None
    }
  }
}
