use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

const ARRAY_KEY_PREFIX: &str = "array:";

/// Display form of the empty path, which stands for the options object itself
pub const ROOT_OPTION_MARKER: &str = "<root>";

/// Identifies an option a request read.
///
/// Legacy tracking only records top-level keys. Granular tracking records the full path, and an
/// empty path marks an enumeration of the root object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptionPath {
  Key(String),
  Path(Vec<String>),
}

impl OptionPath {
  pub fn root() -> Self {
    OptionPath::Path(Vec::new())
  }

  pub fn is_root(&self) -> bool {
    matches!(self, OptionPath::Path(path) if path.is_empty())
  }

  /// String identity used in node content keys. Structural paths are JSON encoded behind an
  /// `array:` prefix so they can never collide with a bare key.
  pub fn to_key(&self) -> String {
    match self {
      OptionPath::Key(key) => key.clone(),
      OptionPath::Path(path) => {
        // Serializing a list of strings cannot fail
        let encoded = serde_json::to_string(path).unwrap_or_default();
        format!("{ARRAY_KEY_PREFIX}{encoded}")
      }
    }
  }

  pub fn from_key(key: &str) -> Self {
    if let Some(encoded) = key.strip_prefix(ARRAY_KEY_PREFIX) {
      if let Ok(path) = serde_json::from_str::<Vec<String>>(encoded) {
        return OptionPath::Path(path);
      }
    }

    OptionPath::Key(key.to_string())
  }

  /// Segments of the path, a bare key being a path of length one
  pub fn segments(&self) -> Vec<&str> {
    match self {
      OptionPath::Key(key) => vec![key.as_str()],
      OptionPath::Path(path) => path.iter().map(String::as_str).collect(),
    }
  }

  pub fn top_level_key(&self) -> Option<&str> {
    self.segments().first().copied()
  }

  /// Look up the value this path points at. Array elements are addressed by their index.
  pub fn resolve<'a>(&self, options: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
    self
      .segments()
      .into_iter()
      .try_fold(options, |value, segment| match value {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
      })
  }
}

impl Display for OptionPath {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.is_root() {
      return write!(f, "{ROOT_OPTION_MARKER}");
    }

    write!(f, "{}", self.segments().join("."))
  }
}

impl From<&str> for OptionPath {
  fn from(key: &str) -> Self {
    OptionPath::Key(key.to_string())
  }
}

impl From<String> for OptionPath {
  fn from(key: String) -> Self {
    OptionPath::Key(key)
  }
}

impl From<Vec<String>> for OptionPath {
  fn from(path: Vec<String>) -> Self {
    OptionPath::Path(path)
  }
}

impl From<&[&str]> for OptionPath {
  fn from(path: &[&str]) -> Self {
    OptionPath::Path(path.iter().map(|s| s.to_string()).collect())
  }
}

impl<const N: usize> From<[&str; N]> for OptionPath {
  fn from(path: [&str; N]) -> Self {
    OptionPath::Path(path.iter().map(|s| s.to_string()).collect())
  }
}
