use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::options::OptionTrackingMode;
use crate::request_graph::OptionPath;

/// Called with every distinct option path read through an [`OptionsTracker`]
pub type OnOptionRead = Arc<dyn Fn(OptionPath) + Send + Sync>;

/// Read-tracking view over a JSON options object.
///
/// Nested objects are handed out as [`TrackedObject`]s, and nothing is reported until a leaf value
/// is read or an object's keys are enumerated. Each path is reported at most once per tracker.
///
/// ```ignore
/// let tracker = OptionsTracker::wrap(on_read, options, OptionTrackingMode::Granular, vec![]);
/// let source_maps = tracker.get(&["defaultTargetOptions", "sourceMaps"]);
/// ```
pub struct OptionsTracker {
  on_read: OnOptionRead,
  target: Arc<Value>,
  mode: OptionTrackingMode,
  untracked_keys: Vec<String>,
  reported: Mutex<HashSet<OptionPath>>,
}

impl std::fmt::Debug for OptionsTracker {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OptionsTracker")
      .field("mode", &self.mode)
      .field("untracked_keys", &self.untracked_keys)
      .finish_non_exhaustive()
  }
}

impl OptionsTracker {
  pub fn wrap(
    on_read: OnOptionRead,
    target: Arc<Value>,
    mode: OptionTrackingMode,
    untracked_keys: Vec<String>,
  ) -> Self {
    Self {
      on_read,
      target,
      mode,
      untracked_keys,
      reported: Mutex::new(HashSet::new()),
    }
  }

  pub fn root(&self) -> TrackedObject<'_> {
    TrackedObject {
      tracker: self,
      value: &self.target,
      path: Vec::new(),
    }
  }

  /// Read the value at `path`. Missing values are tracked too, so that adding them later
  /// invalidates the reader.
  pub fn get(&self, path: &[&str]) -> Option<TrackedValue<'_>> {
    let (last, parents) = path.split_last()?;

    let mut object = self.root();
    for segment in parents {
      match object.get(segment)? {
        TrackedValue::Object(child) => object = child,
        _ => return None,
      }
    }

    object.get(last)
  }

  /// Enumerate the keys of the object at `path`, the root for an empty path
  pub fn keys(&self, path: &[&str]) -> Option<Vec<String>> {
    let mut object = self.root();
    for segment in path {
      match object.get(segment)? {
        TrackedValue::Object(child) => object = child,
        _ => return None,
      }
    }

    Some(object.keys())
  }

  fn report(&self, path: &[String]) {
    let option_path = match (self.mode, path.first()) {
      (OptionTrackingMode::Legacy, Some(key)) => OptionPath::Key(key.clone()),
      (OptionTrackingMode::Legacy, None) => OptionPath::root(),
      (OptionTrackingMode::Granular, _) => OptionPath::Path(path.to_vec()),
    };

    if self.reported.lock().insert(option_path.clone()) {
      tracing::trace!(option = %option_path, "Option read");
      (self.on_read)(option_path);
    }
  }
}

/// A value read through an [`OptionsTracker`]
#[derive(Debug)]
pub enum TrackedValue<'a> {
  /// An object or array, itself tracked
  Object(TrackedObject<'a>),
  /// A primitive value. Its path has been reported.
  Leaf(&'a Value),
  /// A value under one of the untracked keys, returned as is
  Untracked(&'a Value),
}

impl<'a> TrackedValue<'a> {
  /// The underlying value. For objects this counts as reading the whole object.
  pub fn value(&self) -> &'a Value {
    match self {
      TrackedValue::Object(object) => object.read(),
      TrackedValue::Leaf(value) | TrackedValue::Untracked(value) => value,
    }
  }
}

#[derive(Debug)]
pub struct TrackedObject<'a> {
  tracker: &'a OptionsTracker,
  value: &'a Value,
  path: Vec<String>,
}

impl<'a> TrackedObject<'a> {
  pub fn path(&self) -> &[String] {
    &self.path
  }

  pub fn get(&self, key: &str) -> Option<TrackedValue<'a>> {
    if self.path.is_empty() && self.tracker.untracked_keys.iter().any(|k| k == key) {
      return self.value.get(key).map(TrackedValue::Untracked);
    }

    let child = match self.value {
      Value::Object(map) => map.get(key),
      Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
      _ => None,
    };

    let mut path = self.path.clone();
    path.push(key.to_string());

    match child {
      Some(value @ (Value::Object(_) | Value::Array(_))) => Some(TrackedValue::Object(TrackedObject {
        tracker: self.tracker,
        value,
        path,
      })),
      Some(value) => {
        self.tracker.report(&path);
        Some(TrackedValue::Leaf(value))
      }
      None => {
        self.tracker.report(&path);
        None
      }
    }
  }

  pub fn keys(&self) -> Vec<String> {
    self.tracker.report(&self.path);

    match self.value {
      Value::Object(map) => map.keys().cloned().collect(),
      Value::Array(items) => (0..items.len()).map(|i| i.to_string()).collect(),
      _ => Vec::new(),
    }
  }

  /// Read the whole object, reporting its own path
  pub fn read(&self) -> &'a Value {
    self.tracker.report(&self.path);
    self.value
  }
}
