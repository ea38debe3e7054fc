use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Default chunk capacity of the persisted request graph
pub const DEFAULT_NODES_PER_BLOB: usize = 1 << 14;

/// The options the host passes into [`crate::RequestTracker`]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestTrackerOptions {
  /// Stamped onto every persisted chunk. Chunks written under another version are discarded.
  pub cache_version: String,

  /// Stamped onto every persisted chunk next to the version. Hosts derive it from whatever makes
  /// two builds incompatible (entries, mode, project root).
  pub instance_id: String,

  /// Namespace of every blob the tracker writes to the cache
  pub cache_key_prefix: String,

  pub nodes_per_blob: usize,

  /// The build options requests read through [`crate::OptionsTracker`]
  pub options: serde_json::Value,

  pub env: BTreeMap<String, String>,

  pub feature_flags: FeatureFlags,

  /// Top-level option keys that hold services rather than configuration. Reads through these keys
  /// are never tracked.
  pub untracked_option_keys: Vec<String>,

  /// Option paths that never invalidate requests when `feature_flags.option_invalidation_blocklist`
  /// is on. Entries match either a top-level key or a dotted path.
  pub option_invalidation_blocklist: Vec<String>,

  /// Upper bound on the number of option nodes kept in the graph after an option invalidation pass
  pub max_option_nodes: Option<usize>,
}

impl Default for RequestTrackerOptions {
  fn default() -> Self {
    Self {
      cache_version: String::from(env!("CARGO_PKG_VERSION")),
      instance_id: String::new(),
      cache_key_prefix: String::from("request_graph"),
      nodes_per_blob: DEFAULT_NODES_PER_BLOB,
      options: serde_json::Value::Object(Default::default()),
      env: BTreeMap::new(),
      feature_flags: FeatureFlags::default(),
      untracked_option_keys: ["inputFS", "outputFS", "cache", "packageManager", "workerFarm"]
        .into_iter()
        .map(String::from)
        .collect(),
      option_invalidation_blocklist: Vec::new(),
      max_option_nodes: None,
    }
  }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureFlags {
  /// Track the full path of every option read instead of its top-level key
  pub granular_option_invalidation: bool,
  pub option_invalidation_blocklist: bool,
}

impl FeatureFlags {
  pub fn option_tracking_mode(&self) -> OptionTrackingMode {
    if self.granular_option_invalidation {
      OptionTrackingMode::Granular
    } else {
      OptionTrackingMode::Legacy
    }
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OptionTrackingMode {
  /// Report the top-level key of every read
  #[default]
  Legacy,
  /// Report the full path of every read
  Granular,
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn deserializes_partial_options() {
    let options: RequestTrackerOptions = serde_json::from_value(serde_json::json!({
      "instanceId": "abc",
      "nodesPerBlob": 2,
      "featureFlags": { "granularOptionInvalidation": true },
      "options": { "mode": "development" }
    }))
    .unwrap();

    assert_eq!(options.instance_id, "abc");
    assert_eq!(options.nodes_per_blob, 2);
    assert_eq!(options.cache_key_prefix, "request_graph");
    assert_eq!(
      options.feature_flags.option_tracking_mode(),
      OptionTrackingMode::Granular
    );
    assert_eq!(options.options["mode"], "development");
    assert!(options
      .untracked_option_keys
      .contains(&String::from("inputFS")));
  }
}
