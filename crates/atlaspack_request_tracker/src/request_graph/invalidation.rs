use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::hash::hash_json;
use crate::watch::WatchEvent;
use crate::watch::WatchEventType;

use super::file_content_key;
use super::request_graph::InvalidationVisited;
use super::InvalidateReason;
use super::OptionPath;
use super::RequestEdgeType;
use super::RequestGraph;
use super::RequestGraphNode;

/// An option whose value changed, with the number of requests that read it
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OptionInvalidation {
  pub option: String,
  pub count: usize,
}

/// The resources an event can match besides plain file nodes, collected once per batch of events
struct CreateMatchers {
  globs: Vec<(NodeIndex, String)>,
  file_names: HashMap<String, Vec<(NodeIndex, PathBuf)>>,
}

impl<R> RequestGraph<R> {
  fn create_matchers(&self) -> CreateMatchers {
    let mut globs = Vec::new();
    let mut file_names: HashMap<String, Vec<(NodeIndex, PathBuf)>> = HashMap::new();

    for node_index in self.graph.node_indices() {
      match &self.graph[node_index] {
        RequestGraphNode::Glob { pattern } => globs.push((node_index, pattern.clone())),
        RequestGraphNode::FileName {
          file_name,
          above_file_path,
        } => file_names
          .entry(file_name.clone())
          .or_default()
          .push((node_index, above_file_path.clone())),
        _ => {}
      }
    }

    CreateMatchers { globs, file_names }
  }

  /// Requests affected by a single event, i.e. the starting points of the invalidation walk
  fn requests_matching_event(
    &self,
    event: &WatchEvent,
    matchers: &CreateMatchers,
  ) -> Vec<NodeIndex> {
    let mut requests = Vec::new();

    if let Some(file_node) = self.get_node_index(&file_content_key(&event.path)) {
      let edge_type = match event.kind {
        WatchEventType::Create => RequestEdgeType::InvalidatedByCreate,
        WatchEventType::Update => RequestEdgeType::InvalidatedByUpdate,
        WatchEventType::Delete => RequestEdgeType::InvalidatedByDelete,
      };
      requests.extend(self.dependent_requests(file_node, |edge| edge == edge_type));
    }

    if event.kind == WatchEventType::Create {
      if let Some(candidates) = event
        .path
        .file_name()
        .and_then(|file_name| file_name.to_str())
        .and_then(|file_name| matchers.file_names.get(file_name))
      {
        // The new file shadows a lookup when it was created in an ancestor of where the lookup
        // started
        let parent = event.path.parent().unwrap_or(Path::new(""));
        for (node_index, above_file_path) in candidates {
          if above_file_path.starts_with(parent) {
            requests.extend(self.dependent_requests(*node_index, |edge| {
              edge == RequestEdgeType::InvalidatedByCreateAbove
            }));
          }
        }
      }
    }

    if event.kind != WatchEventType::Update && !matchers.globs.is_empty() {
      let path = event.path.to_string_lossy();
      for (node_index, pattern) in &matchers.globs {
        if glob_match::glob_match(pattern, &path) {
          requests.extend(self.dependent_requests(*node_index, |_| true));
        }
      }
    }

    requests
  }

  /// Invalidate every request that used a file, file name lookup or glob touched by `events`.
  ///
  /// `budget` is a batching knob: events are handled in batches of that size (all at once
  /// without one) and each batch shares a single walk, so a request reached by many events is
  /// only visited once per batch. It bounds the walk state held at a time, not the scan of glob
  /// and file name nodes, which happens once per call. The set of invalidated requests and their
  /// reasons are the same either way.
  ///
  /// Returns whether any request was invalidated.
  pub fn respond_to_fs_events(&mut self, events: &[WatchEvent], budget: Option<usize>) -> bool {
    if events.is_empty() {
      return false;
    }

    let matchers = self.create_matchers();
    let batch_size = budget.unwrap_or(events.len()).max(1);
    let mut invalidated = 0;

    for batch in events.chunks(batch_size) {
      let mut visited = InvalidationVisited::new();
      let seeds: Vec<(NodeIndex, InvalidateReason)> = batch
        .iter()
        .flat_map(|event| {
          let reason = event.kind.invalidate_reason();
          self
            .requests_matching_event(event, &matchers)
            .into_iter()
            .map(move |node_index| (node_index, reason))
        })
        .collect();

      for (node_index, reason) in seeds {
        invalidated += self.invalidate_with_parents(node_index, reason, &mut visited);
      }
    }

    tracing::info!(
      events = events.len(),
      invalidated,
      "Responded to file system events"
    );

    invalidated > 0
  }

  /// Compare every option node with `options` and invalidate the requests that read a changed
  /// value. Paths in `blocklist` are left alone.
  pub fn invalidate_option_nodes(
    &mut self,
    options: &serde_json::Value,
    blocklist: Option<&[String]>,
  ) -> Vec<OptionInvalidation> {
    let mut invalidations = Vec::new();

    for node_index in self.option_nodes() {
      let Some(RequestGraphNode::Option { path, hash, .. }) = self.graph.node_weight(node_index)
      else {
        continue;
      };

      let next_hash = path.resolve(options).map(hash_json);
      if next_hash == *hash {
        continue;
      }

      let path = path.clone();
      if blocklist.is_some_and(|blocklist| is_blocked(&path, blocklist)) {
        tracing::debug!(option = %path, "Skipping blocked option change");
        continue;
      }

      let dependents = self.dependent_requests(node_index, |_| true);
      let mut visited = InvalidationVisited::new();
      for dependent in &dependents {
        self.invalidate_with_parents(*dependent, InvalidateReason::OPTION_CHANGE, &mut visited);
      }

      if let Some(RequestGraphNode::Option { hash, .. }) = self.get_node_mut(node_index) {
        *hash = next_hash;
      }

      invalidations.push(OptionInvalidation {
        option: path.to_string(),
        count: dependents.len(),
      });
    }

    invalidations.sort_by(|a, b| a.option.cmp(&b.option));
    tracing::info!(changed = invalidations.len(), "Invalidated option nodes");
    invalidations
  }

  /// Compare every env node with `env` and invalidate the requests that read a changed variable.
  /// Returns the changed keys.
  pub fn invalidate_env_nodes(&mut self, env: &BTreeMap<String, String>) -> Vec<String> {
    let mut changed = Vec::new();

    for node_index in self.get_node_ids_with_prefix("env:") {
      let Some(RequestGraphNode::Env { key, value }) = self.graph.node_weight(node_index) else {
        continue;
      };

      let next_value = env.get(key).cloned();
      if next_value == *value {
        continue;
      }

      let key = key.clone();
      let mut visited = InvalidationVisited::new();
      for dependent in self.dependent_requests(node_index, |_| true) {
        self.invalidate_with_parents(dependent, InvalidateReason::ENV_CHANGE, &mut visited);
      }

      if let Some(RequestGraphNode::Env { value, .. }) = self.get_node_mut(node_index) {
        *value = next_value;
      }

      changed.push(key);
    }

    changed.sort();
    changed
  }

  /// Evict the oldest option nodes until at most `max_count` remain. Requests that read an evicted
  /// option lose track of it, so they are invalidated too.
  pub fn cleanup_excess_option_nodes(&mut self, max_count: usize) -> usize {
    let mut option_nodes: Vec<(u64, NodeIndex)> = self
      .option_nodes()
      .into_iter()
      .filter_map(|node_index| match self.graph.node_weight(node_index) {
        Some(RequestGraphNode::Option { sequence, .. }) => Some((*sequence, node_index)),
        _ => None,
      })
      .collect();

    if option_nodes.len() <= max_count {
      return 0;
    }

    option_nodes.sort();
    let excess = option_nodes.len() - max_count;
    let mut visited = InvalidationVisited::new();

    for (_, node_index) in option_nodes.iter().take(excess) {
      for dependent in self.dependent_requests(*node_index, |_| true) {
        self.invalidate_with_parents(dependent, InvalidateReason::OPTION_CHANGE, &mut visited);
      }
      self.remove_node(*node_index);
    }

    tracing::debug!(removed = excess, "Evicted excess option nodes");
    excess
  }

  fn invalidate_flagged_requests(
    &mut self,
    is_flagged: impl Fn(&super::RequestNode<R>) -> bool,
    reason: InvalidateReason,
  ) -> usize {
    let flagged: Vec<NodeIndex> = self
      .graph
      .node_indices()
      .filter(|node_index| {
        self.graph[*node_index]
          .as_request()
          .is_some_and(&is_flagged)
      })
      .collect();

    self.invalidate_all(flagged, reason)
  }

  /// Invalidate the requests that asked to re-run on every build
  pub fn invalidate_on_build_nodes(&mut self) -> usize {
    self.invalidate_flagged_requests(|request| request.invalidate_on_build, InvalidateReason::STARTUP)
  }

  /// Invalidate the requests that asked to re-run whenever the cache is loaded
  pub fn invalidate_on_startup_nodes(&mut self) -> usize {
    self.invalidate_flagged_requests(
      |request| request.invalidate_on_startup,
      InvalidateReason::STARTUP,
    )
  }
}

fn is_blocked(path: &OptionPath, blocklist: &[String]) -> bool {
  let dotted = path.to_string();
  blocklist
    .iter()
    .any(|entry| *entry == dotted || Some(entry.as_str()) == path.top_level_key())
}
