use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;

use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::Dfs;
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::RequestTrackerError;

use super::env_content_key;
use super::option_content_key;
use super::InvalidateReason;
use super::OptionPath;
use super::RequestEdgeType;
use super::RequestGraphNode;
use super::RequestNode;
use super::OPTION_CONTENT_KEY_PREFIX;
use super::ROOT_CONTENT_KEY;

/// Nodes that have been visited by an invalidation walk, per reason
pub(crate) type InvalidationVisited = HashSet<(NodeIndex, InvalidateReason)>;

/// The node store behind [`crate::RequestTracker`].
///
/// Nodes are addressed either by their [`NodeIndex`] or by their content key. Edges point from a
/// request to the sub-requests it ran and the resources it used. Node indices are stable across
/// removals and are what the on-disk chunks are keyed by, so every mutation records the slots it
/// touched in `dirty_nodes`.
pub struct RequestGraph<R> {
  pub(crate) graph: StableDiGraph<RequestGraphNode<R>, RequestEdgeType>,
  pub(crate) root: NodeIndex,
  pub(crate) content_keys: HashMap<String, NodeIndex>,
  pub(crate) invalid_nodes: HashSet<NodeIndex>,
  pub(crate) incomplete_nodes: HashSet<NodeIndex>,
  pub(crate) next_option_sequence: u64,
  pub(crate) dirty_nodes: HashSet<usize>,
  /// Blob keys superseded since the last cache write, deleted once the next index is committed
  pub(crate) stale_blobs: Vec<String>,
}

impl<R> Default for RequestGraph<R> {
  fn default() -> Self {
    Self::new()
  }
}

impl<R> RequestGraph<R> {
  pub fn new() -> Self {
    let mut graph = StableDiGraph::new();
    let root = graph.add_node(RequestGraphNode::Root);

    RequestGraph {
      graph,
      root,
      content_keys: HashMap::from([(String::from(ROOT_CONTENT_KEY), root)]),
      invalid_nodes: HashSet::new(),
      incomplete_nodes: HashSet::new(),
      next_option_sequence: 0,
      dirty_nodes: HashSet::from([root.index()]),
      stale_blobs: Vec::new(),
    }
  }

  pub fn root(&self) -> NodeIndex {
    self.root
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  pub fn content_keys(&self) -> impl Iterator<Item = &String> {
    self.content_keys.keys()
  }

  pub fn get_node_index(&self, content_key: &str) -> Option<NodeIndex> {
    self.content_keys.get(content_key).copied()
  }

  pub fn get_node(&self, node_index: NodeIndex) -> Option<&RequestGraphNode<R>> {
    self.graph.node_weight(node_index)
  }

  pub fn get_node_mut(&mut self, node_index: NodeIndex) -> Option<&mut RequestGraphNode<R>> {
    self.dirty_nodes.insert(node_index.index());
    self.graph.node_weight_mut(node_index)
  }

  pub fn get_request(&self, content_key: &str) -> Option<&RequestNode<R>> {
    self
      .get_node_index(content_key)
      .and_then(|node_index| self.graph.node_weight(node_index))
      .and_then(RequestGraphNode::as_request)
  }

  /// Add a node, or return the existing node with the same content key
  pub fn add_node(&mut self, node: RequestGraphNode<R>) -> NodeIndex {
    let content_key = node.content_key();
    if let Some(node_index) = self.content_keys.get(&content_key) {
      return *node_index;
    }

    let is_invalid = node
      .as_request()
      .is_some_and(|request| !request.invalidate_reason.is_empty());

    let node_index = self.graph.add_node(node);
    if is_invalid {
      self.invalid_nodes.insert(node_index);
    }

    tracing::trace!(%content_key, index = node_index.index(), "Add node");
    self.content_keys.insert(content_key, node_index);
    self.dirty_nodes.insert(node_index.index());
    node_index
  }

  /// Add an option node, or refresh the captured value hash of an existing one
  pub fn add_option_node(&mut self, path: OptionPath, value_hash: Option<String>) -> NodeIndex {
    if let Some(node_index) = self.get_node_index(&option_content_key(&path)) {
      if let Some(RequestGraphNode::Option { hash, .. }) = self.get_node_mut(node_index) {
        *hash = value_hash;
      }
      return node_index;
    }

    let sequence = self.next_option_sequence;
    self.next_option_sequence += 1;
    self.add_node(RequestGraphNode::Option {
      path,
      hash: value_hash,
      sequence,
    })
  }

  /// Add an env node, or refresh the captured value of an existing one
  pub fn add_env_node(&mut self, key: String, env_value: Option<String>) -> NodeIndex {
    if let Some(node_index) = self.get_node_index(&env_content_key(&key)) {
      if let Some(RequestGraphNode::Env { value, .. }) = self.get_node_mut(node_index) {
        *value = env_value;
      }
      return node_index;
    }

    self.add_node(RequestGraphNode::Env {
      key,
      value: env_value,
    })
  }

  /// Remove a node together with all of its edges. The root can not be removed.
  pub fn remove_node(&mut self, node_index: NodeIndex) -> Option<RequestGraphNode<R>> {
    if node_index == self.root {
      return None;
    }

    // Edges are persisted with their source node, so every source needs rewriting
    let sources: Vec<usize> = self
      .graph
      .edges_directed(node_index, Direction::Incoming)
      .map(|edge| edge.source().index())
      .collect();

    let node = self.graph.remove_node(node_index)?;
    let content_key = node.content_key();
    tracing::trace!(%content_key, "Remove node");

    self.dirty_nodes.extend(sources);
    self.dirty_nodes.insert(node_index.index());
    self.content_keys.remove(&content_key);
    self.invalid_nodes.remove(&node_index);
    self.incomplete_nodes.remove(&node_index);

    if let RequestGraphNode::Request(RequestNode {
      result_key: Some(result_key),
      ..
    }) = &node
    {
      self.stale_blobs.push(result_key.clone());
    }

    Some(node)
  }

  fn describe(&self, node_index: NodeIndex) -> String {
    self
      .graph
      .node_weight(node_index)
      .map(RequestGraphNode::content_key)
      .unwrap_or_else(|| format!("#{}", node_index.index()))
  }

  /// Add an edge unless an identical one exists. Returns whether an edge was added.
  pub fn add_edge(
    &mut self,
    from: NodeIndex,
    to: NodeIndex,
    edge_type: RequestEdgeType,
  ) -> Result<bool, RequestTrackerError> {
    if !self.graph.contains_node(from) || !self.graph.contains_node(to) {
      return Err(RequestTrackerError::MissingEdgeEndpoint {
        from: self.describe(from),
        to: self.describe(to),
      });
    }

    if self.has_edge(from, to, edge_type) {
      return Ok(false);
    }

    self.graph.add_edge(from, to, edge_type);
    self.dirty_nodes.insert(from.index());
    Ok(true)
  }

  pub fn has_edge(&self, from: NodeIndex, to: NodeIndex, edge_type: RequestEdgeType) -> bool {
    self
      .graph
      .edges_connecting(from, to)
      .any(|edge| *edge.weight() == edge_type)
  }

  pub fn remove_edge(&mut self, from: NodeIndex, to: NodeIndex, edge_type: RequestEdgeType) -> bool {
    let edge = self
      .graph
      .edges_connecting(from, to)
      .find(|edge| *edge.weight() == edge_type)
      .map(|edge| edge.id());

    let Some(edge) = edge else {
      return false;
    };

    self.graph.remove_edge(edge);
    self.dirty_nodes.insert(from.index());
    true
  }

  pub fn outgoing_edges(&self, node_index: NodeIndex) -> Vec<(NodeIndex, RequestEdgeType)> {
    self
      .graph
      .edges_directed(node_index, Direction::Outgoing)
      .map(|edge| (edge.target(), *edge.weight()))
      .collect()
  }

  pub fn incoming_edges(&self, node_index: NodeIndex) -> Vec<(NodeIndex, RequestEdgeType)> {
    self
      .graph
      .edges_directed(node_index, Direction::Incoming)
      .map(|edge| (edge.source(), *edge.weight()))
      .collect()
  }

  /// Make `subrequests` the exact set of sub-request edges of `node_index`.
  ///
  /// Returns the children that lost their edge. They are not removed here since other requests
  /// may still point at them.
  pub fn replace_subrequests(
    &mut self,
    node_index: NodeIndex,
    subrequests: &[NodeIndex],
  ) -> Result<Vec<NodeIndex>, RequestTrackerError> {
    let keep: HashSet<NodeIndex> = subrequests.iter().copied().collect();
    let removed: Vec<NodeIndex> = self
      .outgoing_edges(node_index)
      .into_iter()
      .filter(|(target, edge_type)| {
        *edge_type == RequestEdgeType::SubRequest && !keep.contains(target)
      })
      .map(|(target, _)| target)
      .collect();

    for target in &removed {
      self.remove_edge(node_index, *target, RequestEdgeType::SubRequest);
    }

    for child in subrequests {
      self.add_edge(node_index, *child, RequestEdgeType::SubRequest)?;
    }

    Ok(removed)
  }

  /// Make `resources` the exact set of used-resource edges of `node_index`.
  ///
  /// Returns the resources that lost their edge.
  pub fn replace_used_resource_edges(
    &mut self,
    node_index: NodeIndex,
    resources: &[(NodeIndex, RequestEdgeType)],
  ) -> Result<Vec<NodeIndex>, RequestTrackerError> {
    let keep: HashSet<(NodeIndex, RequestEdgeType)> = resources.iter().copied().collect();
    let removed: Vec<(NodeIndex, RequestEdgeType)> = self
      .outgoing_edges(node_index)
      .into_iter()
      .filter(|edge| edge.1.is_used() && !keep.contains(edge))
      .collect();

    for (target, edge_type) in &removed {
      self.remove_edge(node_index, *target, *edge_type);
    }

    for (resource, edge_type) in resources {
      self.add_edge(node_index, *resource, *edge_type)?;
    }

    Ok(removed.into_iter().map(|(target, _)| target).collect())
  }

  /// Remove the `candidates` that nothing points at anymore, then anything that only they pointed
  /// at. Running requests are never removed.
  ///
  /// This only catches nodes that lost their last incoming edge; unreachable cycles are left to
  /// [`RequestGraph::clean_up_orphans`].
  pub fn remove_orphaned_nodes(
    &mut self,
    candidates: impl IntoIterator<Item = NodeIndex>,
  ) -> Vec<String> {
    let mut queue: VecDeque<NodeIndex> = candidates.into_iter().collect();
    let mut removed = Vec::new();

    while let Some(node_index) = queue.pop_front() {
      if node_index == self.root
        || !self.graph.contains_node(node_index)
        || self.incomplete_nodes.contains(&node_index)
      {
        continue;
      }

      let has_parents = self
        .graph
        .edges_directed(node_index, Direction::Incoming)
        .next()
        .is_some();
      if has_parents {
        continue;
      }

      let children: Vec<NodeIndex> = self
        .graph
        .neighbors_directed(node_index, Direction::Outgoing)
        .collect();

      if let Some(node) = self.remove_node(node_index) {
        removed.push(node.content_key());
        queue.extend(children);
      }
    }

    removed
  }

  /// Remove every node that can not be reached from the root. Returns their content keys.
  pub fn clean_up_orphans(&mut self) -> Vec<String> {
    let mut reachable = HashSet::new();
    let mut dfs = Dfs::new(&self.graph, self.root);
    while let Some(node_index) = dfs.next(&self.graph) {
      reachable.insert(node_index);
    }

    let orphans: Vec<NodeIndex> = self
      .graph
      .node_indices()
      .filter(|node_index| {
        !reachable.contains(node_index) && !self.incomplete_nodes.contains(node_index)
      })
      .collect();

    let removed: Vec<String> = orphans
      .into_iter()
      .filter_map(|node_index| self.remove_node(node_index))
      .map(|node| node.content_key())
      .collect();

    tracing::debug!(count = removed.len(), "Removed orphaned request graph nodes");
    removed
  }

  /// Set `reason` on a request node and on every request that reached it through sub-request
  /// edges. Returns the number of request nodes touched.
  pub fn invalidate_node(
    &mut self,
    node_index: NodeIndex,
    reason: InvalidateReason,
  ) -> Result<usize, RequestTrackerError> {
    match self.graph.node_weight(node_index) {
      Some(RequestGraphNode::Request(_)) => {}
      Some(node) => return Err(RequestTrackerError::UnknownNode(node.content_key())),
      None => return Err(RequestTrackerError::UnknownNode(self.describe(node_index))),
    }

    let mut visited = InvalidationVisited::new();
    Ok(self.invalidate_with_parents(node_index, reason, &mut visited))
  }

  pub(crate) fn invalidate_with_parents(
    &mut self,
    node_index: NodeIndex,
    reason: InvalidateReason,
    visited: &mut InvalidationVisited,
  ) -> usize {
    let mut count = 0;
    let mut stack = vec![node_index];

    while let Some(node_index) = stack.pop() {
      if !visited.insert((node_index, reason)) {
        continue;
      }

      let Some(RequestGraphNode::Request(request)) = self.graph.node_weight_mut(node_index) else {
        continue;
      };

      request.invalidate_reason |= reason;
      tracing::trace!(content_key = %request.content_key, ?reason, "Invalidate request");

      self.invalid_nodes.insert(node_index);
      self.dirty_nodes.insert(node_index.index());
      count += 1;

      stack.extend(
        self
          .graph
          .edges_directed(node_index, Direction::Incoming)
          .filter(|edge| *edge.weight() == RequestEdgeType::SubRequest)
          .map(|edge| edge.source()),
      );
    }

    count
  }

  pub(crate) fn invalidate_all(
    &mut self,
    nodes: impl IntoIterator<Item = NodeIndex>,
    reason: InvalidateReason,
  ) -> usize {
    let mut visited = InvalidationVisited::new();
    nodes
      .into_iter()
      .map(|node_index| self.invalidate_with_parents(node_index, reason, &mut visited))
      .sum()
  }

  /// Requests that used `resource` through an edge accepted by `accepts`
  pub(crate) fn dependent_requests(
    &self,
    resource: NodeIndex,
    accepts: impl Fn(RequestEdgeType) -> bool,
  ) -> Vec<NodeIndex> {
    self
      .graph
      .edges_directed(resource, Direction::Incoming)
      .filter(|edge| edge.weight().is_used() && accepts(*edge.weight()))
      .map(|edge| edge.source())
      .filter(|source| {
        matches!(
          self.graph.node_weight(*source),
          Some(RequestGraphNode::Request(_))
        )
      })
      .collect()
  }

  pub fn get_invalid_requests(&self) -> Vec<&RequestNode<R>> {
    let mut requests: Vec<&RequestNode<R>> = self
      .invalid_nodes
      .iter()
      .filter_map(|node_index| self.graph.node_weight(*node_index))
      .filter_map(RequestGraphNode::as_request)
      .collect();

    requests.sort_by(|a, b| a.content_key.cmp(&b.content_key));
    requests
  }

  pub fn get_node_ids_with_prefix(&self, prefix: &str) -> Vec<NodeIndex> {
    self
      .content_keys
      .iter()
      .filter(|(content_key, _)| content_key.starts_with(prefix))
      .map(|(_, node_index)| *node_index)
      .collect()
  }

  pub fn option_nodes(&self) -> Vec<NodeIndex> {
    self.get_node_ids_with_prefix(OPTION_CONTENT_KEY_PREFIX)
  }

  /// Mark a request as running. Returns the reason it had before.
  pub(crate) fn start_request(&mut self, node_index: NodeIndex) -> InvalidateReason {
    self.invalid_nodes.remove(&node_index);
    self.incomplete_nodes.insert(node_index);

    match self.get_node_mut(node_index) {
      Some(RequestGraphNode::Request(request)) => {
        std::mem::take(&mut request.invalidate_reason)
      }
      _ => InvalidateReason::VALID,
    }
  }

  /// Store the result of a finished run. The node stays invalid if something invalidated it while
  /// it was running. Returns whether the node is valid.
  pub(crate) fn complete_request(&mut self, node_index: NodeIndex, result: Arc<R>) -> bool {
    self.incomplete_nodes.remove(&node_index);

    let Some(RequestGraphNode::Request(request)) = self.graph.node_weight_mut(node_index) else {
      return false;
    };

    request.result = Some(result);
    let stale_result = request.result_key.take();
    let is_valid = request.invalidate_reason.is_empty();

    self.dirty_nodes.insert(node_index.index());
    self.stale_blobs.extend(stale_result);

    if is_valid {
      self.invalid_nodes.remove(&node_index);
    } else {
      self.invalid_nodes.insert(node_index);
    }

    is_valid
  }

  /// Mark a request whose run did not complete as invalid
  pub(crate) fn fail_request(
    &mut self,
    node_index: NodeIndex,
    reason: InvalidateReason,
    clear_result: bool,
  ) {
    self.incomplete_nodes.remove(&node_index);

    let Some(RequestGraphNode::Request(request)) = self.graph.node_weight_mut(node_index) else {
      return;
    };

    request.invalidate_reason |= reason;
    let stale_result = if clear_result {
      request.result = None;
      request.result_key.take()
    } else {
      None
    };

    self.dirty_nodes.insert(node_index.index());
    self.stale_blobs.extend(stale_result);
    self.invalid_nodes.insert(node_index);
  }
}
