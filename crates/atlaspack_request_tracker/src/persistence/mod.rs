//! Chunked persistence of the request graph.
//!
//! Nodes are grouped into chunks of `nodes_per_blob` consecutive node indices. Every chunk is one
//! blob holding its nodes with their outgoing edges. Request results are stored in their own blobs.
//! An index blob, written last, lists the chunks of the last committed write together with the
//! version and instance that wrote them.
//!
//! Blob keys carry the generation of the write that produced them, so a write that is interrupted
//! never overwrites anything the committed index still points at.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use atlaspack_cache::Cache;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::Deserialize;
use serde::Serialize;

use crate::abort::AbortSignal;
use crate::options::RequestTrackerOptions;
use crate::request_graph::InvalidateReason;
use crate::request_graph::RequestEdgeType;
use crate::request_graph::RequestGraph;
use crate::request_graph::RequestGraphNode;
use crate::request_graph::RequestNode;
use crate::request_tracker::RequestResult;
use crate::RequestTrackerError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStamp {
  pub version: String,
  pub instance_id: String,
}

impl From<&RequestTrackerOptions> for CacheStamp {
  fn from(options: &RequestTrackerOptions) -> Self {
    Self {
      version: options.cache_version.clone(),
      instance_id: options.instance_id.clone(),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEntry {
  pub key: String,
  pub stamp: CacheStamp,
  pub node_count: usize,
}

/// The index blob
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedIndex {
  pub generation: u64,
  pub nodes_per_blob: usize,
  pub next_option_sequence: u64,
  pub chunks: BTreeMap<usize, ChunkEntry>,
}

type EdgeRecord = (usize, RequestEdgeType);

/// A node as written to a chunk: its index, the node and its outgoing edges
type NodeRecord<R> = (usize, RequestGraphNode<R>, Vec<EdgeRecord>);

#[derive(Serialize)]
#[serde(untagged, bound = "")]
enum NodeOut<'a, R> {
  Borrowed(&'a RequestGraphNode<R>),
  Owned(RequestGraphNode<R>),
}

fn index_key(prefix: &str) -> String {
  format!("{prefix}/index")
}

fn chunk_key(prefix: &str, chunk: usize, generation: u64) -> String {
  format!("{prefix}/nodes/{chunk}-{generation}")
}

fn result_key(prefix: &str, content_key: &str, generation: u64) -> String {
  format!("{prefix}/results/{content_key}-{generation}")
}

fn is_aborted(signal: Option<&AbortSignal>) -> bool {
  signal.is_some_and(AbortSignal::is_aborted)
}

fn encode<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<Vec<u8>> {
  let json = serde_json::to_vec(value)?;
  Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
  let json = lz4_flex::decompress_size_prepended(bytes)?;
  Ok(serde_json::from_slice(&json)?)
}

/// Running requests are written as if they had never completed, so they run again after a restart
fn node_for_write<R>(graph: &RequestGraph<R>, node_index: NodeIndex) -> Option<NodeOut<'_, R>> {
  let node = graph.graph.node_weight(node_index)?;

  match node {
    RequestGraphNode::Request(request) if graph.incomplete_nodes.contains(&node_index) => {
      let mut incomplete = RequestNode::new(request.content_key.clone(), request.request_type.clone());
      incomplete.invalidate_reason = request.invalidate_reason | InvalidateReason::STARTUP;
      incomplete.invalidate_on_startup = request.invalidate_on_startup;
      incomplete.invalidate_on_build = request.invalidate_on_build;
      Some(NodeOut::Owned(RequestGraphNode::Request(incomplete)))
    }
    node => Some(NodeOut::Borrowed(node)),
  }
}

/// Write the parts of the graph that changed since the last write.
pub(crate) fn write_to_cache<R: RequestResult>(
  graph: &mut RequestGraph<R>,
  persisted: &mut PersistedIndex,
  cache: &dyn Cache,
  options: &RequestTrackerOptions,
  signal: Option<&AbortSignal>,
) -> anyhow::Result<()> {
  if is_aborted(signal) {
    tracing::debug!("Signal already aborted, skipping cache write");
    return Ok(());
  }

  let generation = persisted.generation + 1;
  let prefix = options.cache_key_prefix.as_str();
  let mut written = Vec::new();

  // Results first, so that the chunks below capture their keys
  let mut new_results = Vec::new();
  let outcome = write_results(graph, cache, prefix, generation, signal, &mut written, &mut new_results)
    .and_then(|completed| {
      if !completed {
        return Ok(None);
      }
      write_chunks(graph, persisted, cache, options, generation, signal, &mut written)
    });

  let committed = match outcome {
    Ok(Some(committed)) => committed,
    Ok(None) => {
      tracing::info!("Cache write aborted");
      rollback(graph, cache, &new_results, &written);
      return Ok(());
    }
    Err(error) => {
      rollback(graph, cache, &new_results, &written);
      return Err(error);
    }
  };

  let CommittedWrite { index, superseded } = committed;
  tracing::info!(
    generation,
    chunks = index.chunks.len(),
    results = new_results.len(),
    "Wrote request graph to cache"
  );

  *persisted = index;
  graph.dirty_nodes.clear();

  let stale: Vec<String> = std::mem::take(&mut graph.stale_blobs)
    .into_iter()
    .chain(superseded)
    .collect();
  for key in stale {
    if let Err(error) = cache.delete_blob(&key) {
      tracing::warn!(%key, %error, "Failed to delete stale cache blob");
    }
  }

  Ok(())
}

/// Returns false if the signal fired before all results were written
fn write_results<R: RequestResult>(
  graph: &mut RequestGraph<R>,
  cache: &dyn Cache,
  prefix: &str,
  generation: u64,
  signal: Option<&AbortSignal>,
  written: &mut Vec<String>,
  new_results: &mut Vec<NodeIndex>,
) -> anyhow::Result<bool> {
  let pending: Vec<(NodeIndex, String, Arc<R>)> = graph
    .graph
    .node_indices()
    .filter_map(|node_index| match graph.graph.node_weight(node_index) {
      Some(RequestGraphNode::Request(RequestNode {
        content_key,
        result: Some(result),
        result_key: None,
        ..
      })) if !graph.incomplete_nodes.contains(&node_index) => {
        Some((node_index, content_key.clone(), result.clone()))
      }
      _ => None,
    })
    .collect();

  for (node_index, content_key, result) in pending {
    if is_aborted(signal) {
      return Ok(false);
    }

    let key = result_key(prefix, &content_key, generation);
    let bytes = encode(result.as_ref())
      .with_context(|| format!("Failed to serialize result of request {content_key}"))?;
    cache.set_blob(&key, &bytes)?;
    written.push(key.clone());

    if let Some(RequestGraphNode::Request(request)) = graph.get_node_mut(node_index) {
      request.result_key = Some(key);
      new_results.push(node_index);
    }
  }

  Ok(true)
}

struct CommittedWrite {
  index: PersistedIndex,
  superseded: Vec<String>,
}

/// Rewrite the dirty chunks, then the index. Returns `None` if the signal fired first.
fn write_chunks<R: RequestResult>(
  graph: &RequestGraph<R>,
  persisted: &PersistedIndex,
  cache: &dyn Cache,
  options: &RequestTrackerOptions,
  generation: u64,
  signal: Option<&AbortSignal>,
  written: &mut Vec<String>,
) -> anyhow::Result<Option<CommittedWrite>> {
  let prefix = options.cache_key_prefix.as_str();
  let nodes_per_blob = options.nodes_per_blob.max(1);
  let stamp = CacheStamp::from(options);

  let mut dirty_chunks: BTreeSet<usize> = graph
    .dirty_nodes
    .iter()
    .map(|index| index / nodes_per_blob)
    .collect();

  // Chunks written under another stamp or layout are rewritten as a whole
  let relayout = persisted.nodes_per_blob != nodes_per_blob;
  for (chunk, entry) in &persisted.chunks {
    if relayout || entry.stamp != stamp {
      dirty_chunks.insert(*chunk);
    }
  }
  if relayout {
    dirty_chunks.extend(
      graph
        .graph
        .node_indices()
        .map(|node_index| node_index.index() / nodes_per_blob),
    );
  }

  let mut chunk_nodes: BTreeMap<usize, Vec<NodeIndex>> =
    dirty_chunks.iter().map(|chunk| (*chunk, Vec::new())).collect();
  for node_index in graph.graph.node_indices() {
    if let Some(nodes) = chunk_nodes.get_mut(&(node_index.index() / nodes_per_blob)) {
      nodes.push(node_index);
    }
  }

  let mut chunks = if relayout {
    BTreeMap::new()
  } else {
    persisted.chunks.clone()
  };
  let mut superseded: Vec<String> = if relayout {
    persisted.chunks.values().map(|entry| entry.key.clone()).collect()
  } else {
    Vec::new()
  };

  for (chunk, nodes) in chunk_nodes {
    if is_aborted(signal) {
      return Ok(None);
    }

    if nodes.is_empty() {
      if let Some(previous) = chunks.remove(&chunk) {
        superseded.push(previous.key);
      }
      continue;
    }

    let records: Vec<(usize, NodeOut<'_, R>, Vec<EdgeRecord>)> = nodes
      .iter()
      .filter_map(|node_index| {
        let node = node_for_write(graph, *node_index)?;
        let edges = graph
          .graph
          .edges_directed(*node_index, Direction::Outgoing)
          .map(|edge| (edge.target().index(), *edge.weight()))
          .collect();
        Some((node_index.index(), node, edges))
      })
      .collect();

    let key = chunk_key(prefix, chunk, generation);
    let bytes = encode(&records)?;
    cache.set_blob(&key, &bytes)?;
    written.push(key.clone());

    tracing::trace!(chunk, nodes = records.len(), "Wrote request graph chunk");
    let entry = ChunkEntry {
      key,
      stamp: stamp.clone(),
      node_count: records.len(),
    };
    if let Some(previous) = chunks.insert(chunk, entry) {
      if !relayout {
        superseded.push(previous.key);
      }
    }
  }

  if is_aborted(signal) {
    return Ok(None);
  }

  let index = PersistedIndex {
    generation,
    nodes_per_blob,
    next_option_sequence: graph.next_option_sequence,
    chunks,
  };
  cache.set_blob(&index_key(prefix), &serde_json::to_vec(&index)?)?;

  Ok(Some(CommittedWrite { index, superseded }))
}

/// Undo an uncommitted write. Blobs of the failed generation are unreferenced, so they go too.
fn rollback<R>(
  graph: &mut RequestGraph<R>,
  cache: &dyn Cache,
  new_results: &[NodeIndex],
  written: &[String],
) {
  for node_index in new_results {
    if let Some(RequestGraphNode::Request(request)) = graph.graph.node_weight_mut(*node_index) {
      request.result_key = None;
    }
  }

  for key in written {
    if let Err(error) = cache.delete_blob(key) {
      tracing::warn!(%key, %error, "Failed to delete unreferenced cache blob");
    }
  }
}

fn read_index(cache: &dyn Cache, prefix: &str) -> Option<PersistedIndex> {
  let bytes = match cache.get_blob(&index_key(prefix)) {
    Ok(Some(bytes)) => bytes,
    Ok(None) => return None,
    Err(error) => {
      tracing::warn!(%error, "Failed to read request graph index");
      return None;
    }
  };

  match serde_json::from_slice(&bytes) {
    Ok(index) => Some(index),
    Err(error) => {
      tracing::warn!(%error, "Discarding corrupt request graph index");
      None
    }
  }
}

fn read_chunk<R: RequestResult>(
  cache: &dyn Cache,
  entry: &ChunkEntry,
) -> anyhow::Result<Vec<NodeRecord<R>>> {
  let bytes = cache
    .get_blob(&entry.key)?
    .ok_or_else(|| RequestTrackerError::CacheCorrupt(format!("missing chunk {}", entry.key)))?;

  decode(&bytes).map_err(|error| {
    RequestTrackerError::CacheCorrupt(format!("{}: {error:#}", entry.key)).into()
  })
}

fn read_result<R: RequestResult>(cache: &dyn Cache, key: &str) -> anyhow::Result<R> {
  let bytes = cache
    .get_blob(key)?
    .ok_or_else(|| RequestTrackerError::CacheCorrupt(format!("missing result {key}")))?;

  decode(&bytes)
}

/// Load the graph written by the last committed [`write_to_cache`] under the same stamp.
///
/// Whatever can not be read is dropped. An unusable index yields an empty graph.
pub(crate) fn load<R: RequestResult>(
  cache: &dyn Cache,
  options: &RequestTrackerOptions,
) -> (RequestGraph<R>, PersistedIndex) {
  let prefix = options.cache_key_prefix.as_str();
  let Some(index) = read_index(cache, prefix) else {
    tracing::debug!("No request graph in cache");
    return (RequestGraph::new(), PersistedIndex::default());
  };

  let stamp = CacheStamp::from(options);
  let mut stale_blobs = Vec::new();
  let mut chunks = BTreeMap::new();
  let mut records: BTreeMap<usize, (RequestGraphNode<R>, Vec<EdgeRecord>)> = BTreeMap::new();

  for (chunk, entry) in &index.chunks {
    if index.nodes_per_blob != options.nodes_per_blob || entry.stamp != stamp {
      tracing::debug!(chunk, stamp = ?entry.stamp, "Discarding stale request graph chunk");
      stale_blobs.push(entry.key.clone());
      continue;
    }

    match read_chunk::<R>(cache, entry) {
      Ok(chunk_records) => {
        for (node_index, node, edges) in chunk_records {
          records.insert(node_index, (node, edges));
        }
        chunks.insert(*chunk, entry.clone());
      }
      Err(error) => {
        tracing::warn!(chunk, %error, "Dropping unreadable request graph chunk");
        stale_blobs.push(entry.key.clone());
      }
    }
  }

  let cold_index = PersistedIndex {
    generation: index.generation,
    ..PersistedIndex::default()
  };

  if !matches!(records.get(&0), Some((RequestGraphNode::Root, _))) {
    tracing::debug!("Request graph root was not recovered, starting from scratch");
    let mut graph = RequestGraph::new();
    graph.stale_blobs = stale_blobs;
    graph
      .stale_blobs
      .extend(chunks.into_values().map(|entry| entry.key));
    return (graph, cold_index);
  }

  let mut graph = rebuild_graph(records);
  graph.next_option_sequence = index.next_option_sequence;
  graph.stale_blobs.extend(stale_blobs);

  load_results(&mut graph, cache);

  let startup = graph.invalidate_on_startup_nodes();
  tracing::debug!(
    nodes = graph.node_count(),
    invalidated = startup,
    "Rehydrated request graph"
  );

  (
    graph,
    PersistedIndex {
      generation: index.generation,
      nodes_per_blob: index.nodes_per_blob,
      next_option_sequence: index.next_option_sequence,
      chunks,
    },
  )
}

/// Rebuild the graph with every node at the index it was written from
fn rebuild_graph<R>(records: BTreeMap<usize, (RequestGraphNode<R>, Vec<EdgeRecord>)>) -> RequestGraph<R> {
  let mut graph = RequestGraph::new();
  graph.graph.clear();
  graph.content_keys.clear();
  graph.dirty_nodes.clear();

  let max_index = records.keys().next_back().copied().unwrap_or_default();
  let mut nodes: HashMap<usize, RequestGraphNode<R>> = HashMap::new();
  let mut edges: Vec<(usize, Vec<EdgeRecord>)> = Vec::new();
  for (index, (node, node_edges)) in records {
    nodes.insert(index, node);
    edges.push((index, node_edges));
  }

  let mut placeholders = Vec::new();
  for index in 0..=max_index {
    let node_index = match nodes.remove(&index) {
      Some(node) => {
        let content_key = node.content_key();
        let node_index = graph.graph.add_node(node);
        if graph.content_keys.insert(content_key.clone(), node_index).is_some() {
          tracing::warn!(%content_key, "Duplicate content key in request graph cache");
        }
        node_index
      }
      None => {
        let node_index = graph.graph.add_node(RequestGraphNode::Root);
        placeholders.push(node_index);
        node_index
      }
    };
    debug_assert_eq!(node_index.index(), index);
  }

  for placeholder in &placeholders {
    graph.graph.remove_node(*placeholder);
  }

  let missing: HashSet<NodeIndex> = placeholders.into_iter().collect();
  let mut lost_dependencies = Vec::new();

  for (index, node_edges) in edges {
    let source = NodeIndex::new(index);
    for (target, edge_type) in node_edges {
      let target = NodeIndex::new(target);
      if missing.contains(&target) || !graph.graph.contains_node(target) {
        lost_dependencies.push(source);
        continue;
      }
      graph.graph.add_edge(source, target, edge_type);
    }
  }

  let invalid: Vec<NodeIndex> = graph
    .graph
    .node_indices()
    .filter(|node_index| {
      graph.graph[*node_index]
        .as_request()
        .is_some_and(|request| !request.invalidate_reason.is_empty())
    })
    .collect();
  graph.invalid_nodes.extend(invalid);

  for node_index in &lost_dependencies {
    graph.dirty_nodes.insert(node_index.index());
  }
  let invalidated = graph.invalidate_all(lost_dependencies, InvalidateReason::STARTUP);
  if invalidated > 0 {
    tracing::warn!(invalidated, "Requests lost cached dependencies");
  }

  graph
}

/// Read the stored result of every request. Requests whose result can not be read run again.
fn load_results<R: RequestResult>(graph: &mut RequestGraph<R>, cache: &dyn Cache) {
  let mut lost = Vec::new();
  let requests: Vec<(NodeIndex, Option<String>)> = graph
    .graph
    .node_indices()
    .filter_map(|node_index| {
      graph.graph[node_index]
        .as_request()
        .map(|request| (node_index, request.result_key.clone()))
    })
    .collect();

  for (node_index, key) in requests {
    let Some(key) = key else {
      lost.push(node_index);
      continue;
    };

    match read_result::<R>(cache, &key) {
      Ok(result) => {
        if let Some(request) = graph.graph[node_index].as_request_mut() {
          request.result = Some(Arc::new(result));
        }
      }
      Err(error) => {
        tracing::warn!(%key, %error, "Dropping unreadable request result");
        if let Some(request) = graph.graph[node_index].as_request_mut() {
          request.result_key = None;
        }
        graph.stale_blobs.push(key);
        lost.push(node_index);
      }
    }
  }

  // Requests that never completed have no result either, but are already invalid
  let lost: Vec<NodeIndex> = lost
    .into_iter()
    .filter(|node_index| !graph.invalid_nodes.contains(node_index))
    .collect();
  graph.invalidate_all(lost, InvalidateReason::STARTUP);
}

#[cfg(test)]
mod test;
