use std::path::PathBuf;

use atlaspack_cache::InMemoryCache;
use atlaspack_cache::MockCache;
use pretty_assertions::assert_eq;

use crate::abort::AbortController;
use crate::request_graph::OptionPath;

use super::*;

fn options(nodes_per_blob: usize) -> RequestTrackerOptions {
  RequestTrackerOptions {
    cache_version: String::from("A"),
    instance_id: String::from("instance"),
    nodes_per_blob,
    ..RequestTrackerOptions::default()
  }
}

fn completed_request(graph: &mut RequestGraph<String>, key: &str) -> NodeIndex {
  let root = graph.root();
  let node_index = graph.add_node(RequestGraphNode::Request(RequestNode::new(
    key.to_string(),
    String::from("test"),
  )));
  graph
    .add_edge(root, node_index, RequestEdgeType::SubRequest)
    .unwrap();
  graph.start_request(node_index);
  graph.complete_request(node_index, Arc::new(format!("result of {key}")));
  node_index
}

fn file(graph: &mut RequestGraph<String>, path: &str) -> NodeIndex {
  graph.add_node(RequestGraphNode::File {
    path: PathBuf::from(path),
  })
}

/// Root, two requests, a file and an option: five nodes
fn sample_graph() -> RequestGraph<String> {
  let mut graph = RequestGraph::new();
  let a = completed_request(&mut graph, "a");
  let b = completed_request(&mut graph, "b");
  let file = file(&mut graph, "src/index.js");
  let option = graph.add_option_node(OptionPath::from("mode"), None);

  graph
    .add_edge(a, b, RequestEdgeType::SubRequest)
    .unwrap();
  graph
    .add_edge(b, file, RequestEdgeType::InvalidatedByUpdate)
    .unwrap();
  graph
    .add_edge(a, option, RequestEdgeType::InvalidatedByUpdate)
    .unwrap();
  graph
}

fn write(
  graph: &mut RequestGraph<String>,
  persisted: &mut PersistedIndex,
  cache: &dyn Cache,
  options: &RequestTrackerOptions,
) {
  write_to_cache(graph, persisted, cache, options, None).unwrap();
}

fn sorted_keys(graph: &RequestGraph<String>) -> Vec<String> {
  let mut keys: Vec<String> = graph.content_keys().cloned().collect();
  keys.sort();
  keys
}

fn chunk_keys(cache: &InMemoryCache) -> Vec<String> {
  cache
    .keys()
    .into_iter()
    .filter(|key| key.starts_with("request_graph/nodes/"))
    .collect()
}

#[test]
fn round_trips_across_multiple_chunks() {
  let cache = InMemoryCache::default();
  let options = options(2);
  let mut graph = sample_graph();
  let mut persisted = PersistedIndex::default();

  write(&mut graph, &mut persisted, &cache, &options);

  assert_eq!(graph.node_count(), 5);
  assert_eq!(persisted.chunks.len(), 3);
  assert_eq!(chunk_keys(&cache).len(), 3);

  let (loaded, loaded_index) = load::<String>(&cache, &options);

  assert_eq!(loaded_index, persisted);
  assert_eq!(sorted_keys(&loaded), sorted_keys(&graph));
  assert!(loaded.get_invalid_requests().is_empty());
  for key in ["a", "b"] {
    let request = loaded.get_request(key).unwrap();
    assert_eq!(
      request.result.as_deref(),
      Some(&format!("result of {key}"))
    );
  }

  let a = loaded.get_node_index("a").unwrap();
  let b = loaded.get_node_index("b").unwrap();
  assert!(loaded.has_edge(a, b, RequestEdgeType::SubRequest));
  assert!(loaded.has_edge(loaded.root(), a, RequestEdgeType::SubRequest));
}

#[test]
fn chunks_from_another_version_are_ignored() {
  let cache = InMemoryCache::default();
  let mut graph = sample_graph();
  let mut persisted = PersistedIndex::default();

  write(&mut graph, &mut persisted, &cache, &options(2));

  let other_version = RequestTrackerOptions {
    cache_version: String::from("B"),
    ..options(2)
  };
  let (loaded, _) = load::<String>(&cache, &other_version);

  // Only the root of a fresh graph
  assert_eq!(loaded.node_count(), 1);
  assert!(loaded.get_request("a").is_none());
}

#[test]
fn missing_index_is_a_cold_start() {
  let cache = InMemoryCache::default();

  let (loaded, persisted) = load::<String>(&cache, &options(2));

  assert_eq!(loaded.node_count(), 1);
  assert_eq!(persisted, PersistedIndex::default());
}

#[test]
fn corrupt_chunks_are_dropped_and_dependents_rerun() {
  let cache = InMemoryCache::default();
  let options = options(2);
  let mut graph = sample_graph();
  let mut persisted = PersistedIndex::default();

  write(&mut graph, &mut persisted, &cache, &options);

  // Nodes 2 and 3 are `b` and the file
  let corrupt = persisted.chunks[&1].key.clone();
  cache.set_blob(&corrupt, b"not a chunk").unwrap();

  let (loaded, loaded_index) = load::<String>(&cache, &options);

  assert!(loaded.get_request("b").is_none());
  assert!(loaded.get_node_index("file:src/index.js").is_none());
  assert_eq!(loaded_index.chunks.len(), 2);
  assert_eq!(
    loaded.get_request("a").unwrap().invalidate_reason,
    InvalidateReason::STARTUP
  );
}

#[test]
fn unreadable_results_invalidate_their_request() {
  let cache = InMemoryCache::default();
  let options = options(2);
  let mut graph = sample_graph();
  let mut persisted = PersistedIndex::default();

  write(&mut graph, &mut persisted, &cache, &options);

  let result_key = graph
    .get_request("b")
    .and_then(|request| request.result_key.clone())
    .unwrap();
  cache.delete_blob(&result_key).unwrap();

  let (loaded, _) = load::<String>(&cache, &options);

  let b = loaded.get_request("b").unwrap();
  assert!(b.result.is_none());
  assert_eq!(b.invalidate_reason, InvalidateReason::STARTUP);
  // `a` ran `b`, so it runs again too
  assert_eq!(
    loaded.get_request("a").unwrap().invalidate_reason,
    InvalidateReason::STARTUP
  );
}

#[test]
fn startup_requests_are_invalidated_on_load() {
  let cache = InMemoryCache::default();
  let options = options(2);
  let mut graph = sample_graph();
  let mut persisted = PersistedIndex::default();
  let b = graph.get_node_index("b").unwrap();
  if let Some(RequestGraphNode::Request(request)) = graph.get_node_mut(b) {
    request.invalidate_on_startup = true;
  }

  write(&mut graph, &mut persisted, &cache, &options);
  let (loaded, _) = load::<String>(&cache, &options);

  let invalid: Vec<&str> = loaded
    .get_invalid_requests()
    .iter()
    .map(|request| request.content_key.as_str())
    .collect();
  assert_eq!(invalid, vec!["a", "b"]);
}

#[test]
fn running_requests_are_written_as_incomplete() {
  let cache = InMemoryCache::default();
  let options = options(2);
  let mut graph = sample_graph();
  let mut persisted = PersistedIndex::default();
  let b = graph.get_node_index("b").unwrap();
  graph.start_request(b);

  write(&mut graph, &mut persisted, &cache, &options);
  let (loaded, _) = load::<String>(&cache, &options);

  assert!(loaded
    .get_request("b")
    .unwrap()
    .invalidate_reason
    .contains(InvalidateReason::STARTUP));
}

#[test]
fn aborted_signal_skips_the_write() {
  let cache = InMemoryCache::default();
  let mut graph = sample_graph();
  let mut persisted = PersistedIndex::default();
  let controller = AbortController::new();
  controller.abort();

  write_to_cache(
    &mut graph,
    &mut persisted,
    &cache,
    &options(2),
    Some(&controller.signal()),
  )
  .unwrap();

  assert!(cache.is_empty());
  assert_eq!(persisted, PersistedIndex::default());
}

#[test]
fn abort_during_a_write_keeps_the_previous_cache() {
  let store = Arc::new(InMemoryCache::default());
  let options = options(2);
  let mut graph = sample_graph();
  let mut persisted = PersistedIndex::default();

  write(&mut graph, &mut persisted, store.as_ref(), &options);
  let committed_keys = store.keys();
  let committed = persisted.clone();

  completed_request(&mut graph, "c");

  // The signal fires as soon as the first blob of the next write lands
  let controller = AbortController::new();
  let mut cache = MockCache::new();
  cache.expect_set_blob().returning({
    let store = store.clone();
    let controller = controller.clone();
    move |key, blob| {
      store.set_blob(key, blob)?;
      controller.abort();
      Ok(())
    }
  });
  cache.expect_delete_blob().returning({
    let store = store.clone();
    move |key| store.delete_blob(key)
  });
  cache.expect_get_blob().returning({
    let store = store.clone();
    move |key| store.get_blob(key)
  });

  write_to_cache(
    &mut graph,
    &mut persisted,
    &cache,
    &options,
    Some(&controller.signal()),
  )
  .unwrap();

  assert_eq!(store.keys(), committed_keys);
  assert_eq!(persisted, committed);
  assert_eq!(persisted.generation, 1);
  assert!(graph.get_request("c").unwrap().result_key.is_none());
  assert!(!graph.dirty_nodes.is_empty());

  let (loaded, _) = load::<String>(store.as_ref(), &options);
  assert_eq!(
    sorted_keys(&loaded),
    vec![
      String::from("a"),
      String::from("b"),
      String::from("file:src/index.js"),
      String::from("option:mode"),
      String::from("root")
    ]
  );
}

#[test]
fn only_dirty_chunks_are_rewritten() {
  let cache = InMemoryCache::default();
  let options = options(2);
  let mut graph = sample_graph();
  let mut persisted = PersistedIndex::default();

  write(&mut graph, &mut persisted, &cache, &options);
  let first = persisted.clone();

  // Node 4 is the option node, alone in chunk 2
  let option = graph.get_node_index("option:mode").unwrap();
  graph.add_option_node(OptionPath::from("mode"), Some(String::from("hash")));
  assert_eq!(option.index(), 4);

  write(&mut graph, &mut persisted, &cache, &options);

  assert_eq!(persisted.generation, 2);
  assert_eq!(persisted.chunks[&0], first.chunks[&0]);
  assert_eq!(persisted.chunks[&1], first.chunks[&1]);
  assert_eq!(persisted.chunks[&2].key, "request_graph/nodes/2-2");
  assert_eq!(
    chunk_keys(&cache),
    vec![
      String::from("request_graph/nodes/0-1"),
      String::from("request_graph/nodes/1-1"),
      String::from("request_graph/nodes/2-2"),
    ]
  );
}

#[test]
fn removed_nodes_drop_their_chunk_and_result() {
  let cache = InMemoryCache::default();
  let options = options(2);
  let mut graph = sample_graph();
  let mut persisted = PersistedIndex::default();

  write(&mut graph, &mut persisted, &cache, &options);

  let option = graph.get_node_index("option:mode").unwrap();
  let b = graph.get_node_index("b").unwrap();
  graph.remove_node(option);
  graph.remove_node(b);

  write(&mut graph, &mut persisted, &cache, &options);

  assert!(!persisted.chunks.contains_key(&2));
  assert!(!cache
    .keys()
    .iter()
    .any(|key| key.starts_with("request_graph/results/b-")));

  let (loaded, _) = load::<String>(&cache, &options);
  assert_eq!(
    sorted_keys(&loaded),
    vec![
      String::from("a"),
      String::from("file:src/index.js"),
      String::from("root")
    ]
  );
}

#[test]
fn failed_writes_keep_the_previous_cache() {
  let mut cache = MockCache::new();
  cache
    .expect_set_blob()
    .returning(|_, _| Err(anyhow::anyhow!("disk full")));
  cache.expect_delete_blob().returning(|_| Ok(()));

  let mut graph = sample_graph();
  let mut persisted = PersistedIndex::default();

  let result = write_to_cache(&mut graph, &mut persisted, &cache, &options(2), None);

  assert!(result.is_err());
  assert_eq!(persisted, PersistedIndex::default());
  assert!(graph.get_request("a").unwrap().result_key.is_none());
  assert!(!graph.dirty_nodes.is_empty());
}
