use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use atlaspack_cache::CacheRef;
use parking_lot::Mutex;
use petgraph::graph::NodeIndex;
use serde::Serialize;
use tokio::sync::watch;

use crate::abort::AbortSignal;
use crate::hash::hash_json;
use crate::options::OptionTrackingMode;
use crate::options::RequestTrackerOptions;
use crate::persistence;
use crate::persistence::PersistedIndex;
use crate::request_graph::FileCreateInvalidation;
use crate::request_graph::InvalidateReason;
use crate::request_graph::Invalidation;
use crate::request_graph::OptionInvalidation;
use crate::request_graph::RequestEdgeType;
use crate::request_graph::RequestGraph;
use crate::request_graph::RequestGraphNode;
use crate::request_graph::RequestNode;
use crate::watch::WatchEvent;
use crate::RequestTrackerError;

use super::normalize_option_path;
use super::ParentRequest;
use super::Request;
use super::RequestResult;
use super::ResultAndInvalidations;
use super::RunCollectorRef;
use super::RunRequestContext;

/// How a run of a request ended, as seen by callers waiting on the same run
enum Settled<R> {
  Done(Arc<R>),
  Failed,
}

impl<R> Clone for Settled<R> {
  fn clone(&self) -> Self {
    match self {
      Settled::Done(result) => Settled::Done(result.clone()),
      Settled::Failed => Settled::Failed,
    }
  }
}

type SettledReceiver<R> = watch::Receiver<Option<Settled<R>>>;
type SettledSender<R> = watch::Sender<Option<Settled<R>>>;

pub(crate) struct RequestTrackerState<R> {
  pub(crate) graph: RequestGraph<R>,
  pub(crate) persisted: PersistedIndex,
  /// Requests currently running, keyed by their node
  pending: HashMap<NodeIndex, SettledReceiver<R>>,
  options: Arc<serde_json::Value>,
  env: Arc<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default)]
pub struct RunRequestOptions {
  /// Run the request even if a valid result is cached
  pub force: bool,
  /// Cancels the request and every sub-request it runs
  pub signal: Option<AbortSignal>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InvalidRequest {
  pub content_key: String,
  pub request_type: String,
  pub reason: InvalidateReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RequestError {
  pub content_key: String,
  pub message: String,
}

/// [`RequestTracker`] runs atlaspack work items and constructs a graph of their dependencies.
///
/// Whenever a [`Request`] implementation needs to get the result of another piece of work, it'll
/// make a call into [`RequestTracker`] through its [`RunRequestContext`] abstraction. The request
/// tracker will verify if the piece of work has been completed and return its result. If the work
/// has not been seen yet, or has been invalidated since, it runs it.
///
/// By asking for the result of a piece of work (through [`RunRequestContext::run_request`]) a
/// request is creating an edge between itself and that sub-request. Files, options and env
/// variables the request declares become edges too, and are what invalidations walk.
///
/// ## Concurrency
/// The tracker is a cheap handle and can be cloned into tasks. The graph lives behind a single
/// lock that is never held across an await, so every graph mutation is one atomic step. Two
/// concurrent runs of the same request share a single execution.
pub struct RequestTracker<R: RequestResult> {
  cache: CacheRef,
  config: Arc<RequestTrackerOptions>,
  state: Arc<Mutex<RequestTrackerState<R>>>,
}

impl<R: RequestResult> Clone for RequestTracker<R> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      config: self.config.clone(),
      state: self.state.clone(),
    }
  }
}

enum Prepared<R> {
  Cached(Arc<R>),
  Pending(SettledReceiver<R>),
  Run(PreparedRun<R>),
}

struct PreparedRun<R> {
  node_index: NodeIndex,
  previous_reason: InvalidateReason,
  tx: SettledSender<R>,
  env: Arc<BTreeMap<String, String>>,
  options: Arc<serde_json::Value>,
}

impl<R: RequestResult> RequestTracker<R> {
  /// Create a tracker with an empty graph
  pub fn new(options: RequestTrackerOptions, cache: CacheRef) -> Self {
    Self::from_graph(options, cache, RequestGraph::new(), PersistedIndex::default())
  }

  /// Create a tracker with the graph last written to `cache` under the same version and instance.
  ///
  /// Missing, stale or corrupt cache entries are dropped, so this never fails. Requests whose
  /// dependencies were lost are invalidated.
  #[tracing::instrument(level = "info", skip_all)]
  pub fn init(options: RequestTrackerOptions, cache: CacheRef) -> Self {
    let (graph, persisted) = persistence::load::<R>(cache.as_ref(), &options);
    tracing::info!(nodes = graph.node_count(), "Loaded request graph");
    Self::from_graph(options, cache, graph, persisted)
  }

  fn from_graph(
    mut options: RequestTrackerOptions,
    cache: CacheRef,
    graph: RequestGraph<R>,
    persisted: PersistedIndex,
  ) -> Self {
    let state = RequestTrackerState {
      graph,
      persisted,
      pending: HashMap::new(),
      options: Arc::new(std::mem::take(&mut options.options)),
      env: Arc::new(std::mem::take(&mut options.env)),
    };

    Self {
      cache,
      config: Arc::new(options),
      state: Arc::new(Mutex::new(state)),
    }
  }

  pub(crate) fn config(&self) -> &RequestTrackerOptions {
    &self.config
  }

  /// The options requests currently read
  pub fn options(&self) -> Arc<serde_json::Value> {
    self.state.lock().options.clone()
  }

  /// Run a request that has no parent. Return the result.
  pub async fn run_request(&self, request: impl Request<R>) -> anyhow::Result<Arc<R>> {
    self
      .run_request_with_options(request, RunRequestOptions::default())
      .await
  }

  #[tracing::instrument(level = "debug", skip_all)]
  pub async fn run_request_with_options(
    &self,
    request: impl Request<R>,
    options: RunRequestOptions,
  ) -> anyhow::Result<Arc<R>> {
    tracing::debug!("run_request {:?}", request);
    self
      .execute(request, None, options.force, options.signal)
      .await
  }

  pub(crate) async fn execute(
    &self,
    request: impl Request<R>,
    parent: Option<ParentRequest<R>>,
    force: bool,
    signal: Option<AbortSignal>,
  ) -> anyhow::Result<Arc<R>> {
    let content_key = request.content_key();

    loop {
      match self.prepare(&request, &content_key, parent.as_ref(), force)? {
        Prepared::Cached(result) => {
          tracing::debug!(%content_key, "Using cached request result");
          return Ok(result);
        }
        Prepared::Pending(mut rx) => {
          let settled = match &signal {
            Some(signal) => tokio::select! {
              biased;
              _ = signal.aborted() => return Err(RequestTrackerError::Cancelled.into()),
              settled = wait_for_settled(&mut rx) => settled,
            },
            None => wait_for_settled(&mut rx).await,
          };

          if let Ok(Some(Settled::Done(result))) = settled {
            return Ok(result);
          }

          // A run that failed or was dropped is never reused
          tracing::debug!(%content_key, "Shared run did not complete, running the request again");
        }
        Prepared::Run(prepared) => {
          let ancestors = parent
            .as_ref()
            .map(|parent| parent.ancestors.as_slice())
            .unwrap_or_default();

          return self
            .run(&request, content_key, ancestors, prepared, signal)
            .await;
        }
      }
    }
  }

  /// Find or create the request node, link it to its parent, and decide whether to return a
  /// cached result, wait on a running execution or run the request.
  ///
  /// The sub-request edge to the parent is added here, while the parent is still running, rather
  /// than when the parent commits. Until then invalidation passes and cache writes see the parent
  /// with its previous children plus the new ones. Edges the run added are removed again if the
  /// parent fails or is cancelled, and the parent itself is persisted as incomplete.
  fn prepare(
    &self,
    request: &impl Request<R>,
    content_key: &str,
    parent: Option<&ParentRequest<R>>,
    force: bool,
  ) -> Result<Prepared<R>, RequestTrackerError> {
    let mut state = self.state.lock();

    let node_index = match state.graph.get_node_index(content_key) {
      Some(node_index) => node_index,
      None => state
        .graph
        .add_node(RequestGraphNode::Request(RequestNode::new(
          content_key.to_string(),
          request.request_type().to_string(),
        ))),
    };

    match parent {
      Some(parent) => {
        if node_index == parent.node_index || parent.ancestors.contains(&node_index) {
          return Err(RequestTrackerError::RequestCycle(content_key.to_string()));
        }

        let added = state
          .graph
          .add_edge(parent.node_index, node_index, RequestEdgeType::SubRequest)?;

        let mut collector = parent.collector.lock();
        if added {
          collector.added_edges.push(node_index);
        }
        collector.subrequests.push(node_index);
      }
      None => {
        let root = state.graph.root();
        state
          .graph
          .add_edge(root, node_index, RequestEdgeType::SubRequest)?;
      }
    }

    if let Some(rx) = state.pending.get(&node_index) {
      return Ok(Prepared::Pending(rx.clone()));
    }

    if !force {
      if let Some(RequestGraphNode::Request(RequestNode {
        invalidate_reason,
        result: Some(result),
        ..
      })) = state.graph.get_node(node_index)
      {
        if invalidate_reason.is_empty() {
          return Ok(Prepared::Cached(result.clone()));
        }
      }
    }

    let (tx, rx) = watch::channel(None);
    state.pending.insert(node_index, rx);
    let previous_reason = state.graph.start_request(node_index);

    Ok(Prepared::Run(PreparedRun {
      node_index,
      previous_reason,
      tx,
      env: state.env.clone(),
      options: state.options.clone(),
    }))
  }

  async fn run(
    &self,
    request: &impl Request<R>,
    content_key: String,
    ancestors: &[NodeIndex],
    prepared: PreparedRun<R>,
    signal: Option<AbortSignal>,
  ) -> anyhow::Result<Arc<R>> {
    let PreparedRun {
      node_index,
      previous_reason,
      tx,
      env,
      options,
    } = prepared;

    tracing::debug!(
      %content_key,
      request_type = request.request_type(),
      ?previous_reason,
      "Running request"
    );

    let collector = RunCollectorRef::<R>::default();
    let mut running = RunningRequest {
      state: self.state.clone(),
      node_index,
      previous_reason,
      collector: collector.clone(),
      tx: Some(tx),
    };

    let mut ancestors = ancestors.to_vec();
    ancestors.push(node_index);

    let context = RunRequestContext::new(
      content_key.clone(),
      node_index,
      Arc::new(ancestors),
      collector.clone(),
      env.clone(),
      options.clone(),
      signal.clone(),
      self.clone(),
    );

    // Dropping `running` without settling it is what marks a cancelled run
    let result = match &signal {
      Some(signal) => tokio::select! {
        biased;
        _ = signal.aborted() => {
          tracing::debug!(%content_key, "Request cancelled");
          return Err(RequestTrackerError::Cancelled.into());
        }
        result = request.run(context) => result,
      },
      None => request.run(context).await,
    };

    let mut state = self.state.lock();
    let committed = match result {
      Ok(output) => commit_success(
        &mut state.graph,
        node_index,
        &collector,
        output,
        &options,
        &env,
        self.config.feature_flags.option_tracking_mode(),
      )
      .map_err(anyhow::Error::from),
      Err(error) => Err(error),
    };

    match committed {
      Ok(result) => {
        running.settle(&mut state, Settled::Done(result.clone()));
        Ok(result)
      }
      Err(error) => {
        let message = format!("{error:#}");
        commit_failure(&mut state.graph, node_index, &content_key, &collector, &message);
        running.settle(&mut state, Settled::Failed);
        Err(error)
      }
    }
  }

  /// All request nodes that will run again the next time they are requested
  pub fn get_invalid_requests(&self) -> Vec<InvalidRequest> {
    self
      .state
      .lock()
      .graph
      .get_invalid_requests()
      .into_iter()
      .map(|request| InvalidRequest {
        content_key: request.content_key.clone(),
        request_type: request.request_type.clone(),
        reason: request.invalidate_reason,
      })
      .collect()
  }

  /// Invalidate a request and every request that depends on it through sub-request edges
  pub fn invalidate_node(
    &self,
    content_key: &str,
    reason: InvalidateReason,
  ) -> Result<usize, RequestTrackerError> {
    let mut state = self.state.lock();
    let node_index = state
      .graph
      .get_node_index(content_key)
      .ok_or_else(|| RequestTrackerError::UnknownNode(content_key.to_string()))?;

    state.graph.invalidate_node(node_index, reason)
  }

  #[tracing::instrument(level = "info", skip_all)]
  pub fn respond_to_fs_events(&self, events: &[WatchEvent], budget: Option<usize>) -> bool {
    tracing::info!("Responding to {} watch events", events.len());
    self.state.lock().graph.respond_to_fs_events(events, budget)
  }

  /// Replace the build options, invalidating the requests that read a value that changed
  #[tracing::instrument(level = "info", skip_all)]
  pub fn invalidate_option_nodes(&self, options: serde_json::Value) -> Vec<OptionInvalidation> {
    let blocklist = self
      .config
      .feature_flags
      .option_invalidation_blocklist
      .then_some(self.config.option_invalidation_blocklist.as_slice());

    let mut state = self.state.lock();
    let invalidations = state.graph.invalidate_option_nodes(&options, blocklist);
    state.options = Arc::new(options);

    if let Some(max_option_nodes) = self.config.max_option_nodes {
      state.graph.cleanup_excess_option_nodes(max_option_nodes);
    }

    invalidations
  }

  /// Replace the environment, invalidating the requests that read a variable that changed
  pub fn invalidate_env_nodes(&self, env: BTreeMap<String, String>) -> Vec<String> {
    let mut state = self.state.lock();
    let changed = state.graph.invalidate_env_nodes(&env);
    state.env = Arc::new(env);
    changed
  }

  pub fn cleanup_excess_option_nodes(&self, max_count: usize) -> usize {
    self
      .state
      .lock()
      .graph
      .cleanup_excess_option_nodes(max_count)
  }

  /// Remove every node that is no longer reachable from a top-level request
  pub fn clean_up_orphans(&self) -> Vec<String> {
    self.state.lock().graph.clean_up_orphans()
  }

  /// Hosts call this at the start of every build
  pub fn invalidate_on_build_nodes(&self) -> usize {
    self.state.lock().graph.invalidate_on_build_nodes()
  }

  pub fn get_request_result(&self, content_key: &str) -> Option<Arc<R>> {
    self
      .state
      .lock()
      .graph
      .get_request(content_key)
      .and_then(|request| request.result.clone())
  }

  /// Errors of the requests whose last run failed
  pub fn get_request_errors(&self) -> Vec<RequestError> {
    let state = self.state.lock();
    let mut errors: Vec<RequestError> = state
      .graph
      .get_node_ids_with_prefix("error:")
      .into_iter()
      .filter_map(|node_index| match state.graph.get_node(node_index) {
        Some(RequestGraphNode::Error { request, message }) => Some(RequestError {
          content_key: request.clone(),
          message: message.clone(),
        }),
        _ => None,
      })
      .collect();

    errors.sort_by(|a, b| a.content_key.cmp(&b.content_key));
    errors
  }

  /// Content keys of all nodes whose key starts with `prefix`, sorted
  pub fn get_node_ids_with_prefix(&self, prefix: &str) -> Vec<String> {
    let state = self.state.lock();
    let mut content_keys: Vec<String> = state
      .graph
      .content_keys()
      .filter(|content_key| content_key.starts_with(prefix))
      .cloned()
      .collect();

    content_keys.sort();
    content_keys
  }

  pub fn node_count(&self) -> usize {
    self.state.lock().graph.node_count()
  }

  /// Persist the changes made to the graph since the last write.
  ///
  /// Nothing is written if `signal` is already aborted. If it fires during the write, the write
  /// stops before the new index is committed and the previous cache stays readable.
  #[tracing::instrument(level = "info", skip_all)]
  pub fn write_to_cache(&self, signal: Option<&AbortSignal>) -> anyhow::Result<()> {
    let mut state = self.state.lock();
    let state = &mut *state;

    persistence::write_to_cache(
      &mut state.graph,
      &mut state.persisted,
      self.cache.as_ref(),
      &self.config,
      signal,
    )
  }
}

async fn wait_for_settled<R>(
  rx: &mut SettledReceiver<R>,
) -> Result<Option<Settled<R>>, watch::error::RecvError> {
  let settled = rx.wait_for(Option::is_some).await?;
  Ok(settled.clone())
}

/// Record the outcome of a successful run. The new edge set replaces the previous run's edges.
fn commit_success<R>(
  graph: &mut RequestGraph<R>,
  node_index: NodeIndex,
  collector: &RunCollectorRef<R>,
  output: ResultAndInvalidations<R>,
  options: &serde_json::Value,
  env: &BTreeMap<String, String>,
  option_tracking_mode: OptionTrackingMode,
) -> Result<Arc<R>, RequestTrackerError> {
  let collected = std::mem::take(&mut *collector.lock());
  let result = Arc::new(collected.stored_result.unwrap_or(output.result));

  let mut invalidate_on_startup = false;
  let mut invalidate_on_build = false;
  let mut resources = Vec::new();

  for invalidation in collected
    .invalidations
    .into_iter()
    .chain(output.invalidations)
  {
    let (node, edge_type) = match invalidation {
      Invalidation::FileUpdate(path) => (
        RequestGraphNode::File { path },
        RequestEdgeType::InvalidatedByUpdate,
      ),
      Invalidation::FileDelete(path) => (
        RequestGraphNode::File { path },
        RequestEdgeType::InvalidatedByDelete,
      ),
      Invalidation::FileCreate(FileCreateInvalidation::Path(path)) => (
        RequestGraphNode::File { path },
        RequestEdgeType::InvalidatedByCreate,
      ),
      Invalidation::FileCreate(FileCreateInvalidation::FileName {
        file_name,
        above_file_path,
      }) => (
        RequestGraphNode::FileName {
          file_name,
          above_file_path,
        },
        RequestEdgeType::InvalidatedByCreateAbove,
      ),
      Invalidation::FileCreate(FileCreateInvalidation::Glob(pattern)) => (
        RequestGraphNode::Glob { pattern },
        RequestEdgeType::InvalidatedByCreate,
      ),
      Invalidation::Option(path) => {
        let path = normalize_option_path(option_tracking_mode, path);
        let hash = path.resolve(options).map(hash_json);
        let option_node = graph.add_option_node(path, hash);
        resources.push((option_node, RequestEdgeType::InvalidatedByUpdate));
        continue;
      }
      Invalidation::Env(key) => {
        let value = env.get(&key).cloned();
        let env_node = graph.add_env_node(key, value);
        resources.push((env_node, RequestEdgeType::InvalidatedByUpdate));
        continue;
      }
      Invalidation::Startup => {
        invalidate_on_startup = true;
        continue;
      }
      Invalidation::Build => {
        invalidate_on_build = true;
        continue;
      }
    };

    resources.push((graph.add_node(node), edge_type));
  }

  let removed_subrequests = graph.replace_subrequests(node_index, &collected.subrequests)?;
  let removed_resources = graph.replace_used_resource_edges(node_index, &resources)?;

  if let Some(RequestGraphNode::Request(request)) = graph.get_node_mut(node_index) {
    request.invalidate_on_startup = invalidate_on_startup;
    request.invalidate_on_build = invalidate_on_build;
  }

  let is_valid = graph.complete_request(node_index, result.clone());
  let removed = graph.remove_orphaned_nodes(removed_subrequests.into_iter().chain(removed_resources));

  tracing::debug!(
    index = node_index.index(),
    is_valid,
    removed = removed.len(),
    "Request complete"
  );

  Ok(result)
}

/// Record a failed run. Edges from the previous successful run are kept, the result is dropped and
/// the error is linked to the request.
fn commit_failure<R>(
  graph: &mut RequestGraph<R>,
  node_index: NodeIndex,
  content_key: &str,
  collector: &RunCollectorRef<R>,
  message: &str,
) {
  let added_edges = std::mem::take(&mut collector.lock().added_edges);
  for child in added_edges {
    graph.remove_edge(node_index, child, RequestEdgeType::SubRequest);
  }

  graph.fail_request(node_index, InvalidateReason::ERROR, true);

  tracing::debug!(%content_key, %message, "Request failed");

  let error_node = graph.add_node(RequestGraphNode::Error {
    request: content_key.to_string(),
    message: message.to_string(),
  });
  if let Some(RequestGraphNode::Error { message: current, .. }) = graph.get_node_mut(error_node) {
    *current = message.to_string();
  }

  if let Err(error) = graph.add_edge(node_index, error_node, RequestEdgeType::Error) {
    tracing::warn!(%error, "Failed to link request error");
  }
}

/// A request that has started running. Dropping it before [`RunningRequest::settle`] is called
/// means the run was cancelled.
struct RunningRequest<R> {
  state: Arc<Mutex<RequestTrackerState<R>>>,
  node_index: NodeIndex,
  previous_reason: InvalidateReason,
  collector: RunCollectorRef<R>,
  tx: Option<SettledSender<R>>,
}

impl<R> RunningRequest<R> {
  fn settle(&mut self, state: &mut RequestTrackerState<R>, settled: Settled<R>) {
    if let Some(tx) = self.tx.take() {
      // Nobody waiting is fine
      let _ = tx.send(Some(settled));
    }
    state.pending.remove(&self.node_index);
  }
}

impl<R> Drop for RunningRequest<R> {
  fn drop(&mut self) {
    if self.tx.is_none() {
      return;
    }

    let mut state = self.state.lock();
    let added_edges = std::mem::take(&mut self.collector.lock().added_edges);
    for child in added_edges {
      state
        .graph
        .remove_edge(self.node_index, child, RequestEdgeType::SubRequest);
    }

    // Waiters see the sender go away without a value and settle as cancelled
    state.pending.remove(&self.node_index);
    state.graph.fail_request(
      self.node_index,
      self.previous_reason | InvalidateReason::ERROR,
      false,
    );

    tracing::debug!(index = self.node_index.index(), "Request run dropped");
  }
}
