use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::hash::Hasher;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dyn_hash::DynHash;
use parking_lot::Mutex;
use petgraph::graph::NodeIndex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::abort::AbortSignal;
use crate::hash::IdentifierHasher;
use crate::options::OptionTrackingMode;
use crate::options_tracker::OnOptionRead;
use crate::options_tracker::OptionsTracker;
use crate::request_graph::FileCreateInvalidation;
use crate::request_graph::Invalidation;
use crate::request_graph::OptionPath;

use super::RequestTracker;

/// Bounds of the result type shared by all requests of a graph
pub trait RequestResult: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {}

impl<T> RequestResult for T where T: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {}

pub type RunRequestError = anyhow::Error;
pub type RequestId = u64;

#[async_trait]
pub trait Request<R: RequestResult>: DynHash + Send + Sync + Debug + 'static {
  /// Namespaces the id, so that equal fields of different request types never collide.
  ///
  /// Content keys are persisted, so this must stay the same across builds of the host. Compiler
  /// provided names such as `std::any::type_name` are not guaranteed to.
  fn request_type(&self) -> &'static str;

  fn id(&self) -> RequestId {
    let mut hasher = IdentifierHasher::default();
    self.request_type().hash(&mut hasher);
    self.dyn_hash(&mut hasher);
    hasher.finish()
  }

  /// Stable identity of the request node, across builds and processes
  fn content_key(&self) -> String {
    format!("{:016x}", self.id())
  }

  async fn run(
    &self,
    request_context: RunRequestContext<R>,
  ) -> Result<ResultAndInvalidations<R>, RunRequestError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultAndInvalidations<R> {
  pub result: R,
  pub invalidations: Vec<Invalidation>,
}

impl<R> ResultAndInvalidations<R> {
  pub fn new(result: R, invalidations: Vec<Invalidation>) -> Self {
    Self {
      result,
      invalidations,
    }
  }
}

/// Put an option path in the form the tracking mode records reads in, so that a read and a
/// declared dependency on the same option share one node
pub(crate) fn normalize_option_path(mode: OptionTrackingMode, path: OptionPath) -> OptionPath {
  match (mode, path) {
    (OptionTrackingMode::Legacy, OptionPath::Path(segments)) if !segments.is_empty() => {
      OptionPath::Key(segments[0].clone())
    }
    (OptionTrackingMode::Granular, OptionPath::Key(key)) => OptionPath::Path(vec![key]),
    (_, path) => path,
  }
}

/// Everything a request declared while running
pub(crate) struct RunCollector<R> {
  pub(crate) invalidations: Vec<Invalidation>,
  pub(crate) subrequests: Vec<NodeIndex>,
  /// Children whose sub-request edge was created by this run, removed again if the run fails
  pub(crate) added_edges: Vec<NodeIndex>,
  pub(crate) stored_result: Option<R>,
}

impl<R> Default for RunCollector<R> {
  fn default() -> Self {
    Self {
      invalidations: Vec::new(),
      subrequests: Vec::new(),
      added_edges: Vec::new(),
      stored_result: None,
    }
  }
}

pub(crate) type RunCollectorRef<R> = Arc<Mutex<RunCollector<R>>>;

/// The running request, as seen by the sub-requests it spawns
pub(crate) struct ParentRequest<R> {
  pub(crate) node_index: NodeIndex,
  pub(crate) ancestors: Arc<Vec<NodeIndex>>,
  pub(crate) collector: RunCollectorRef<R>,
}

/// This is the API for requests to call back onto the `RequestTracker`.
///
/// We want to avoid exposing internals of the request tracker to the implementations so that we
/// can change this.
pub struct RunRequestContext<R: RequestResult> {
  content_key: String,
  node_index: NodeIndex,
  ancestors: Arc<Vec<NodeIndex>>,
  collector: RunCollectorRef<R>,
  env: Arc<BTreeMap<String, String>>,
  options: OptionsTracker,
  option_tracking_mode: OptionTrackingMode,
  signal: Option<AbortSignal>,
  tracker: RequestTracker<R>,
}

impl<R: RequestResult> RunRequestContext<R> {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    content_key: String,
    node_index: NodeIndex,
    ancestors: Arc<Vec<NodeIndex>>,
    collector: RunCollectorRef<R>,
    env: Arc<BTreeMap<String, String>>,
    options: Arc<serde_json::Value>,
    signal: Option<AbortSignal>,
    tracker: RequestTracker<R>,
  ) -> Self {
    let option_tracking_mode = tracker.config().feature_flags.option_tracking_mode();
    let on_read: OnOptionRead = {
      let collector = collector.clone();
      Arc::new(move |path| {
        collector
          .lock()
          .invalidations
          .push(Invalidation::Option(path))
      })
    };

    let options = OptionsTracker::wrap(
      on_read,
      options,
      option_tracking_mode,
      tracker.config().untracked_option_keys.clone(),
    );

    Self {
      content_key,
      node_index,
      ancestors,
      collector,
      env,
      options,
      option_tracking_mode,
      signal,
      tracker,
    }
  }

  pub fn content_key(&self) -> &str {
    &self.content_key
  }

  /// The signal the request was started with, if any
  pub fn signal(&self) -> Option<&AbortSignal> {
    self.signal.as_ref()
  }

  /// Run a child request to the current request
  pub async fn run_request(&self, request: impl Request<R>) -> anyhow::Result<Arc<R>> {
    let parent = ParentRequest {
      node_index: self.node_index,
      ancestors: self.ancestors.clone(),
      collector: self.collector.clone(),
    };

    self
      .tracker
      .execute(request, Some(parent), false, self.signal.clone())
      .await
  }

  fn add_invalidation(&self, invalidation: Invalidation) {
    self.collector.lock().invalidations.push(invalidation);
  }

  pub fn invalidate_on_file_update(&self, path: impl Into<PathBuf>) {
    self.add_invalidation(Invalidation::FileUpdate(path.into()));
  }

  pub fn invalidate_on_file_delete(&self, path: impl Into<PathBuf>) {
    self.add_invalidation(Invalidation::FileDelete(path.into()));
  }

  pub fn invalidate_on_file_create(&self, invalidation: impl Into<FileCreateInvalidation>) {
    self.add_invalidation(Invalidation::FileCreate(invalidation.into()));
  }

  /// Depend on an option without reading it through [`RunRequestContext::options`]
  pub fn invalidate_on_option_change(&self, path: impl Into<OptionPath>) {
    let path = normalize_option_path(self.option_tracking_mode, path.into());
    self.add_invalidation(Invalidation::Option(path));
  }

  pub fn invalidate_on_env_change(&self, key: impl Into<String>) {
    self.add_invalidation(Invalidation::Env(key.into()));
  }

  /// Read an environment variable and depend on its value
  pub fn env(&self, key: &str) -> Option<String> {
    self.invalidate_on_env_change(key);
    self.env.get(key).cloned()
  }

  /// Re-run this request every time the graph is loaded from the cache
  pub fn invalidate_on_startup(&self) {
    self.add_invalidation(Invalidation::Startup);
  }

  /// Re-run this request on every build
  pub fn invalidate_on_build(&self) {
    self.add_invalidation(Invalidation::Build);
  }

  /// The build options. Every value read through the returned tracker becomes a dependency.
  pub fn options(&self) -> &OptionsTracker {
    &self.options
  }

  /// Set the result of the request, taking precedence over the result `run` returns
  pub fn store_result(&self, result: R) {
    self.collector.lock().stored_result = Some(result);
  }
}

impl<R: RequestResult> Debug for RunRequestContext<R> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RunRequestContext")
      .field("content_key", &self.content_key)
      .finish_non_exhaustive()
  }
}
