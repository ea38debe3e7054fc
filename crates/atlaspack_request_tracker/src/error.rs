/// Errors raised by the request tracker itself.
///
/// Failures of a request's own work are not represented here; they are `anyhow::Error`s returned
/// verbatim from `run_request`.
#[derive(Debug, thiserror::Error)]
pub enum RequestTrackerError {
  #[error("Unknown request graph node: {0}")]
  UnknownNode(String),

  #[error("Cannot add an edge from {from} to {to}, one of the endpoints does not exist")]
  MissingEdgeEndpoint { from: String, to: String },

  #[error("Request was cancelled")]
  Cancelled,

  #[error("Request {0} depends on itself")]
  RequestCycle(String),

  #[error("Corrupt request graph cache entry: {0}")]
  CacheCorrupt(String),
}

impl RequestTrackerError {
  /// True if `error` is (or wraps) a cancellation of the request tracker
  pub fn is_cancelled(error: &anyhow::Error) -> bool {
    matches!(
      error.downcast_ref::<RequestTrackerError>(),
      Some(RequestTrackerError::Cancelled)
    )
  }
}
