use tokio_util::sync::CancellationToken;

/// Owner side of an [`AbortSignal`]
#[derive(Clone, Debug, Default)]
pub struct AbortController {
  token: CancellationToken,
}

impl AbortController {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn signal(&self) -> AbortSignal {
    AbortSignal {
      token: self.token.clone(),
    }
  }

  pub fn abort(&self) {
    self.token.cancel();
  }
}

/// Cancellation state shared with in-flight requests and cache writes.
///
/// Once aborted a signal stays aborted.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
  token: CancellationToken,
}

impl AbortSignal {
  pub fn is_aborted(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Resolves once the signal is aborted
  pub async fn aborted(&self) {
    self.token.cancelled().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn abort_is_observed_by_all_signals() {
    let controller = AbortController::new();
    let first = controller.signal();
    let second = first.clone();

    assert!(!first.is_aborted());

    controller.abort();

    first.aborted().await;
    assert!(first.is_aborted());
    assert!(second.is_aborted());
  }
}
