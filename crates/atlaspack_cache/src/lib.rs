use std::sync::Arc;

pub use fs_cache::*;
pub use in_memory::*;

mod fs_cache;
mod in_memory;

pub type CacheRef = Arc<dyn Cache + Sync + Send>;

/// Key-value blob storage used to persist build state between runs.
///
/// Implementations only need to provide plain get/set/delete semantics. Anything structured
/// (chunking, versioning, compression) is layered on top by the callers.
#[mockall::automock]
pub trait Cache {
  /// Read a blob. Returns `Ok(None)` when the key has never been written.
  fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

  fn set_blob(&self, key: &str, blob: &[u8]) -> anyhow::Result<()>;

  /// Delete a blob. Deleting a key that does not exist is not an error.
  fn delete_blob(&self, key: &str) -> anyhow::Result<()>;

  fn has_blob(&self, key: &str) -> anyhow::Result<bool> {
    Ok(self.get_blob(key)?.is_some())
  }
}
