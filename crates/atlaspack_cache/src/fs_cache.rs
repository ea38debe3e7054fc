use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

use crate::Cache;

/// Convert a cache key to a safe filesystem path.
/// Sanitizes `..` in path segments to avoid directory traversal.
pub fn get_file_key(cache_dir: &Path, key: &str) -> PathBuf {
  let clean_key = key
    .split('/')
    .map(|part| {
      if part == ".." {
        "$$__parent_dir$$"
      } else {
        part
      }
    })
    .collect::<Vec<_>>()
    .join("/");
  cache_dir.join(clean_key)
}

/// A filesystem-only cache implementation.
/// Stores all blobs on the filesystem under `{cache_dir}/{key}`.
#[derive(Debug)]
pub struct FsCache {
  cache_dir: PathBuf,
}

impl FsCache {
  pub fn new(cache_dir: PathBuf) -> Self {
    Self { cache_dir }
  }

  pub fn cache_dir(&self) -> &Path {
    &self.cache_dir
  }
}

impl Cache for FsCache {
  fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
    let file_path = get_file_key(&self.cache_dir, key);
    match fs::read(&file_path) {
      Ok(blob) => Ok(Some(blob)),
      Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
      Err(error) => Err(error.into()),
    }
  }

  fn set_blob(&self, key: &str, blob: &[u8]) -> anyhow::Result<()> {
    let file_path = get_file_key(&self.cache_dir, key);
    if let Some(parent) = file_path.parent() {
      fs::create_dir_all(parent)?;
    }

    // Write through a sibling temp file so readers never observe a half written blob
    let mut temp_path = file_path.clone().into_os_string();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);
    fs::write(&temp_path, blob)?;
    fs::rename(&temp_path, &file_path)?;

    tracing::trace!(?file_path, bytes = blob.len(), "Wrote blob");
    Ok(())
  }

  fn delete_blob(&self, key: &str) -> anyhow::Result<()> {
    let file_path = get_file_key(&self.cache_dir, key);
    match fs::remove_file(&file_path) {
      Ok(()) => Ok(()),
      Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
      Err(error) => Err(error.into()),
    }
  }

  fn has_blob(&self, key: &str) -> anyhow::Result<bool> {
    Ok(get_file_key(&self.cache_dir, key).is_file())
  }
}
