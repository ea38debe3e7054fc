use std::collections::HashMap;

use parking_lot::RwLock;

use crate::Cache;

/// Process-local cache, used by tests and by hosts that do not want to touch the disk
#[derive(Debug, Default)]
pub struct InMemoryCache {
  store: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryCache {
  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.store.read().keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn len(&self) -> usize {
    self.store.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.store.read().is_empty()
  }
}

impl Cache for InMemoryCache {
  fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
    Ok(self.store.read().get(key).cloned())
  }

  fn set_blob(&self, key: &str, blob: &[u8]) -> anyhow::Result<()> {
    self.store.write().insert(key.to_string(), blob.to_vec());
    Ok(())
  }

  fn delete_blob(&self, key: &str) -> anyhow::Result<()> {
    self.store.write().remove(key);
    Ok(())
  }

  fn has_blob(&self, key: &str) -> anyhow::Result<bool> {
    Ok(self.store.read().contains_key(key))
  }
}

#[cfg(test)]
mod test {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn should_set_value() {
    let cache = InMemoryCache::default();

    cache.set_blob("hello", b"world").expect("Should set value");

    let value = cache
      .get_blob("hello")
      .expect("Should get value")
      .expect("Should get value");

    assert_eq!(value, b"world".to_vec());
  }

  #[test]
  fn should_list_sorted_keys() {
    let cache = InMemoryCache::default();

    cache.set_blob("b", b"").unwrap();
    cache.set_blob("a", b"").unwrap();
    cache.delete_blob("b").unwrap();

    assert_eq!(cache.keys(), vec![String::from("a")]);
    assert_eq!(cache.len(), 1);
  }
}
