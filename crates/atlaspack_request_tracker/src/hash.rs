use xxhash_rust::xxh3::xxh3_64;
use xxhash_rust::xxh3::Xxh3;

/// Hasher used for request ids and captured option values.
///
/// The hashes don't need to be incredibly fast, but they should be stable across
/// runs, machines, platforms and versions, since they end up in the on-disk cache.
pub type IdentifierHasher = Xxh3;

pub fn hash_bytes(s: &[u8]) -> String {
  let res = xxh3_64(s);
  format!("{:016x}", res)
}

/// Hash a JSON value by its serialized form
pub fn hash_json(value: &serde_json::Value) -> String {
  hash_bytes(value.to_string().as_bytes())
}
