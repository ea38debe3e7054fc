use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;
use serde::Deserialize;
use serde::Serialize;

use super::OptionPath;

bitflags! {
  /// Why a request node needs to run again. An empty set means the node is valid.
  #[derive(Debug, Default, Eq, PartialEq, Copy, Clone, Hash)]
  pub struct InvalidateReason: u16 {
    const INITIAL_BUILD = 1 << 0;
    const FILE_CREATE = 1 << 1;
    const FILE_UPDATE = 1 << 2;
    const FILE_DELETE = 1 << 3;
    const ENV_CHANGE = 1 << 4;
    const OPTION_CHANGE = 1 << 5;
    const STARTUP = 1 << 6;
    const ERROR = 1 << 7;
  }
}

impl InvalidateReason {
  pub const VALID: InvalidateReason = InvalidateReason::empty();
}

impl Serialize for InvalidateReason {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    self.bits().serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for InvalidateReason {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let bits = u16::deserialize(deserializer)?;
    Ok(InvalidateReason::from_bits_truncate(bits))
  }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct RequestNode<R> {
  pub content_key: String,
  pub request_type: String,
  pub invalidate_reason: InvalidateReason,
  #[serde(skip)]
  pub result: Option<Arc<R>>,
  /// Cache key of the persisted result, `None` until the current result has been written
  pub result_key: Option<String>,
  pub invalidate_on_startup: bool,
  pub invalidate_on_build: bool,
}

impl<R> RequestNode<R> {
  pub fn new(content_key: String, request_type: String) -> Self {
    Self {
      content_key,
      request_type,
      invalidate_reason: InvalidateReason::INITIAL_BUILD,
      result: None,
      result_key: None,
      invalidate_on_startup: false,
      invalidate_on_build: false,
    }
  }

  pub fn is_valid(&self) -> bool {
    self.invalidate_reason.is_empty() && self.result.is_some()
  }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
#[allow(clippy::large_enum_variant)]
pub enum RequestGraphNode<R> {
  Root,
  Request(RequestNode<R>),
  File {
    path: PathBuf,
  },
  /// "A file named `file_name` exists at or above `above_file_path`"
  FileName {
    file_name: String,
    above_file_path: PathBuf,
  },
  Glob {
    pattern: String,
  },
  Env {
    key: String,
    value: Option<String>,
  },
  Option {
    path: OptionPath,
    /// Hash of the value seen when the node was created or last revalidated
    hash: Option<String>,
    /// Creation order, used to evict the oldest option nodes first
    sequence: u64,
  },
  Error {
    request: String,
    message: String,
  },
}

pub const ROOT_CONTENT_KEY: &str = "root";

impl<R> RequestGraphNode<R> {
  pub fn content_key(&self) -> String {
    match self {
      RequestGraphNode::Root => String::from(ROOT_CONTENT_KEY),
      RequestGraphNode::Request(node) => node.content_key.clone(),
      RequestGraphNode::File { path } => file_content_key(path),
      RequestGraphNode::FileName {
        file_name,
        above_file_path,
      } => file_name_content_key(file_name, above_file_path),
      RequestGraphNode::Glob { pattern } => glob_content_key(pattern),
      RequestGraphNode::Env { key, .. } => env_content_key(key),
      RequestGraphNode::Option { path, .. } => option_content_key(path),
      RequestGraphNode::Error { request, .. } => error_content_key(request),
    }
  }

  pub fn as_request(&self) -> Option<&RequestNode<R>> {
    match self {
      RequestGraphNode::Request(node) => Some(node),
      _ => None,
    }
  }

  pub fn as_request_mut(&mut self) -> Option<&mut RequestNode<R>> {
    match self {
      RequestGraphNode::Request(node) => Some(node),
      _ => None,
    }
  }
}

pub fn file_content_key(path: &std::path::Path) -> String {
  format!("file:{}", path.display())
}

pub fn file_name_content_key(file_name: &str, above_file_path: &std::path::Path) -> String {
  format!("file_name:{}:{}", file_name, above_file_path.display())
}

pub fn glob_content_key(pattern: &str) -> String {
  format!("glob:{}", pattern)
}

pub fn env_content_key(key: &str) -> String {
  format!("env:{}", key)
}

pub const OPTION_CONTENT_KEY_PREFIX: &str = "option:";

pub fn option_content_key(path: &OptionPath) -> String {
  format!("{}{}", OPTION_CONTENT_KEY_PREFIX, path.to_key())
}

pub fn error_content_key(request_content_key: &str) -> String {
  format!("error:{}", request_content_key)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestEdgeType {
  SubRequest,
  InvalidatedByUpdate,
  InvalidatedByDelete,
  InvalidatedByCreate,
  InvalidatedByCreateAbove,
  Error,
}

impl RequestEdgeType {
  /// Every edge other than a sub-request edge records a resource the request used
  pub fn is_used(&self) -> bool {
    !matches!(self, RequestEdgeType::SubRequest)
  }
}

/// What a request can declare a file creation dependency on
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FileCreateInvalidation {
  Path(PathBuf),
  /// Ancestor search for `file_name`, starting at `above_file_path`
  FileName {
    file_name: String,
    above_file_path: PathBuf,
  },
  Glob(String),
}

impl From<PathBuf> for FileCreateInvalidation {
  fn from(path: PathBuf) -> Self {
    FileCreateInvalidation::Path(path)
  }
}

impl From<&str> for FileCreateInvalidation {
  fn from(path: &str) -> Self {
    FileCreateInvalidation::Path(PathBuf::from(path))
  }
}

/// A dependency of a request on state outside of the graph
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Invalidation {
  FileUpdate(PathBuf),
  FileDelete(PathBuf),
  FileCreate(FileCreateInvalidation),
  Option(OptionPath),
  Env(String),
  Startup,
  Build,
}
