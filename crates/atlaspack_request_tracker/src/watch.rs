use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::request_graph::InvalidateReason;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventType {
  Create,
  Update,
  Delete,
}

impl WatchEventType {
  pub fn invalidate_reason(&self) -> InvalidateReason {
    match self {
      WatchEventType::Create => InvalidateReason::FILE_CREATE,
      WatchEventType::Update => InvalidateReason::FILE_UPDATE,
      WatchEventType::Delete => InvalidateReason::FILE_DELETE,
    }
  }
}

/// A file-system change, as produced by the watcher
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
  pub path: PathBuf,
  #[serde(rename = "type")]
  pub kind: WatchEventType,
}

impl WatchEvent {
  pub fn create(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      kind: WatchEventType::Create,
    }
  }

  pub fn update(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      kind: WatchEventType::Update,
    }
  }

  pub fn delete(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      kind: WatchEventType::Delete,
    }
  }
}

pub type WatchEvents = Vec<WatchEvent>;
