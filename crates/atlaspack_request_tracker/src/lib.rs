//! Incremental request tracking for the Atlaspack bundler.
//!
//! Units of work ([`Request`]s) are memoized in a [`RequestGraph`] together with every file,
//! option and environment variable they read. File-system events and option changes invalidate
//! exactly the requests that depend on them, and the graph is persisted to a
//! [`atlaspack_cache::Cache`] in chunks so that only changed parts are rewritten between builds.
pub use abort::*;
pub use error::*;
pub use options::*;
pub use options_tracker::*;
pub use persistence::CacheStamp;
pub use persistence::ChunkEntry;
pub use persistence::PersistedIndex;
pub use request_graph::*;
pub use request_tracker::*;
pub use watch::*;

pub mod hash;

mod abort;
mod error;
mod options;
mod options_tracker;
mod persistence;
mod request_graph;
mod request_tracker;
mod watch;
