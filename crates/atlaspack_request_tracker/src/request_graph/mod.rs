pub use self::invalidation::*;
pub use self::node::*;
pub use self::option_path::*;
pub use self::request_graph::*;

mod invalidation;
mod node;
mod option_path;
#[allow(clippy::module_inception)]
mod request_graph;
