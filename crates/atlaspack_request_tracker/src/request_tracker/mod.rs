pub use self::request::*;
pub use self::request_tracker::*;

mod request;

#[allow(clippy::module_inception)]
mod request_tracker;
