// A small support crate shared by the engine: timestamped,
// level-filtered logging.
pub mod timing;
#[macro_use]
pub mod logging;
pub mod log;

pub extern crate lazy_static;
