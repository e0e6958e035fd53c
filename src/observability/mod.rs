//! Observability: log subscriber setup and request/response debug capture

mod debug;
mod logging;

pub use debug::*;
pub use logging::*;
