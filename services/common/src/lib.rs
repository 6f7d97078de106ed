//! Common utilities shared by the dispatch service binaries

pub mod constants;
pub mod shutdown;
pub mod telemetry;

pub use constants::*;
pub use shutdown::*;
pub use telemetry::*;
