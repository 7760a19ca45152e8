//! Request middleware, written as `from_fn` functions.

pub mod logging;
pub mod metrics;

pub use logging::request_logging;
pub use metrics::collect_metrics;
