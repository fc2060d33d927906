//! Per-call metrics: the sink contract, the collector wrapping one call,
//! and the bundled sinks

mod batch;
mod collector;
mod log_sink;
mod sink;

pub use batch::{BatchOptions, BatchingSink};
pub use collector::MetricsCollector;
pub use log_sink::TracingSink;
pub use sink::{CallMetrics, MetricsContext, MetricsSink};
