//! Ambient observability: alert delivery and latency histograms. Logging
//! itself goes through `tracing`/`tracing-subscriber` everywhere else in
//! the crate — these two modules cover what a `tracing` subscriber alone
//! doesn't (pushing a message to an operator, summarizing tail latency).

pub mod alerts;
pub mod latency;

pub use alerts::AlertManager;
pub use latency::LatencyTracker;
