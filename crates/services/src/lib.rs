#![forbid(unsafe_code)]

pub mod aggregator;
pub mod batch_applier;
pub mod config;
pub mod error;

pub use quiz_core::Clock;

pub use aggregator::AttemptAggregator;
pub use batch_applier::{ApplyOutcome, BatchApplier, attempt_marker_key, chunk_marker_key};
pub use config::AggregatorConfig;
pub use error::{AggregationError, ServicesInitError};
