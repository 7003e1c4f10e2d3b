//! Logging setup for the cluster service.
//!
//! - **Tracing**: structured logging through `tracing-subscriber`, human
//!   readable or JSON, filtered by `RUST_LOG` or the configured level
//! - **Spans**: `workflow_span!` tags a workflow run with its cluster id

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, parse_level, TracingConfig};
