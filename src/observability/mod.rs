//! Observability: structured logging with configurable formats (pretty, compact, JSON).

mod tracing_init;

pub use tracing_init::*;
