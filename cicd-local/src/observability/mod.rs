//! Observability utilities.

mod tracing;

pub use self::tracing::{init_tracing, verbosity_filter, LogFormat, SpanTimer, TracingConfig};
