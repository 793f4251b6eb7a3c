//! Observability setup for plangate: tracing subscriber initialization and
//! optional OpenTelemetry span export.

pub mod tracing_setup;
