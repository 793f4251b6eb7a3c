//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! // Human-readable logs only
//! plangate_observe::tracing_setup::init_tracing(false).unwrap();
//!
//! // JSON logs plus OpenTelemetry spans on stdout
//! use plangate_observe::tracing_setup::{init_tracing_with, TracingOptions};
//! init_tracing_with(TracingOptions { enable_otel: true, json: true, ..Default::default() }).unwrap();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the OpenTelemetry tracer.
pub const TRACER_NAME: &str = "plangate";

/// Keeps the OTel tracer provider alive for [`shutdown_tracing`].
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Subscriber settings.
#[derive(Debug, Clone, Default)]
pub struct TracingOptions {
    /// Bridge spans (such as `plan_run`) to OpenTelemetry with a stdout exporter.
    pub enable_otel: bool,
    /// Emit one JSON object per event instead of the human-readable format.
    pub json: bool,
    /// Filter directive used when `RUST_LOG` is unset. Defaults to
    /// [`DEFAULT_FILTER`].
    pub default_filter: Option<String>,
}

/// Initialize the global subscriber with human-readable output.
pub fn init_tracing(enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing_with(TracingOptions {
        enable_otel,
        ..TracingOptions::default()
    })
}

/// Initialize the global subscriber.
///
/// Always installs an `fmt` layer with span close timing, filtered by
/// `RUST_LOG` (or the configured default). With `enable_otel`, spans are
/// additionally exported through OpenTelemetry.
///
/// # Errors
///
/// Fails if a global subscriber is already installed or the filter
/// directive does not parse.
pub fn init_tracing_with(options: TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = build_env_filter(options.default_filter.as_deref())?;

    let fmt_layer = if options.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    };

    if options.enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer(TRACER_NAME);
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

/// `RUST_LOG` if set, otherwise `default` (or [`DEFAULT_FILTER`]).
pub fn build_env_filter(default: Option<&str>) -> Result<EnvFilter, Box<dyn std::error::Error>> {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return Ok(EnvFilter::from_default_env());
    }
    Ok(EnvFilter::try_new(default.unwrap_or(DEFAULT_FILTER))?)
}

/// Flush pending spans and shut down the tracer provider.
///
/// No-op when OpenTelemetry was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
