use config::Environment;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Errors that can occur while initializing telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to load the environment: {0}")]
    Environment(#[from] std::io::Error),

    #[error("Failed to redirect log records to tracing: {0}")]
    LogTracer(#[from] tracing_log::log::SetLoggerError),

    #[error("Failed to install the tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Initializes the tracing stack for a binary.
///
/// Log records emitted through the `log` facade are redirected into tracing.
/// The filter comes from `RUST_LOG` and defaults to `info`. In dev the output
/// is human-readable ANSI; in prod and staging it is JSON, written through a
/// non-blocking appender.
///
/// The returned [`WorkerGuard`] must be kept alive for the lifetime of the
/// process, otherwise buffered log lines are lost on shutdown.
pub fn init_tracing(app_name: &str) -> Result<WorkerGuard, TelemetryError> {
    LogTracer::init()?;

    let environment = Environment::load()?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let fmt_layer = if environment.is_prod() {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!(app_name, environment = %environment, "telemetry initialized");

    Ok(guard)
}
