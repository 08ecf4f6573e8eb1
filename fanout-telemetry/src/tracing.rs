//! Tracing subscriber setup.
//!
//! Production binaries emit JSON lines through a non-blocking writer, development builds use the
//! human readable formatter. The returned [`LogFlusher`] must be kept alive for the duration of
//! the process so that buffered lines are flushed on exit.

use std::io;
use std::sync::Once;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable selecting the runtime environment.
const APP_ENVIRONMENT_ENV_NAME: &str = "APP_ENVIRONMENT";

/// Environment variable enabling log output in tests.
const ENABLE_TEST_TRACING_ENV_NAME: &str = "ENABLE_TRACING";

/// Default directive used when `RUST_LOG` is not set.
const DEFAULT_LOG_DIRECTIVE: &str = "info";

static INIT_TEST_TRACING: Once = Once::new();

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    /// The `log` crate bridge could not be installed.
    #[error("failed to install the log bridge: {0}")]
    LogBridge(#[from] tracing_log::log_tracer::SetLoggerError),

    /// A global subscriber is already installed.
    #[error("failed to install the tracing subscriber: {0}")]
    Subscriber(#[from] ::tracing::subscriber::SetGlobalDefaultError),

    /// `RUST_LOG` could not be parsed.
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
}

/// Keeps the non-blocking writer alive and flushes it on drop.
#[derive(Debug)]
#[must_use = "dropping the flusher stops log output"]
pub struct LogFlusher {
    _guard: WorkerGuard,
}

/// Installs the global subscriber for a service.
///
/// Records from the `log` crate are forwarded to the subscriber. The `app` name and, when
/// given, the `pipeline_id` are logged once the subscriber is installed.
pub fn init_tracing(app_name: &str, pipeline_id: Option<u64>) -> Result<LogFlusher, TracingError> {
    tracing_log::LogTracer::init()?;

    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives)?,
        Err(_) => EnvFilter::new(DEFAULT_LOG_DIRECTIVE),
    };

    let (writer, guard) = tracing_appender::non_blocking(io::stdout());
    let is_prod = std::env::var(APP_ENVIRONMENT_ENV_NAME)
        .map(|env| env.eq_ignore_ascii_case("prod"))
        .unwrap_or(false);

    if is_prod {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true).with_writer(writer));
        ::tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(writer));
        ::tracing::subscriber::set_global_default(subscriber)?;
    }

    ::tracing::info!(app = app_name, pipeline_id, "tracing initialized");

    Ok(LogFlusher { _guard: guard })
}

/// Installs a test subscriber once per process when `ENABLE_TRACING` is set.
///
/// Output goes through the test writer so it is captured per test.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var(ENABLE_TEST_TRACING_ENV_NAME).is_err() {
            return;
        }

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}
