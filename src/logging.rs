//! Structured logging setup.

use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log line layout.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
}

/// Install the global subscriber. Later calls are no-ops.
///
/// Logs go to stderr so stdout stays reserved for summaries and CSV.
/// `RUST_LOG` overrides the default `warn` filter.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let registry = tracing_subscriber::registry().with(env_filter);
        match format {
            LogFormat::Compact => registry
                .with(
                    fmt::layer()
                        .compact()
                        .with_thread_names(true)
                        .with_writer(std::io::stderr),
                )
                .init(),
            LogFormat::Pretty => registry
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .init(),
        }
    });
}
