//! Diagnostic tracing for pilot.
//!
//! Tracing is for developers: it goes to stderr and is not persisted. The
//! record of what happened to an app lives in the project store (`io/store`),
//! which is written regardless of `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the filter is `warn`, or
/// `warn,pilot=debug` when `verbose` is requested on the command line.
///
/// # Example
/// ```bash
/// RUST_LOG=pilot::debugger=debug pilot --app-id 1f0c...
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,pilot=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .compact(),
        )
        .init();
}
