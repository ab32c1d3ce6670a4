// Logging: headless tracing setup.
//
// This is a daemon with no terminal UI, so logging always goes straight
// to stdout via `tracing_subscriber::fmt`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global tracing subscriber. `RUST_LOG` takes precedence;
/// otherwise defaults to `proxy_audit=info`, warn everywhere else.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("proxy_audit=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
