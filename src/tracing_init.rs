//! Logging setup, grounded in the teacher's `tracing` init module: `RUST_LOG`
//! wins if set, otherwise verbosity count selects a level.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// - 0: error
/// - 1: warn
/// - 2: info
/// - 3: debug
/// - 4+: trace
pub fn init(verbose: u8) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        })
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();
}
