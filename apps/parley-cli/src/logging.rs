//! Tracing bootstrap for the console client.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,parley_cli=info,chat_session=info,chat_remote=info";

/// Initialize the global subscriber, writing to stderr so stdout stays the
/// chat transcript.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `PARLEY_CLI_LOG`
/// 3) `PARLEY_LOG`
/// 4) internal default filter
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    for key in ["PARLEY_CLI_LOG", "PARLEY_LOG"] {
        if let Some(value) = env::var(key).ok().filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}
