//! Tracing setup.
//!
//! `RUST_LOG` wins when set; otherwise the caller's default directives apply.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directives used by the `chronicle-node` binary.
pub const DEFAULT_DIRECTIVES: &str = "warn,chronicle=info";

fn filter(default_directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directives.into())
}

/// Install the global subscriber. Panics if one is already installed.
pub fn init(default_directives: &str) {
    tracing_subscriber::registry()
        .with(filter(default_directives))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Install a test-friendly subscriber; repeated calls are no-ops.
pub fn try_init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(filter("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_test_init_is_harmless() {
        try_init_for_tests();
        try_init_for_tests();
        tracing::info!("still alive");
    }
}
