//! Fallback logging
//!
//! Hosts normally install their own `tracing` subscriber. When none is set,
//! the receiver installs a console subscriber so diagnostics are not lost.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a console subscriber if the process has none.
///
/// Returns `true` when this call installed it.
pub fn install_default_subscriber() -> bool {
    if tracing::dispatcher::has_been_set() {
        return false;
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_noop() {
        install_default_subscriber();
        assert!(!install_default_subscriber());
    }
}
