//! Tracing subscriber setup for embedding applications and tests.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the host. [`init_tracing`] is the stock configuration:
//! `RUST_LOG`-style filtering with `info` as the fallback, compact output
//! on stderr.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the default stderr subscriber.
///
/// Returns `false` when a global subscriber was already installed, which
/// is common when several tests in one binary call this.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        let _ = init_tracing("debug");
        assert!(!init_tracing("info"));
    }
}
