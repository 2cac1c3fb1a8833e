//! Console logging through the tracing subsystem.
//!
//! The log level is taken from `RUST_LOG` when set, i.e.
//! `RUST_LOG=nvme_engine=trace` prints everything this crate emits;
//! the argument is the fallback filter. Installing a different
//! subscriber before calling this wins, init never panics over an
//! occupied slot.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the default console subscriber. Returns false when a
/// subscriber was already installed.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_idempotent() {
        super::init("info");
        // the second install is refused, not fatal
        super::init("debug");
    }
}
