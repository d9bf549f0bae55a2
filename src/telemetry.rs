//! Tracing setup for binaries and tests.
//!
//! Library code only emits `tracing` events and spans; installing a
//! subscriber is the embedding application's call. [`init_tracing`] is
//! the standard setup: a compact fmt layer filtered by `RUST_LOG`, with
//! a quiet default when the variable is unset.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the default subscriber.
///
/// Safe to call more than once; later calls are no-ops, which keeps
/// parallel test binaries from fighting over the global subscriber.
pub fn init_tracing() {
    let fmt_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::CLOSE);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,ragweave=info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
