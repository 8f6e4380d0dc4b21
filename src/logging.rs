//! Broker logging setup.
//!
//! Everything goes to stderr: in `--stdio` mode stdout carries the LSP byte
//! stream, and a single stray line there corrupts the Content-Length
//! framing for the attached client.

use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;

/// Installs the global subscriber. An explicit `level` wins over `RUST_LOG`;
/// with neither, the broker stays at `info` so per-message tracing does not
/// sit on the forwarding hot path. Calling this twice (tests, or an embedder
/// that already installed its own subscriber) is a no-op.
pub fn init_logging(level: Option<&str>, ansi: bool) {
    let filter = level
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_timer(UtcTime::new(Rfc3339))
        .with_ansi(ansi)
        .try_init();
}
