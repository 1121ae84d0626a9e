//! Tracing subscriber bootstrap for embedding binaries and tests. The
//! library itself never installs a global subscriber — only a caller
//! that owns `main` should.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing-subscriber` `fmt` layer filtered by `RUST_LOG`
/// (default `info`). Safe to call more than once; later calls are a
/// no-op if a global subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
