//! Tracing setup for the `matchday` binary.
//!
//!   RUST_LOG=matchday_hub=debug matchday upcoming   # fine-grained control
//!   matchday --verbose upcoming                     # debug unless RUST_LOG is set

use tracing_subscriber::EnvFilter;

/// Installs a compact fmt subscriber on stderr so JSON on stdout stays clean.
/// Calling it twice is harmless; the second call reports an error string.
pub fn init_tracing(verbose: bool) -> Result<(), String> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|err| err.to_string())
}
