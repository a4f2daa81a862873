use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs the global subscriber once.
///
/// `TRANSCACHE_LOG` takes precedence over `RUST_LOG`; without either, only warnings are shown
/// unless `verbose` asks for informational output.
pub fn init_logging(verbose: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("TRANSCACHE_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(if verbose { "info" } else { "warn" }));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
