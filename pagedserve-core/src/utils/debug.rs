use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::DEBUG;

/// Install the global subscriber. `PAGEDSERVE_DEBUG=1` lowers the default level to debug and
/// turns on block table dumps; `RUST_LOG` still overrides the filter.
pub fn initialize_logging() {
    let is_debug = std::env::var("PAGEDSERVE_DEBUG")
        .unwrap_or_default()
        .contains('1');
    DEBUG.store(is_debug, std::sync::atomic::Ordering::Relaxed);

    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    // A subscriber may already be installed by the embedding application.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
