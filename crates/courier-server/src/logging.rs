use courier_config::Logging;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
/// Safe to call more than once; later calls keep the first subscriber.
pub fn init_logging(cfg: &Logging) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("courier={0},courier_server={0}", cfg.level)));

    let builder = fmt().with_env_filter(filter).with_target(true);
    let result = if cfg.format == "json" {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };

    if result.is_err() {
        tracing::debug!("global tracing subscriber already initialized");
        return;
    }
    tracing::info!(
        level = %cfg.level,
        format = %cfg.format,
        "logging initialized"
    );
}
