//! tracing subscriber setup
//!
//! `RUST_LOG` wins when set; otherwise the level from `[logging]` applies to
//! this crate and tower-http, everything else stays at warn.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

pub fn init(config: &LoggingConfig) {
    let fallback = format!("warn,thermo_bridge={0},tower_http={0}", config.level);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // a second init (e.g. from tests) is not an error worth dying for
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
