//! Logger setup

use env_logger::Env;
use log::LevelFilter;

/// Default filter for the given command line switches
pub fn default_filter(debug: bool, trace_protocol: bool) -> &'static str {
    if trace_protocol {
        "trace"
    } else if debug {
        "debug"
    } else {
        "info"
    }
}

/// Initializes `env_logger`; `RUST_LOG` still wins over the switches
pub fn init(debug: bool, trace_protocol: bool) {
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter(debug, trace_protocol)))
        .format_timestamp_millis()
        .init();
}

/// Whether per-message protocol dumps are enabled
pub fn protocol_tracing() -> bool {
    log::max_level() >= LevelFilter::Trace
}
