//! Structured logging setup.
//!
//! Log levels:
//! - ERROR: Failures that abort a run (invalid manifest, setup errors)
//! - WARN: Recoverable problems (failed attempts, missing scanners)
//! - INFO: Run and task lifecycle (dispatch, terminal states, reviews)
//! - DEBUG: Promotions, holds, collaborator calls
//! - TRACE: Payloads and retrieved context
//!
//! Debug mode can be enabled with `--debug` flag or `AGENTFLOW_DEBUG=1` env var.
//! An explicit `RUST_LOG` always wins over both.

use tracing_subscriber::EnvFilter;

/// Environment variable that turns on debug logging.
pub const DEBUG_ENV: &str = "AGENTFLOW_DEBUG";

/// Initialize logging at INFO level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug || env_debug())));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Check whether the debug env var is set to a truthy value.
pub fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "agentflow=debug,info"
    } else {
        "info"
    }
}
