//! Structured logging init: wires `tracing`/`tracing-subscriber` with a
//! human-readable format on a TTY and JSON otherwise.

use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber. Idempotent: a second call is a no-op if
/// one is already installed (tests may call this more than once).
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);

    let is_tty = std::io::IsTerminal::is_terminal(&std::io::stderr());
    let result = if is_tty {
        registry.with(fmt::layer().with_target(false).compact()).try_init()
    } else {
        registry.with(fmt::layer().json().with_current_span(true)).try_init()
    };
    // A repeat call (already-installed global subscriber) is expected in
    // tests and is not an error.
    let _ = result;
}
