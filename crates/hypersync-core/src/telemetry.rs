//! Process-wide `tracing` subscriber setup for the `hypersync` binary.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber: `RUST_LOG` if set, else `level`; plain
/// or newline-delimited JSON lines on stderr.
///
/// Returns `false` when a subscriber was already installed, in which case
/// nothing changes.
pub fn init_tracing(json: bool, level: Level) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let lines = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let base = tracing_subscriber::registry().with(filter);

    let installed = if json {
        base.with(lines.json()).try_init()
    } else {
        base.with(lines).try_init()
    };
    installed.is_ok()
}
