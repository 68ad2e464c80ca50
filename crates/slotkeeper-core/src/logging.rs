//! Logging bootstrap for slotkeeper binaries.

use env_logger::{Builder, Env};
use std::io::Write;

/// Environment variable consulted for the log filter (falls back to `RUST_LOG`).
pub const LOG_ENV: &str = "SLOTKEEPER_LOG";

/// Install the global logger writing to stderr.
///
/// `default_level` applies when neither `SLOTKEEPER_LOG` nor `RUST_LOG` is set.
/// Calling this more than once is harmless.
pub fn init(default_level: &str) {
    let env = if std::env::var_os(LOG_ENV).is_some() {
        Env::new().filter_or(LOG_ENV, default_level)
    } else {
        Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, default_level)
    };

    let _ = Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}
