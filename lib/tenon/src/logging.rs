use serdeconv;
use sloggers;

// Consumers log through these re-exports so they never depend on slog directly.
pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

/// Builds the terminal root logger used by the example binaries and any host
/// that does not bring its own drain.
pub fn terminal_root() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// A logger that drops everything. Default for components constructed
/// without a parent logger.
#[inline]
pub fn discard_root() -> Logger {
    Logger::root(Discard, o!())
}

/// Derives a component logger from an optional parent, falling back to the
/// discard root.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(parent: L) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!()),
        None => discard_root(),
    }
}
