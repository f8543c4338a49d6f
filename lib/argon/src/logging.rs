use serdeconv;
use sloggers::{Config, LoggerConfig};

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

/// Builds the process-wide root logger. All components derive child loggers
/// from the one returned here via `log.new(o!(..))`.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger config");

    config.build_logger().expect("Error building logger")
}

/// A logger that swallows everything. Used where a component is constructed
/// without a parent logger (mostly tests).
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
