//! Logger handles
//!
//! Components never write to the process-wide logger directly. Each one is
//! handed a [`Logger`] at construction and emits records through it with
//! [`emit!`]. The binary installs `env_logger` and passes [`global()`].

use log::{Log, Metadata, Record};
use std::sync::Arc;

/// Shared logger handle passed into each component
pub type Logger = Arc<dyn Log>;

/// Logger that forwards to whatever `log` backend the process installed
pub fn global() -> Logger {
    Arc::new(Global)
}

/// Logger that drops every record
pub fn discard() -> Logger {
    Arc::new(Discard)
}

/// Borrow the `log::Log` behind a handle
pub fn as_log(logger: &Logger) -> &dyn Log {
    &**logger
}

struct Global;

impl Log for Global {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level() && log::logger().enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            log::logger().log(record);
        }
    }

    fn flush(&self) {
        log::logger().flush();
    }
}

struct Discard;

impl Log for Discard {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        false
    }

    fn log(&self, _record: &Record) {}

    fn flush(&self) {}
}

/// Emit a record through an explicit [`Logger`].
///
/// `emit!(self.logger, Level::Warn, "index truncated to {} entries", n)`
macro_rules! emit {
    ($logger:expr, $level:expr, $($arg:tt)+) => {{
        let logger: &dyn ::log::Log = $crate::logging::as_log(&$logger);
        let metadata = ::log::Metadata::builder()
            .level($level)
            .target(module_path!())
            .build();
        if logger.enabled(&metadata) {
            logger.log(
                &::log::Record::builder()
                    .metadata(metadata)
                    .args(format_args!($($arg)+))
                    .module_path(Some(module_path!()))
                    .file(Some(file!()))
                    .line(Some(line!()))
                    .build(),
            );
        }
    }};
}

pub(crate) use emit;
