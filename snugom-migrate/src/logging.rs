//! Explicit logger handle passed into each engine component.
//!
//! Components never reach for a global scope to find their logger; they are
//! handed a [`Logger`] at construction. The default sink is whatever the
//! process installed behind the `log` facade (`env_logger` in the CLI).

use std::fmt;

use log::{Level, Log, Metadata, Record};

#[derive(Clone, Copy)]
pub struct Logger {
    target: &'static str,
    sink: &'static dyn Log,
}

impl Logger {
    /// Logger writing to the process-wide `log` facade.
    pub fn new(target: &'static str) -> Self {
        Self {
            target,
            sink: log::logger(),
        }
    }

    /// Logger writing to an explicit sink.
    pub fn with_sink(target: &'static str, sink: &'static dyn Log) -> Self {
        Self { target, sink }
    }

    /// Same sink, different target.
    pub fn scoped(&self, target: &'static str) -> Self {
        Self {
            target,
            sink: self.sink,
        }
    }

    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        let metadata = Metadata::builder().level(level).target(self.target).build();
        if !self.sink.enabled(&metadata) {
            return;
        }
        self.sink
            .log(&Record::builder().args(args).level(level).target(self.target).build());
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    pub fn trace(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Trace, args);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("target", &self.target).finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use capture::CaptureLog;

    #[test]
    fn routes_records_to_injected_sink() {
        let sink = CaptureLog::leaked();
        let logger = Logger::with_sink("snugom_migrate::lock", sink);
        logger.info(format_args!("acquired slot {}", 1));
        logger.scoped("snugom_migrate::executor").error(format_args!("boom"));

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (Level::Info, "snugom_migrate::lock".to_string(), "acquired slot 1".to_string()));
        assert_eq!(records[1].1, "snugom_migrate::executor");
        assert_eq!(sink.at(Level::Error), vec!["boom".to_string()]);
    }
}
