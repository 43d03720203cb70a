//! Runtime-switchable log sink.
//!
//! The debugger is linked into a host process that owns logging policy, so
//! the global logger is a proxy: records from the `image`, `session`, `net`
//! and `debugger` targets are dropped until the host (or the standalone
//! server binary) installs a sink through [`LOGGER_SWITCHER`].

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use std::sync::RwLock;

pub struct LogSwitcher {
    sink: RwLock<Option<Box<dyn Log>>>,
}

static SWITCHER: LogSwitcher = LogSwitcher {
    sink: RwLock::new(None),
};

/// Registers the proxy as the global logger on first use.
pub static LOGGER_SWITCHER: Lazy<&'static LogSwitcher> = Lazy::new(|| {
    log::set_logger(&SWITCHER).expect("infallible");
    log::set_max_level(LevelFilter::Debug);
    &SWITCHER
});

impl LogSwitcher {
    /// Install a sink and reset the global maximum level. Replaces any
    /// previously installed sink.
    pub fn switch<L: Log + 'static>(&self, sink: L, level_filter: LevelFilter) {
        *self.sink.write().unwrap() = Some(Box::new(sink));
        log::set_max_level(level_filter);
    }
}

impl Log for LogSwitcher {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match &*self.sink.read().unwrap() {
            Some(sink) => sink.enabled(metadata),
            None => false,
        }
    }

    fn log(&self, record: &Record) {
        if let Some(sink) = &*self.sink.read().unwrap() {
            sink.log(record);
        }
    }

    fn flush(&self) {
        if let Some(sink) = &*self.sink.read().unwrap() {
            sink.flush();
        }
    }
}
