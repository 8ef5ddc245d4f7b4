// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Console backend for the `log` facade.
//!
//! The crate itself only ever logs through `log::{debug,info,warn,error}`;
//! embedders are free to install their own logger instead. Binaries and
//! examples call [`init`] once, which installs a stderr logger whose level is
//! picked from `WEFT_VERBOSE` (0 silent, 1 info, 2 and up debug).

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::sync::Once;

use crate::config::env_verbosity;

struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "E",
            Level::Warn => "W",
            Level::Info => "I",
            Level::Debug => "D",
            Level::Trace => "T",
        };
        eprintln!("[{}] [{}] {}", tag, record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;
static INIT: Once = Once::new();

/// Install the console logger. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        let level = match env_verbosity() {
            0 => LevelFilter::Off,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        };
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(level);
        }
    });
}
