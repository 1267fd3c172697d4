//! Logger setup.
//!
//! Lines go to stderr as `[HH:MM:SS] [target] message`, with the level
//! spelled out for warnings and errors. `output_level` picks the default
//! verbosity: 0 errors only, 1 warnings and state changes, 2 decisions,
//! 3 everything. `RUST_LOG` takes precedence when set.

use std::io::Write;

use log::{Level, LevelFilter};

use crate::{local_time, now_epoch};

pub fn level_for(output_level: u8) -> LevelFilter {
    match output_level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install the logger. Safe to call more than once; later calls only
/// adjust the level.
pub fn init(output_level: u8) {
    let mut builder = env_logger::Builder::new();
    builder.format(|buf, record| {
        let lt = local_time(now_epoch());
        let tag = record.target().rsplit("::").next().unwrap_or("");
        match record.level() {
            Level::Error | Level::Warn => writeln!(
                buf,
                "[{:02}:{:02}:{:02}] [{}] {}: {}",
                lt.hour,
                lt.min,
                lt.sec,
                tag,
                record.level(),
                record.args()
            ),
            _ => writeln!(
                buf,
                "[{:02}:{:02}:{:02}] [{}] {}",
                lt.hour,
                lt.min,
                lt.sec,
                tag,
                record.args()
            ),
        }
    });
    match std::env::var("RUST_LOG") {
        Ok(filters) => {
            builder.parse_filters(&filters);
        }
        // Backend passes everything, log::max_level filters
        Err(_) => {
            builder.filter_level(LevelFilter::Trace);
        }
    }
    let _ = builder.try_init();
    set_level(output_level);
}

/// Follow a changed `output_level` without reinstalling the logger.
pub fn set_level(output_level: u8) {
    if std::env::var_os("RUST_LOG").is_none() {
        log::set_max_level(level_for(output_level));
    }
}
