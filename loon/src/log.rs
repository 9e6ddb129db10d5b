// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use log::LevelFilter;

use crate::config;
use crate::error::{Error, ErrorKind};

const fn get_log_level(level: config::LogLevel) -> LevelFilter {
    match level {
        config::LogLevel::Off => LevelFilter::Off,
        config::LogLevel::Error => LevelFilter::Error,
        config::LogLevel::Warn => LevelFilter::Warn,
        config::LogLevel::Info => LevelFilter::Info,
        config::LogLevel::Debug => LevelFilter::Debug,
        config::LogLevel::Trace => LevelFilter::Trace,
    }
}

/// Initialize the console logger from the config file level.
///
/// `RUST_LOG` still wins when set, so operators can raise verbosity for a
/// single run without touching the config.
///
/// # Errors
///
/// Returns error if a global logger is already installed.
pub fn init_log(log_conf: &config::Log) -> Result<(), Error> {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(get_log_level(log_conf.log_level()));
    }
    builder.try_init().map_err(|err| {
        Error::from_string(
            ErrorKind::ConfigError,
            format!("Failed to init logger, {err}"),
        )
    })
}
