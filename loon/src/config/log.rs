// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log section in config.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Log {
    /// Console log level.
    ///
    /// Default is `info`.
    #[serde(default = "Log::default_log_level")]
    log_level: LogLevel,
}

impl Log {
    #[must_use]
    pub const fn default_log_level() -> LogLevel {
        LogLevel::Info
    }

    #[must_use]
    pub const fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some option value is invalid.
    #[allow(clippy::unnecessary_wraps)]
    pub const fn validate(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
