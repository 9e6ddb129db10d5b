// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;

use crate::error::Error;

mod general;
mod listener;
mod log;

pub use self::log::{Log, LogLevel};
pub use general::General;
pub use listener::Listener;

/// Server main config.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    general: General,

    #[serde(default = "Listener::default_listeners")]
    listeners: Vec<Listener>,

    #[serde(default)]
    log: Log,
}

impl Config {
    #[must_use]
    pub const fn general(&self) -> &General {
        &self.general
    }

    #[must_use]
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    #[must_use]
    pub const fn log(&self) -> &Log {
        &self.log
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some options in config are invalid.
    pub fn validate(&self, bind_address: bool) -> Result<(), Error> {
        self.general.validate()?;
        if bind_address && self.listeners.is_empty() {
            return Err(Error::new(
                crate::error::ErrorKind::ConfigError,
                "config: At least one listener is required",
            ));
        }
        for listener in &self.listeners {
            listener.validate(bind_address)?;
        }
        self.log.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate(false).is_ok());
        // A default Config deserialized from an empty document still has
        // one listener.
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.listeners().len(), 1);
        assert_eq!(config.listeners()[0].max_inflight_messages(), 20);
    }

    #[test]
    fn test_parse_overrides() {
        let text = r#"
[general]
max_qos = 1
allow_zero_length_clientid = false

[[listeners]]
address = "127.0.0.1:1883"
max_queued_messages = 100
queue_qos0_messages = true

[log]
log_level = "debug"
"#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.general().max_qos(), codec::QoS::AtLeastOnce);
        assert!(!config.general().allow_zero_length_clientid());
        assert_eq!(config.listeners()[0].max_queued_messages(), 100);
        assert!(config.listeners()[0].queue_qos0_messages());
        assert_eq!(config.log().log_level(), LogLevel::Debug);
    }
}
