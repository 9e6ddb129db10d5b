// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::QoS;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// General section in config.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct General {
    /// Set maximum size for publish message payload.
    ///
    /// Received messages that exceed this size will not be accepted by the
    /// broker. MQTT imposes a maximum payload size of 268435455 bytes.
    ///
    /// Default value is 0, which means that all valid MQTT messages are
    /// accepted.
    #[serde(default = "General::default_message_size_limit")]
    message_size_limit: u32,

    /// Clients may only connect with a keep alive less than or equal to
    /// this value, otherwise they will be sent a server keep alive telling
    /// them to use `max_keepalive` (MQTT v5 clients only; older clients are
    /// clamped silently).
    ///
    /// Default value is 65535. Do not set below 10.
    #[serde(default = "General::default_max_keepalive")]
    max_keepalive: u16,

    /// Set the maximum QoS supported.
    ///
    /// Publishes and subscriptions above this level are refused with the
    /// appropriate acknowledgement code. Available values are 0, 1 and 2.
    ///
    /// Default is 2.
    #[serde(default = "General::default_max_qos")]
    max_qos: QoS,

    /// If false, retained messages are refused with "retain not supported"
    /// and the retained message store stays empty.
    ///
    /// Default is true.
    #[serde(default = "General::default_retain_available")]
    retain_available: bool,

    /// If a client subscribes to overlapping filters, deliver one copy of
    /// each matching message (false) or one copy per matching filter
    /// (true).
    ///
    /// Default is false.
    #[serde(default = "General::default_allow_duplicate_messages")]
    allow_duplicate_messages: bool,

    /// Accept a zero-length client id and assign a generated one
    /// (v3.1.1 with clean start, and v5).
    ///
    /// Default is true.
    #[serde(default = "General::default_allow_zero_length_clientid")]
    allow_zero_length_clientid: bool,

    /// Prefix prepended to generated client ids.
    ///
    /// Default is "auto-".
    #[serde(default = "General::default_auto_id_prefix")]
    auto_id_prefix: String,

    /// If not empty, only client ids starting with this prefix may connect.
    ///
    /// Default is empty, which disables the check.
    #[serde(default = "General::default_clientid_prefixes")]
    clientid_prefixes: String,

    /// Upper bound in seconds on the session expiry interval a client may
    /// request. `u32::MAX` means sessions may be kept until explicit
    /// cleanup.
    ///
    /// Default is `u32::MAX`.
    #[serde(default = "General::default_session_expiry_interval")]
    session_expiry_interval: u32,

    /// Close a connection that has not completed the CONNECT handshake
    /// within this many seconds.
    ///
    /// Default is 30.
    #[serde(default = "General::default_connect_timeout")]
    connect_timeout: u64,

    /// When true, queue and in-flight limits are taken from each listener
    /// section; when false, the first listener's values apply everywhere.
    ///
    /// Default is false.
    #[serde(default = "General::default_per_listener_settings")]
    per_listener_settings: bool,
}

impl General {
    #[must_use]
    pub const fn default_message_size_limit() -> u32 {
        0
    }

    #[must_use]
    pub const fn default_max_keepalive() -> u16 {
        u16::MAX
    }

    #[must_use]
    pub const fn default_max_qos() -> QoS {
        QoS::ExactOnce
    }

    #[must_use]
    pub const fn default_retain_available() -> bool {
        true
    }

    #[must_use]
    pub const fn default_allow_duplicate_messages() -> bool {
        false
    }

    #[must_use]
    pub const fn default_allow_zero_length_clientid() -> bool {
        true
    }

    #[must_use]
    pub fn default_auto_id_prefix() -> String {
        "auto-".to_string()
    }

    #[must_use]
    pub fn default_clientid_prefixes() -> String {
        String::new()
    }

    #[must_use]
    pub const fn default_session_expiry_interval() -> u32 {
        u32::MAX
    }

    #[must_use]
    pub const fn default_connect_timeout() -> u64 {
        30
    }

    #[must_use]
    pub const fn default_per_listener_settings() -> bool {
        false
    }

    #[must_use]
    pub const fn message_size_limit(&self) -> u32 {
        self.message_size_limit
    }

    #[must_use]
    pub const fn max_keepalive(&self) -> u16 {
        self.max_keepalive
    }

    #[must_use]
    pub const fn max_qos(&self) -> QoS {
        self.max_qos
    }

    #[must_use]
    pub const fn retain_available(&self) -> bool {
        self.retain_available
    }

    #[must_use]
    pub const fn allow_duplicate_messages(&self) -> bool {
        self.allow_duplicate_messages
    }

    #[must_use]
    pub const fn allow_zero_length_clientid(&self) -> bool {
        self.allow_zero_length_clientid
    }

    #[must_use]
    pub fn auto_id_prefix(&self) -> &str {
        &self.auto_id_prefix
    }

    #[must_use]
    pub fn clientid_prefixes(&self) -> &str {
        &self.clientid_prefixes
    }

    #[must_use]
    pub const fn session_expiry_interval(&self) -> u32 {
        self.session_expiry_interval
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> u64 {
        self.connect_timeout
    }

    #[must_use]
    pub const fn per_listener_settings(&self) -> bool {
        self.per_listener_settings
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some option value is invalid.
    pub fn validate(&self) -> Result<(), Error> {
        if self.message_size_limit > codec::MAX_PACKET_LEN as u32 {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!(
                    "config: message_size_limit {} is larger than the protocol maximum",
                    self.message_size_limit
                ),
            ));
        }
        if self.max_keepalive < 10 {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("config: max_keepalive {} is below 10", self.max_keepalive),
            ));
        }
        Ok(())
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            message_size_limit: Self::default_message_size_limit(),
            max_keepalive: Self::default_max_keepalive(),
            max_qos: Self::default_max_qos(),
            retain_available: Self::default_retain_available(),
            allow_duplicate_messages: Self::default_allow_duplicate_messages(),
            allow_zero_length_clientid: Self::default_allow_zero_length_clientid(),
            auto_id_prefix: Self::default_auto_id_prefix(),
            clientid_prefixes: Self::default_clientid_prefixes(),
            session_expiry_interval: Self::default_session_expiry_interval(),
            connect_timeout: Self::default_connect_timeout(),
            per_listener_settings: Self::default_per_listener_settings(),
        }
    }
}
