// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::net::ToSocketAddrs;

use crate::error::{Error, ErrorKind};

/// Listener section in config.
///
/// Each listener binds one plain TCP port; the flow-control and queueing
/// limits here apply to every session accepted through it.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Listener {
    /// Binding address, `ip:port` or `hostname:port`.
    ///
    /// Default is `0.0.0.0:1883`.
    #[serde(default = "Listener::default_address")]
    address: String,

    /// Prefix prepended to the topic of every message published or
    /// subscribed through this listener, isolating its clients in a topic
    /// subtree. Empty disables mounting.
    ///
    /// Default is empty.
    #[serde(default = "Listener::default_mount_point")]
    mount_point: String,

    /// The maximum number of outgoing QoS 1/2 messages that can be
    /// simultaneously in flight per session, 0 for unlimited.
    ///
    /// Default is 20.
    #[serde(default = "Listener::default_max_inflight_messages")]
    max_inflight_messages: usize,

    /// The maximum number of payload bytes simultaneously in flight per
    /// session for QoS 1/2 traffic, 0 for unlimited.
    ///
    /// Default is 0.
    #[serde(default = "Listener::default_max_inflight_bytes")]
    max_inflight_bytes: usize,

    /// The maximum number of QoS 1/2 messages held queued per session
    /// above those in flight, 0 for unlimited. Messages beyond the limit
    /// are dropped.
    ///
    /// Default is 1000.
    #[serde(default = "Listener::default_max_queued_messages")]
    max_queued_messages: usize,

    /// The maximum number of payload bytes held queued per session above
    /// those in flight, 0 for unlimited.
    ///
    /// Default is 0.
    #[serde(default = "Listener::default_max_queued_bytes")]
    max_queued_bytes: usize,

    /// Queue QoS 0 messages for disconnected persistent sessions, subject
    /// to the queue limits above.
    ///
    /// Default is false.
    #[serde(default = "Listener::default_queue_qos0_messages")]
    queue_qos0_messages: bool,

    /// Highest topic alias number the broker accepts from v5 clients on
    /// this listener; 0 disables topic aliasing.
    ///
    /// Default is 10.
    #[serde(default = "Listener::default_max_topic_alias")]
    max_topic_alias: u16,
}

impl Listener {
    #[must_use]
    pub fn default_address() -> String {
        "0.0.0.0:1883".to_string()
    }

    #[must_use]
    pub fn default_mount_point() -> String {
        String::new()
    }

    #[must_use]
    pub const fn default_max_inflight_messages() -> usize {
        20
    }

    #[must_use]
    pub const fn default_max_inflight_bytes() -> usize {
        0
    }

    #[must_use]
    pub const fn default_max_queued_messages() -> usize {
        1000
    }

    #[must_use]
    pub const fn default_max_queued_bytes() -> usize {
        0
    }

    #[must_use]
    pub const fn default_queue_qos0_messages() -> bool {
        false
    }

    #[must_use]
    pub const fn default_max_topic_alias() -> u16 {
        10
    }

    #[must_use]
    pub fn default_listeners() -> Vec<Self> {
        vec![Self::default()]
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    #[must_use]
    pub const fn max_inflight_messages(&self) -> usize {
        self.max_inflight_messages
    }

    #[must_use]
    pub const fn max_inflight_bytes(&self) -> usize {
        self.max_inflight_bytes
    }

    #[must_use]
    pub const fn max_queued_messages(&self) -> usize {
        self.max_queued_messages
    }

    #[must_use]
    pub const fn max_queued_bytes(&self) -> usize {
        self.max_queued_bytes
    }

    #[must_use]
    pub const fn queue_qos0_messages(&self) -> bool {
        self.queue_qos0_messages
    }

    #[must_use]
    pub const fn max_topic_alias(&self) -> u16 {
        self.max_topic_alias
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some option value is invalid.
    pub fn validate(&self, bind_address: bool) -> Result<(), Error> {
        if bind_address && self.address.to_socket_addrs().is_err() {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("config: Invalid listener address {}", self.address),
            ));
        }
        if !self.mount_point.is_empty()
            && codec::topic::validate_pub_topic(&self.mount_point).is_err()
        {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("config: Invalid mount_point {}", self.mount_point),
            ));
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            address: Self::default_address(),
            mount_point: Self::default_mount_point(),
            max_inflight_messages: Self::default_max_inflight_messages(),
            max_inflight_bytes: Self::default_max_inflight_bytes(),
            max_queued_messages: Self::default_max_queued_messages(),
            max_queued_bytes: Self::default_max_queued_bytes(),
            queue_qos0_messages: Self::default_queue_qos0_messages(),
            max_topic_alias: Self::default_max_topic_alias(),
        }
    }
}
