// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Broker-side state of one client session.
//!
//! A session outlives its network connection when the client asked for a
//! non-zero session expiry; the same struct then sits in the session table
//! with no attached sink until the client returns or the expiry elapses.

use bytes::Bytes;
use codec::v5::Properties;
use codec::{PacketId, ProtocolLevel, QoS};
use std::collections::HashMap;

mod message_data;

pub use message_data::{ClientMessage, Direction, MessageData, MessageState};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, CONNECT not yet seen.
    New,

    /// CONNECT seen, extended authentication still in progress.
    Authenticating,

    /// CONNACK sent, normal operation.
    Active,

    /// Displaced by a takeover; about to be dropped.
    Duplicate,

    /// DISCONNECT processing has begun.
    Disconnecting,

    /// No attached connection. The session may still hold queues and
    /// subscriptions until its expiry elapses.
    Disconnected,
}

/// A will message parked on the session until its trigger.
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,

    /// Seconds to wait after an abnormal close before publishing.
    pub delay_interval: u32,
}

impl WillMessage {
    /// The will properties minus the ones that only instruct the broker;
    /// the delay interval must not travel inside the published message.
    #[must_use]
    pub fn message_properties(&self) -> Properties {
        let mut properties = Properties::new();
        for property in self.properties.props() {
            if property.property_type() != codec::v5::PropertyType::WillDelayInterval {
                properties.push(property.clone());
            }
        }
        properties
    }
}

/// Per-session limits resolved from the general and listener config.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_qos: QoS,
    pub max_inflight_messages: usize,
    pub max_inflight_bytes: usize,
    pub max_queued_messages: usize,
    pub max_queued_bytes: usize,
    pub queue_qos0_messages: bool,
    pub max_topic_alias: u16,
    pub mount_point: String,
}

#[derive(Debug)]
pub struct Session {
    id: crate::types::SessionId,
    client_id: String,
    protocol: ProtocolLevel,
    bridge: bool,
    state: SessionState,
    clean_start: bool,

    /// Seconds the session survives a disconnect; `u32::MAX` means until
    /// explicit cleanup. v3.x maps `clean_session=false` to `u32::MAX`.
    session_expiry_interval: u32,

    /// Negotiated keepalive in seconds, 0 disabled.
    keepalive: u16,

    max_qos: QoS,
    mount_point: String,
    max_topic_alias: u16,

    /// Ordered filter strings; the handles into the subscription trie.
    subscriptions: Vec<String>,

    msgs_in: MessageData,
    msgs_out: MessageData,

    will: Option<WillMessage>,

    /// Wall time at which a delayed will fires; set on abnormal close.
    will_delay_until: Option<u64>,

    username: String,
    auth_method: Option<String>,

    /// Last packet identifier assigned outbound.
    last_mid: u16,

    /// The peer's stated maximum packet size, 0 for none.
    max_packet_size: u32,

    /// Topic aliases the peer established for its publishes.
    topic_aliases_in: HashMap<u16, String>,

    /// Monotonic seconds of the last inbound activity.
    last_activity: u64,

    /// Wall seconds of the disconnect, when state is `Disconnected`.
    disconnected_at: u64,
}

impl Session {
    #[must_use]
    pub fn new(id: crate::types::SessionId, config: &SessionConfig, now: u64) -> Self {
        Self {
            id,
            client_id: String::new(),
            protocol: ProtocolLevel::V311,
            bridge: false,
            state: SessionState::New,
            clean_start: true,
            session_expiry_interval: 0,
            keepalive: 0,
            max_qos: config.max_qos,
            mount_point: config.mount_point.clone(),
            max_topic_alias: config.max_topic_alias,
            subscriptions: Vec::new(),
            msgs_in: MessageData::new(
                config.max_inflight_messages,
                config.max_inflight_bytes,
                config.max_queued_messages,
                config.max_queued_bytes,
                config.queue_qos0_messages,
            ),
            msgs_out: MessageData::new(
                config.max_inflight_messages,
                config.max_inflight_bytes,
                config.max_queued_messages,
                config.max_queued_bytes,
                config.queue_qos0_messages,
            ),
            will: None,
            will_delay_until: None,
            username: String::new(),
            auth_method: None,
            last_mid: 0,
            max_packet_size: 0,
            topic_aliases_in: HashMap::new(),
            last_activity: now,
            disconnected_at: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> crate::types::SessionId {
        self.id
    }

    pub fn set_id(&mut self, id: crate::types::SessionId) {
        self.id = id;
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_client_id(&mut self, client_id: &str) {
        self.client_id = client_id.to_string();
    }

    #[must_use]
    pub const fn protocol(&self) -> ProtocolLevel {
        self.protocol
    }

    pub fn set_protocol(&mut self, protocol: ProtocolLevel, bridge: bool) {
        self.protocol = protocol;
        self.bridge = bridge;
    }

    #[must_use]
    pub const fn bridge(&self) -> bool {
        self.bridge
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    #[must_use]
    pub const fn clean_start(&self) -> bool {
        self.clean_start
    }

    pub fn set_clean_start(&mut self, clean_start: bool) {
        self.clean_start = clean_start;
    }

    #[must_use]
    pub const fn session_expiry_interval(&self) -> u32 {
        self.session_expiry_interval
    }

    pub fn set_session_expiry_interval(&mut self, interval: u32) {
        self.session_expiry_interval = interval;
    }

    #[must_use]
    pub const fn keepalive(&self) -> u16 {
        self.keepalive
    }

    pub fn set_keepalive(&mut self, keepalive: u16) {
        self.keepalive = keepalive;
    }

    #[must_use]
    pub const fn max_qos(&self) -> QoS {
        self.max_qos
    }

    #[must_use]
    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    #[must_use]
    pub const fn max_topic_alias(&self) -> u16 {
        self.max_topic_alias
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn set_username(&mut self, username: &str) {
        self.username = username.to_string();
    }

    #[must_use]
    pub fn auth_method(&self) -> Option<&str> {
        self.auth_method.as_deref()
    }

    pub fn set_auth_method(&mut self, method: Option<String>) {
        self.auth_method = method;
    }

    #[must_use]
    pub const fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    pub fn set_max_packet_size(&mut self, size: u32) {
        self.max_packet_size = size;
    }

    #[must_use]
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Record a subscription handle; keeps at most one entry per filter.
    pub fn add_subscription(&mut self, filter: &str) {
        if !self.subscriptions.iter().any(|f| f == filter) {
            self.subscriptions.push(filter.to_string());
        }
    }

    /// Drop a subscription handle. Returns false if it was not held.
    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|f| f != filter);
        self.subscriptions.len() != before
    }

    pub fn take_subscriptions(&mut self) -> Vec<String> {
        std::mem::take(&mut self.subscriptions)
    }

    pub fn set_subscriptions(&mut self, subscriptions: Vec<String>) {
        self.subscriptions = subscriptions;
    }

    pub fn msgs_in(&mut self) -> &mut MessageData {
        &mut self.msgs_in
    }

    pub fn msgs_out(&mut self) -> &mut MessageData {
        &mut self.msgs_out
    }

    #[must_use]
    pub const fn msgs_in_ref(&self) -> &MessageData {
        &self.msgs_in
    }

    #[must_use]
    pub const fn msgs_out_ref(&self) -> &MessageData {
        &self.msgs_out
    }

    #[must_use]
    pub const fn will(&self) -> Option<&WillMessage> {
        self.will.as_ref()
    }

    pub fn set_will(&mut self, will: Option<WillMessage>) {
        self.will = will;
    }

    pub fn take_will(&mut self) -> Option<WillMessage> {
        self.will_delay_until = None;
        self.will.take()
    }

    #[must_use]
    pub const fn will_delay_until(&self) -> Option<u64> {
        self.will_delay_until
    }

    pub fn set_will_delay_until(&mut self, at: Option<u64>) {
        self.will_delay_until = at;
    }

    #[must_use]
    pub const fn last_mid(&self) -> u16 {
        self.last_mid
    }

    pub fn set_last_mid(&mut self, last_mid: u16) {
        self.last_mid = last_mid;
    }

    /// Assign the next outbound packet identifier, skipping zero and any
    /// id still in flight.
    pub fn next_mid(&mut self) -> PacketId {
        loop {
            self.last_mid = self.last_mid.wrapping_add(1);
            if self.last_mid == 0 {
                self.last_mid = 1;
            }
            let candidate = PacketId::new(self.last_mid);
            let in_use = self
                .msgs_out
                .inflight_iter()
                .any(|entry| entry.qos != QoS::AtMostOnce && entry.mid == candidate);
            if !in_use {
                return candidate;
            }
        }
    }

    /// Remember a topic alias the peer established.
    pub fn set_topic_alias_in(&mut self, alias: u16, topic: String) {
        self.topic_aliases_in.insert(alias, topic);
    }

    #[must_use]
    pub fn topic_alias_in(&self, alias: u16) -> Option<&String> {
        self.topic_aliases_in.get(&alias)
    }

    pub fn touch(&mut self, now: u64) {
        self.last_activity = now;
    }

    /// Seconds since the last inbound activity.
    #[must_use]
    pub const fn idle_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_activity)
    }

    /// Keepalive check: one and a half times the negotiated interval must
    /// not elapse without inbound activity [MQTT-3.1.2-24].
    #[must_use]
    pub fn keepalive_expired(&self, now: u64) -> bool {
        if self.keepalive == 0 {
            return false;
        }
        let limit = u64::from(self.keepalive) * 3 / 2;
        now.saturating_sub(self.last_activity) > limit
    }

    pub fn mark_disconnected(&mut self, now_wall: u64) {
        self.state = SessionState::Disconnected;
        self.disconnected_at = now_wall;
        self.topic_aliases_in.clear();
    }

    /// Whether a disconnected session's expiry has elapsed.
    #[must_use]
    pub fn expired(&self, now_wall: u64) -> bool {
        if self.state != SessionState::Disconnected {
            return false;
        }
        if self.session_expiry_interval == u32::MAX {
            return false;
        }
        now_wall.saturating_sub(self.disconnected_at) >= u64::from(self.session_expiry_interval)
    }

    /// Prefix the listener mount point onto `topic`.
    #[must_use]
    pub fn mount_topic(&self, topic: &str) -> String {
        if self.mount_point.is_empty() {
            topic.to_string()
        } else {
            format!("{}{topic}", self.mount_point)
        }
    }

    /// Strip the listener mount point from `topic` before handing a
    /// message to this session's client.
    #[must_use]
    pub fn unmount_topic<'a>(&self, topic: &'a str) -> &'a str {
        if self.mount_point.is_empty() {
            topic
        } else {
            topic.strip_prefix(self.mount_point.as_str()).unwrap_or(topic)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            max_qos: QoS::ExactOnce,
            max_inflight_messages: 20,
            max_inflight_bytes: 0,
            max_queued_messages: 100,
            max_queued_bytes: 0,
            queue_qos0_messages: false,
            max_topic_alias: 10,
            mount_point: String::new(),
        }
    }

    #[test]
    fn test_next_mid_skips_zero() {
        let mut session = Session::new(1, &config(), 0);
        session.set_last_mid(u16::MAX);
        assert_eq!(session.next_mid(), PacketId::new(1));
        assert_eq!(session.next_mid(), PacketId::new(2));
    }

    #[test]
    fn test_keepalive_window() {
        let mut session = Session::new(1, &config(), 100);
        session.set_keepalive(10);
        assert!(!session.keepalive_expired(115));
        assert!(session.keepalive_expired(116));

        session.set_keepalive(0);
        assert!(!session.keepalive_expired(u64::MAX));
    }

    #[test]
    fn test_session_expiry() {
        let mut session = Session::new(1, &config(), 0);
        session.set_session_expiry_interval(60);
        assert!(!session.expired(1000));
        session.mark_disconnected(1000);
        assert!(!session.expired(1059));
        assert!(session.expired(1060));

        let mut forever = Session::new(2, &config(), 0);
        forever.set_session_expiry_interval(u32::MAX);
        forever.mark_disconnected(1000);
        assert!(!forever.expired(u64::MAX));
    }

    #[test]
    fn test_mount_point() {
        let mut cfg = config();
        cfg.mount_point = "tenants/blue/".to_string();
        let session = Session::new(1, &cfg, 0);
        assert_eq!(session.mount_topic("a/b"), "tenants/blue/a/b");
        assert_eq!(session.unmount_topic("tenants/blue/a/b"), "a/b");
    }

    #[test]
    fn test_subscription_handles() {
        let mut session = Session::new(1, &config(), 0);
        session.add_subscription("a/#");
        session.add_subscription("a/#");
        assert_eq!(session.subscriptions().len(), 1);
        assert!(session.remove_subscription("a/#"));
        assert!(!session.remove_subscription("a/#"));
    }
}
