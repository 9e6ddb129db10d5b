// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! CONNECT handling: validation, authentication, session takeover, and
//! the CONNACK with its follow-up drain of surviving queues.

use bytes::Bytes;
use codec::utils::random_string;
use codec::v5::{Properties, Property, ReasonCode};
use codec::{
    peek_connect_level, ByteArray, DecodeError, DecodePacket, EncodePacket, ProtocolLevel, QoS,
    StringData, U16Data, U32Data,
};

use super::{Broker, PendingConnAck};
use crate::auth::{AclAccess, AclResult, AuthResult};
use crate::error::{Error, ErrorKind};
use crate::session::{MessageState, SessionState, WillMessage};
use crate::store::Message;
use crate::types::SessionId;

/// Protocol 3.1 limits the client id to 23 characters.
const V31_CLIENT_ID_MAX: usize = 23;

impl Broker {
    fn refuse_v3(
        &mut self,
        id: SessionId,
        code: codec::v3::ConnectReturnCode,
        message: &str,
    ) -> Error {
        let ack = codec::v3::ConnectAckPacket::new(false, code);
        if let Err(err) = self.send_packet(id, &ack) {
            log::warn!("broker: Failed to send refusal CONNACK to {id}: {err}");
        }
        Error::new(ErrorKind::NotAuthorized, message)
    }

    fn refuse_v5(&mut self, id: SessionId, reason: ReasonCode, message: &str) -> Error {
        let ack = codec::v5::ConnectAckPacket::new(false, reason);
        if let Err(err) = self.send_packet(id, &ack) {
            log::warn!("broker: Failed to send refusal CONNACK to {id}: {err}");
        }
        Error::new(ErrorKind::NotAuthorized, message)
    }

    pub(super) fn on_connect(&mut self, id: SessionId, buf: &[u8]) -> Result<(), Error> {
        let (level, bridge) = match peek_connect_level(buf) {
            Ok(pair) => pair,
            Err(err) => {
                if matches!(
                    err,
                    DecodeError::InvalidProtocolLevel | DecodeError::InvalidProtocolName
                ) {
                    // The Server MUST respond with return code 0x01 and
                    // then disconnect the client [MQTT-3.1.2-2].
                    let ack = codec::v3::ConnectAckPacket::new(
                        false,
                        codec::v3::ConnectReturnCode::UnacceptedProtocol,
                    );
                    let _ = self.send_packet(id, &ack);
                }
                return Err(err.into());
            }
        };

        if level == ProtocolLevel::V5 {
            self.on_connect_v5(id, buf)
        } else {
            self.on_connect_v3(id, buf, level, bridge)
        }
    }

    fn on_connect_v3(
        &mut self,
        id: SessionId,
        buf: &[u8],
        level: ProtocolLevel,
        bridge: bool,
    ) -> Result<(), Error> {
        use codec::v3::ConnectReturnCode;

        let mut ba = ByteArray::new(buf);
        let packet = match codec::v3::ConnectPacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(DecodeError::InvalidClientId) => {
                return Err(self.refuse_v3(
                    id,
                    ConnectReturnCode::IdentifierRejected,
                    "broker: Invalid client id in CONNECT",
                ));
            }
            Err(err) => {
                // A malformed CONNECT is answered with nothing at all
                // [MQTT-3.1.4-1].
                return Err(err.into());
            }
        };

        let flags = *packet.connect_flags();
        let clean_start = flags.clean_start();
        // v3.x has no expiry field: a persistent session lives until
        // explicit cleanup.
        let session_expiry = if clean_start { 0 } else { u32::MAX };

        let mut pending = PendingConnAck::default();
        let mut client_id = packet.client_id().to_string();
        if client_id.is_empty() {
            // A zero-byte client id with CleanSession 0 is rejected with
            // return code 0x02 [MQTT-3.1.3-8]; v3.1 rejects it always.
            if level == ProtocolLevel::V31
                || !clean_start
                || !self.general.allow_zero_length_clientid()
            {
                return Err(self.refuse_v3(
                    id,
                    ConnectReturnCode::IdentifierRejected,
                    "broker: Zero-length client id refused",
                ));
            }
            client_id = format!("{}{}", self.general.auto_id_prefix(), random_string(12));
            pending.assigned_client_id = Some(client_id.clone());
        }
        if level == ProtocolLevel::V31 && client_id.len() > V31_CLIENT_ID_MAX {
            return Err(self.refuse_v3(
                id,
                ConnectReturnCode::IdentifierRejected,
                "broker: v3.1 client id longer than 23 chars",
            ));
        }
        let prefixes = self.general.clientid_prefixes().to_string();
        if !prefixes.is_empty() && !client_id.starts_with(&prefixes) {
            return Err(self.refuse_v3(
                id,
                ConnectReturnCode::IdentifierRejected,
                "broker: Client id prefix not allowed",
            ));
        }

        if flags.will() && flags.will_retain() && !self.general.retain_available() {
            return Err(self.refuse_v3(
                id,
                ConnectReturnCode::NotAuthorized,
                "broker: Will retain refused, retain is disabled",
            ));
        }

        let keepalive = packet.keep_alive().min(self.general.max_keepalive());
        let username = packet.username().to_string();
        let password = packet.password().to_vec();

        {
            let Some(session) = self.sessions.get_mut(&id) else {
                return Err(Error::new(ErrorKind::NotFound, "broker: Session gone"));
            };
            session.set_protocol(level, bridge);
            session.set_client_id(&client_id);
            session.set_clean_start(clean_start);
            session.set_session_expiry_interval(session_expiry);
            session.set_keepalive(keepalive);
            session.set_username(&username);

            let will = packet.will_topic().map(|topic| WillMessage {
                topic: session.mount_topic(topic.as_ref()),
                payload: Bytes::copy_from_slice(packet.will_message()),
                qos: flags.will_qos(),
                retain: flags.will_retain(),
                properties: Properties::new(),
                delay_interval: 0,
            });
            session.set_will(will);
        }
        self.pending_connacks.insert(id, pending);

        match self
            .auth
            .authenticate(&client_id, &username, &password, None, None)
        {
            AuthResult::Ok => self.finish_connect(id),
            AuthResult::Continue(_) | AuthResult::NotSupported => Err(self.refuse_v3(
                id,
                ConnectReturnCode::BadUserNameOrPassword,
                "broker: Extended auth is a v5 feature",
            )),
            AuthResult::Denied => Err(self.refuse_v3(
                id,
                ConnectReturnCode::NotAuthorized,
                "broker: Authentication denied",
            )),
        }
    }

    fn on_connect_v5(&mut self, id: SessionId, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let packet = match codec::v5::ConnectPacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(DecodeError::InvalidClientId) => {
                return Err(self.refuse_v5(
                    id,
                    ReasonCode::ClientIdentifierNotValid,
                    "broker: Invalid client id in CONNECT",
                ));
            }
            Err(err) => {
                let reason = match err {
                    DecodeError::PropertyNotAllowed | DecodeError::DuplicateProperty => {
                        ReasonCode::ProtocolError
                    }
                    _ => ReasonCode::MalformedPacket,
                };
                let _ = self.refuse_v5(id, reason, "");
                return Err(err.into());
            }
        };

        let flags = *packet.connect_flags();
        let clean_start = flags.clean_start();

        let mut pending = PendingConnAck::default();
        let mut client_id = packet.client_id().to_string();
        if client_id.is_empty() {
            if !self.general.allow_zero_length_clientid() {
                return Err(self.refuse_v5(
                    id,
                    ReasonCode::ClientIdentifierNotValid,
                    "broker: Zero-length client id refused",
                ));
            }
            // The assigned id goes back in the CONNACK [MQTT-3.2.2-16].
            client_id = format!("{}{}", self.general.auto_id_prefix(), random_string(12));
            pending.assigned_client_id = Some(client_id.clone());
        }
        let prefixes = self.general.clientid_prefixes().to_string();
        if !prefixes.is_empty() && !client_id.starts_with(&prefixes) {
            return Err(self.refuse_v5(
                id,
                ReasonCode::ClientIdentifierNotValid,
                "broker: Client id prefix not allowed",
            ));
        }

        if flags.will() && flags.will_retain() && !self.general.retain_available() {
            return Err(self.refuse_v5(
                id,
                ReasonCode::RetainNotSupported,
                "broker: Will retain refused, retain is disabled",
            ));
        }
        if flags.will() && flags.will_qos() > self.general.max_qos() {
            return Err(self.refuse_v5(
                id,
                ReasonCode::QoSNotSupported,
                "broker: Will QoS above maximum",
            ));
        }

        let requested_expiry = packet.properties().session_expiry_interval().unwrap_or(0);
        let session_expiry = requested_expiry.min(self.general.session_expiry_interval());
        if session_expiry != requested_expiry {
            pending.session_expiry = Some(session_expiry);
        }

        let mut keepalive = packet.keep_alive();
        if keepalive > self.general.max_keepalive() {
            keepalive = self.general.max_keepalive();
            pending.server_keepalive = Some(keepalive);
        }

        let receive_maximum = packet.properties().receive_maximum();
        let max_packet_size = packet.properties().maximum_packet_size().unwrap_or(0);
        let auth_method = packet
            .properties()
            .authentication_method()
            .map(ToString::to_string);
        let auth_data = packet
            .properties()
            .authentication_data()
            .map(<[u8]>::to_vec);
        let username = packet.username().to_string();
        let password = packet.password().to_vec();

        {
            let Some(session) = self.sessions.get_mut(&id) else {
                return Err(Error::new(ErrorKind::NotFound, "broker: Session gone"));
            };
            session.set_protocol(ProtocolLevel::V5, false);
            session.set_client_id(&client_id);
            session.set_clean_start(clean_start);
            session.set_session_expiry_interval(session_expiry);
            session.set_keepalive(keepalive);
            session.set_username(&username);
            session.set_max_packet_size(max_packet_size);
            session.set_auth_method(auth_method.clone());
            if let Some(receive_maximum) = receive_maximum {
                session
                    .msgs_out()
                    .shrink_inflight_maximum(usize::from(receive_maximum));
            }

            let will = packet.will_topic().map(|topic| WillMessage {
                topic: session.mount_topic(topic.as_ref()),
                payload: Bytes::copy_from_slice(packet.will_message()),
                qos: flags.will_qos(),
                retain: flags.will_retain(),
                properties: packet.will_properties().clone(),
                delay_interval: packet.will_properties().will_delay_interval().unwrap_or(0),
            });
            session.set_will(will);
        }
        self.pending_connacks.insert(id, pending);

        match self.auth.authenticate(
            &client_id,
            &username,
            &password,
            auth_method.as_deref(),
            auth_data.as_deref(),
        ) {
            AuthResult::Ok => self.finish_connect(id),
            AuthResult::Continue(data) => {
                // Extended authentication: the session parks in
                // `Authenticating` and AUTH packets go back and forth
                // until the method concludes.
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.set_state(SessionState::Authenticating);
                }
                let mut auth = codec::v5::AuthPacket::new(ReasonCode::ContinueAuthentication);
                if let Some(method) = &auth_method {
                    if let Ok(method) = StringData::from(method) {
                        auth.properties_mut()
                            .push(Property::AuthenticationMethod(method));
                    }
                }
                if let Ok(data) = codec::BinaryData::from_slice(&data) {
                    auth.properties_mut().push(Property::AuthenticationData(data));
                }
                self.send_packet(id, &auth)
            }
            AuthResult::NotSupported => Err(self.refuse_v5(
                id,
                ReasonCode::BadAuthenticationMethod,
                "broker: Authentication method not supported",
            )),
            AuthResult::Denied => Err(self.refuse_v5(
                id,
                ReasonCode::NotAuthorized,
                "broker: Authentication denied",
            )),
        }
    }

    pub(super) fn on_auth(&mut self, id: SessionId, buf: &[u8]) -> Result<(), Error> {
        if self.protocol_of(id) != ProtocolLevel::V5 {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                "broker: AUTH is a v5 packet",
            ));
        }
        let mut ba = ByteArray::new(buf);
        let packet = codec::v5::AuthPacket::decode(&mut ba)?;

        let (client_id, username, expected_method, state) = match self.sessions.get(&id) {
            Some(session) => (
                session.client_id().to_string(),
                session.username().to_string(),
                session.auth_method().map(ToString::to_string),
                session.state(),
            ),
            None => return Err(Error::new(ErrorKind::NotFound, "broker: Session gone")),
        };

        let method = packet
            .properties()
            .authentication_method()
            .map(ToString::to_string);
        if method.is_none() || method != expected_method {
            return Err(self.refuse_v5(
                id,
                ReasonCode::BadAuthenticationMethod,
                "broker: AUTH with a different method than CONNECT",
            ));
        }
        let data = packet.properties().authentication_data().map(<[u8]>::to_vec);

        match self.auth.authenticate(
            &client_id,
            &username,
            &[],
            method.as_deref(),
            data.as_deref(),
        ) {
            AuthResult::Ok => {
                if state == SessionState::Authenticating {
                    self.finish_connect(id)
                } else {
                    // Successful re-authentication of a live session.
                    self.send_packet(id, &codec::v5::AuthPacket::new(ReasonCode::Success))
                }
            }
            AuthResult::Continue(data) => {
                let mut auth = codec::v5::AuthPacket::new(ReasonCode::ContinueAuthentication);
                if let Some(method) = &method {
                    if let Ok(method) = StringData::from(method) {
                        auth.properties_mut()
                            .push(Property::AuthenticationMethod(method));
                    }
                }
                if let Ok(data) = codec::BinaryData::from_slice(&data) {
                    auth.properties_mut().push(Property::AuthenticationData(data));
                }
                self.send_packet(id, &auth)
            }
            AuthResult::NotSupported => Err(self.refuse_v5(
                id,
                ReasonCode::BadAuthenticationMethod,
                "broker: Authentication method not supported",
            )),
            AuthResult::Denied => Err(self.refuse_v5(
                id,
                ReasonCode::NotAuthorized,
                "broker: Authentication denied",
            )),
        }
    }

    /// Authentication is done; take over any prior session, answer with
    /// CONNACK, and put surviving traffic back on the wire.
    fn finish_connect(&mut self, id: SessionId) -> Result<(), Error> {
        let (client_id, clean_start, protocol) = match self.sessions.get(&id) {
            Some(session) => (
                session.client_id().to_string(),
                session.clean_start(),
                session.protocol(),
            ),
            None => return Err(Error::new(ErrorKind::NotFound, "broker: Session gone")),
        };
        let pending = self.pending_connacks.remove(&id).unwrap_or_default();

        let mut session_present = false;
        let prior = self.client_ids.get(&client_id).copied();
        if let Some(old_id) = prior {
            if old_id != id {
                session_present = self.take_over(old_id, id, clean_start);
            }
        }
        self.client_ids.insert(client_id.clone(), id);

        let max_topic_alias = {
            let Some(session) = self.sessions.get_mut(&id) else {
                return Err(Error::new(ErrorKind::NotFound, "broker: Session gone"));
            };
            session.set_state(SessionState::Active);
            session.max_topic_alias()
        };

        log::info!(
            "broker: Session {id} connected as {client_id} ({protocol}), session_present={session_present}"
        );

        if protocol == ProtocolLevel::V5 {
            let mut ack = codec::v5::ConnectAckPacket::new(session_present, ReasonCode::Success);
            let properties = ack.properties_mut();
            if let Some(assigned) = &pending.assigned_client_id {
                if let Ok(assigned) = StringData::from(assigned) {
                    properties.push(Property::AssignedClientIdentifier(assigned));
                }
            }
            if let Some(server_keepalive) = pending.server_keepalive {
                properties.push(Property::ServerKeepAlive(U16Data::new(server_keepalive)));
            }
            if let Some(session_expiry) = pending.session_expiry {
                properties.push(Property::SessionExpiryInterval(U32Data::new(session_expiry)));
            }
            properties.push(Property::TopicAliasMaximum(U16Data::new(max_topic_alias)));
            if !self.general.retain_available() {
                properties.push(Property::RetainAvailable(codec::BoolData::new(false)));
            }
            if self.general.max_qos() != QoS::ExactOnce {
                properties.push(Property::MaximumQoS(self.general.max_qos()));
            }
            self.send_packet(id, &ack)?;
        } else {
            let ack = codec::v3::ConnectAckPacket::new(
                session_present,
                codec::v3::ConnectReturnCode::Accepted,
            );
            self.send_packet(id, &ack)?;
        }

        // Everything that survived the reconnect goes out now: promoted
        // queued messages keep their place behind the in-flight entries,
        // so PUBREL retransmissions lead.
        self.drain_after_connect(id)?;

        // A resumed session gets the retained catch-up for its restored
        // subscriptions, minus anything its carried queues already hold.
        if session_present {
            let filters = self
                .sessions
                .get(&id)
                .map(|s| s.subscriptions().to_vec())
                .unwrap_or_default();
            for filter in filters {
                if crate::trie::split_shared_filter(&filter).is_some() {
                    continue;
                }
                let Some(options) = self.trie.options_of(id, &filter) else {
                    continue;
                };
                self.deliver_retained(id, &filter, options.qos, true);
            }
        }
        Ok(())
    }

    /// Displace the session `old_id` in favour of `new_id`.
    ///
    /// Returns whether the prior session's state was carried over, which
    /// becomes the CONNACK session-present flag.
    fn take_over(&mut self, old_id: SessionId, new_id: SessionId, new_clean_start: bool) -> bool {
        let now = self.clock.monotonic_secs();
        let wall = self.clock.wall_secs();

        let Some(mut old) = self.sessions.remove(&old_id) else {
            return false;
        };
        log::info!(
            "broker: Session takeover of {} ({old_id} -> {new_id})",
            old.client_id()
        );

        // Tell a still-connected victim why it is going away, then have
        // the server close its socket.
        if let Some(mut sink) = self.sinks.remove(&old_id) {
            if old.protocol() == ProtocolLevel::V5 {
                let packet = codec::v5::DisconnectPacket::new(ReasonCode::SessionTakenOver);
                let mut buf = Vec::new();
                if packet.encode(&mut buf).is_ok() {
                    let _ = sink.write(&buf);
                }
            }
            self.pending_closes.push(old_id);
        }
        self.pending_connacks.remove(&old_id);

        let discard = old.clean_start()
            || new_clean_start
            || old.expired(wall)
            || old.state() == SessionState::New
            || old.state() == SessionState::Authenticating;

        if discard {
            self.trie.clean_session(old_id);
            // The displaced session ends for good, so a pending will goes
            // out unless the expiry would have kept the session around.
            if old.session_expiry_interval() == 0 || new_clean_start {
                self.publish_will_of(&mut old);
            }
            return false;
        }

        // Carry the session state over: queues, subscriptions and the
        // packet id counter move; the new handle keeps its own quota
        // configuration. The old will is obsolete, the new CONNECT
        // brought its own.
        let (new_client_id, new_username) = match self.sessions.get(&new_id) {
            Some(session) => (
                session.client_id().to_string(),
                session.username().to_string(),
            ),
            None => return false,
        };

        let (mut inflight_out, mut queued_out) = old.msgs_out().take_entries();
        let (mut inflight_in, _queued_in) = old.msgs_in().take_entries();
        let subscriptions = old.take_subscriptions();
        let last_mid = old.last_mid();

        // The newly authenticated identity may have lost access to some of
        // the carried traffic; re-check it against the ACL.
        inflight_out.retain(|entry| {
            self.acl.acl_check(
                &new_client_id,
                &new_username,
                entry.store.topic(),
                AclAccess::Read,
                entry.qos,
                entry.retain,
            ) == AclResult::Allow
        });
        queued_out.retain(|entry| {
            self.acl.acl_check(
                &new_client_id,
                &new_username,
                entry.store.topic(),
                AclAccess::Read,
                entry.qos,
                entry.retain,
            ) == AclResult::Allow
        });
        // Inbound QoS 0/1 are dropped, the client retransmits them itself;
        // QoS 2 ids must be remembered to keep rejecting duplicates.
        inflight_in.retain(|entry| {
            entry.state == MessageState::WaitForPubrel
                && self.acl.acl_check(
                    &new_client_id,
                    &new_username,
                    entry.store.topic(),
                    AclAccess::Write,
                    entry.qos,
                    entry.retain,
                ) == AclResult::Allow
        });

        self.trie.rewrite_session(old_id, new_id);

        let Some(session) = self.sessions.get_mut(&new_id) else {
            return false;
        };
        session.set_last_mid(last_mid);
        session.msgs_out().adopt_entries(inflight_out, queued_out);
        session.msgs_out().reset_for_reconnect(now);
        session
            .msgs_in()
            .adopt_entries(inflight_in, std::collections::VecDeque::new());
        for filter in subscriptions {
            session.add_subscription(&filter);
        }
        true
    }

    /// Publish the will of a session that is no longer in the table.
    fn publish_will_of(&mut self, session: &mut crate::session::Session) {
        let Some(will) = session.take_will() else {
            return;
        };
        let wall = self.clock.wall_secs();
        let expiry_at = will
            .properties
            .message_expiry_interval()
            .map_or(0, |interval| wall + u64::from(interval));
        let qos = will.qos.min(self.general.max_qos());
        let retain = will.retain && self.general.retain_available();
        let properties = will.message_properties();
        log::info!(
            "broker: Publishing will of displaced session {} to {}",
            session.client_id(),
            will.topic
        );
        let message = Message::new(
            will.topic,
            will.payload,
            qos,
            retain,
            session.client_id().to_string(),
            session.username().to_string(),
            properties,
            expiry_at,
        );
        let message = self.store.insert(message);
        self.route_message(None, &message);
    }
}
