// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Inbound PUBLISH processing and the fan-out to matching sessions.

use bytes::Bytes;
use codec::v5::{Properties, PropertyType, ReasonCode};
use codec::{ByteArray, DecodePacket, PacketId, ProtocolLevel, QoS};
use std::sync::Arc;

use super::Broker;
use crate::auth::{AclAccess, AclResult};
use crate::error::{Error, ErrorKind};
use crate::session::{ClientMessage, Direction, MessageState, SessionState};
use crate::store::Message;
use crate::trie::Recipient;
use crate::types::SessionId;

/// The fields of an inbound publish after version differences and topic
/// aliasing are resolved.
struct InboundPublish {
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    dup: bool,
    mid: PacketId,
    properties: Properties,
}

impl Broker {
    fn decode_publish(
        &mut self,
        id: SessionId,
        buf: &[u8],
    ) -> Result<InboundPublish, Error> {
        let mut ba = ByteArray::new(buf);
        if self.protocol_of(id) == ProtocolLevel::V5 {
            let packet = codec::v5::PublishPacket::decode(&mut ba)?;

            // Resolve or record the topic alias, then strip it: an alias
            // is hop-local and must never be forwarded.
            let mut topic = packet.topic().to_string();
            if let Some(alias) = packet.properties().topic_alias() {
                let (max_alias, known) = match self.sessions.get(&id) {
                    Some(session) => (
                        session.max_topic_alias(),
                        session.topic_alias_in(alias).cloned(),
                    ),
                    None => {
                        return Err(Error::new(ErrorKind::NotFound, "broker: Session gone"));
                    }
                };
                if max_alias == 0 || alias > max_alias {
                    let disconnect = codec::v5::DisconnectPacket::new(ReasonCode::TopicAliasInvalid);
                    let _ = self.send_packet(id, &disconnect);
                    return Err(Error::new(
                        ErrorKind::ProtocolError,
                        "broker: Topic alias above the announced maximum",
                    ));
                }
                if topic.is_empty() {
                    match known {
                        Some(known) => topic = known,
                        None => {
                            let disconnect =
                                codec::v5::DisconnectPacket::new(ReasonCode::TopicAliasInvalid);
                            let _ = self.send_packet(id, &disconnect);
                            return Err(Error::new(
                                ErrorKind::ProtocolError,
                                "broker: Unknown topic alias",
                            ));
                        }
                    }
                } else if let Some(session) = self.sessions.get_mut(&id) {
                    session.set_topic_alias_in(alias, topic.clone());
                }
            }

            let mut properties = Properties::new();
            for property in packet.properties().props() {
                if property.property_type() != PropertyType::TopicAlias {
                    properties.push(property.clone());
                }
            }

            Ok(InboundPublish {
                topic,
                payload: Bytes::copy_from_slice(packet.message()),
                qos: packet.qos(),
                retain: packet.retain(),
                dup: packet.dup(),
                mid: packet.packet_id(),
                properties,
            })
        } else {
            let packet = codec::v3::PublishPacket::decode(&mut ba)?;
            Ok(InboundPublish {
                topic: packet.topic().to_string(),
                payload: Bytes::copy_from_slice(packet.message()),
                qos: packet.qos(),
                retain: packet.retain(),
                dup: packet.dup(),
                mid: packet.packet_id(),
                properties: Properties::new(),
            })
        }
    }

    pub(super) fn on_publish(&mut self, id: SessionId, buf: &[u8]) -> Result<(), Error> {
        let protocol = self.protocol_of(id);
        let inbound = self.decode_publish(id, buf)?;

        // QoS above the supported maximum is a protocol-level refusal.
        let max_qos = self.general.max_qos();
        if inbound.qos > max_qos {
            if protocol == ProtocolLevel::V5 {
                let disconnect = codec::v5::DisconnectPacket::new(ReasonCode::QoSNotSupported);
                let _ = self.send_packet(id, &disconnect);
            }
            return Err(Error::new(
                ErrorKind::NotSupported,
                "broker: Publish QoS above maximum",
            ));
        }

        if inbound.retain && !self.general.retain_available() {
            if protocol == ProtocolLevel::V5 {
                let disconnect = codec::v5::DisconnectPacket::new(ReasonCode::RetainNotSupported);
                let _ = self.send_packet(id, &disconnect);
            }
            return Err(Error::new(
                ErrorKind::NotSupported,
                "broker: Retained messages are disabled",
            ));
        }

        let size_limit = self.general.message_size_limit() as usize;
        if size_limit != 0 && inbound.payload.len() > size_limit {
            log::warn!(
                "broker: Dropping publish of {} bytes from session {id}, over the size limit",
                inbound.payload.len()
            );
            return match (protocol, inbound.qos) {
                (_, QoS::AtMostOnce) => Ok(()),
                (ProtocolLevel::V5, QoS::AtLeastOnce) => self.send_packet(
                    id,
                    &codec::v5::PublishAckPacket::with_reason(
                        inbound.mid,
                        ReasonCode::QuotaExceeded,
                    ),
                ),
                (ProtocolLevel::V5, QoS::ExactOnce) => self.send_packet(
                    id,
                    &codec::v5::PublishReceivedPacket::with_reason(
                        inbound.mid,
                        ReasonCode::QuotaExceeded,
                    ),
                ),
                _ => Err(Error::new(
                    ErrorKind::OversizePacket,
                    "broker: Publish payload over the size limit",
                )),
            };
        }

        let (client_id, username, mounted_topic) = {
            let Some(session) = self.sessions.get_mut(&id) else {
                return Err(Error::new(ErrorKind::NotFound, "broker: Session gone"));
            };
            (
                session.client_id().to_string(),
                session.username().to_string(),
                session.mount_topic(&inbound.topic),
            )
        };

        let allowed = self.acl.acl_check(
            &client_id,
            &username,
            &mounted_topic,
            AclAccess::Write,
            inbound.qos,
            inbound.retain,
        ) == AclResult::Allow;
        if !allowed {
            log::info!("broker: Denied publish from {client_id} to {mounted_topic}");
            // The message is dropped; QoS 1/2 still get their
            // acknowledgement so the client does not retry forever. v5
            // carries the real reason.
            return match (protocol, inbound.qos) {
                (_, QoS::AtMostOnce) => Ok(()),
                (ProtocolLevel::V5, QoS::AtLeastOnce) => self.send_packet(
                    id,
                    &codec::v5::PublishAckPacket::with_reason(
                        inbound.mid,
                        ReasonCode::NotAuthorized,
                    ),
                ),
                (ProtocolLevel::V5, QoS::ExactOnce) => self.send_packet(
                    id,
                    &codec::v5::PublishReceivedPacket::with_reason(
                        inbound.mid,
                        ReasonCode::NotAuthorized,
                    ),
                ),
                (_, QoS::AtLeastOnce) => {
                    self.send_packet(id, &codec::v3::PublishAckPacket::new(inbound.mid))
                }
                (_, QoS::ExactOnce) => {
                    self.send_packet(id, &codec::v3::PublishReceivedPacket::new(inbound.mid))
                }
            };
        }

        let expiry_at = inbound
            .properties
            .message_expiry_interval()
            .map_or(0, |interval| self.clock.wall_secs() + u64::from(interval));
        let message = Message::new(
            mounted_topic,
            inbound.payload,
            inbound.qos,
            inbound.retain,
            client_id,
            username,
            inbound.properties,
            expiry_at,
        );

        match inbound.qos {
            QoS::AtMostOnce => {
                let message = self.store.insert(message);
                self.route_message(Some(id), &message);
                Ok(())
            }
            QoS::AtLeastOnce => {
                let message = self.store.insert(message);
                let recipients = self.route_message(Some(id), &message);
                if protocol == ProtocolLevel::V5 && recipients == 0 {
                    self.send_packet(
                        id,
                        &codec::v5::PublishAckPacket::with_reason(
                            inbound.mid,
                            ReasonCode::NoMatchingSubscribers,
                        ),
                    )
                } else if protocol == ProtocolLevel::V5 {
                    self.send_packet(id, &codec::v5::PublishAckPacket::new(inbound.mid))
                } else {
                    self.send_packet(id, &codec::v3::PublishAckPacket::new(inbound.mid))
                }
            }
            QoS::ExactOnce => self.on_publish_qos2(id, protocol, inbound.dup, inbound.mid, message),
        }
    }

    /// First half of the inbound QoS 2 exchange: park the message keyed by
    /// packet id, deliver nothing yet.
    fn on_publish_qos2(
        &mut self,
        id: SessionId,
        protocol: ProtocolLevel,
        dup: bool,
        mid: PacketId,
        message: Message,
    ) -> Result<(), Error> {
        let now = self.clock.monotonic_secs();
        let payload_len = message.payload().len();

        let Some(session) = self.sessions.get_mut(&id) else {
            return Err(Error::new(ErrorKind::NotFound, "broker: Session gone"));
        };

        // A duplicate of a packet id still waiting for its PUBREL must not
        // be delivered twice [MQTT-4.3.3-2]; just acknowledge it again.
        if session
            .msgs_in()
            .find_inflight(mid, MessageState::WaitForPubrel)
            .is_some()
        {
            if !dup {
                log::warn!("broker: Repeated in-flight mid {mid} without dup from session {id}");
            }
            return match protocol {
                ProtocolLevel::V5 => {
                    self.send_packet(id, &codec::v5::PublishReceivedPacket::new(mid))
                }
                _ => self.send_packet(id, &codec::v3::PublishReceivedPacket::new(mid)),
            };
        }

        if !session.msgs_in().ready_for_flight(QoS::ExactOnce, payload_len) {
            if protocol == ProtocolLevel::V5 {
                let disconnect =
                    codec::v5::DisconnectPacket::new(ReasonCode::ReceiveMaximumExceeded);
                let _ = self.send_packet(id, &disconnect);
            }
            return Err(Error::new(
                ErrorKind::NoMemory,
                "broker: Inbound QoS 2 window exhausted",
            ));
        }

        let message = self.store.insert(message);
        let Some(session) = self.sessions.get_mut(&id) else {
            return Err(Error::new(ErrorKind::NotFound, "broker: Session gone"));
        };
        session.msgs_in().push_inflight(ClientMessage {
            store: message,
            mid,
            qos: QoS::ExactOnce,
            state: MessageState::WaitForPubrel,
            direction: Direction::In,
            dup: false,
            retain: false,
            timestamp: now,
            properties: Properties::new(),
        });

        match protocol {
            ProtocolLevel::V5 => self.send_packet(id, &codec::v5::PublishReceivedPacket::new(mid)),
            _ => self.send_packet(id, &codec::v3::PublishReceivedPacket::new(mid)),
        }
    }

    /// Second half of the inbound QoS 2 exchange: the client released the
    /// packet id, so the parked message goes through the trie now.
    pub(super) fn on_pubrel(&mut self, id: SessionId, buf: &[u8]) -> Result<(), Error> {
        let protocol = self.protocol_of(id);
        let mut ba = ByteArray::new(buf);
        let mid = match protocol {
            ProtocolLevel::V5 => codec::v5::PublishReleasePacket::decode(&mut ba)?.packet_id(),
            _ => codec::v3::PublishReleasePacket::decode(&mut ba)?.packet_id(),
        };

        let entry = self
            .sessions
            .get_mut(&id)
            .and_then(|session| session.msgs_in().remove_inflight(mid, MessageState::WaitForPubrel));

        match entry {
            Some(entry) => {
                self.route_message(Some(id), &entry.store);
                match protocol {
                    ProtocolLevel::V5 => {
                        self.send_packet(id, &codec::v5::PublishCompletePacket::new(mid))
                    }
                    _ => self.send_packet(id, &codec::v3::PublishCompletePacket::new(mid)),
                }
            }
            None => {
                log::warn!("broker: PUBREL for unknown mid {mid} from session {id}");
                match protocol {
                    ProtocolLevel::V5 => self.send_packet(
                        id,
                        &codec::v5::PublishCompletePacket::with_reason(
                            mid,
                            ReasonCode::PacketIdentifierNotFound,
                        ),
                    ),
                    _ => self.send_packet(id, &codec::v3::PublishCompletePacket::new(mid)),
                }
            }
        }
    }

    /// Apply the retained-slot rules and fan the message out to every
    /// matching session. Returns the number of sessions reached.
    pub(crate) fn route_message(
        &mut self,
        publisher: Option<SessionId>,
        message: &Arc<Message>,
    ) -> usize {
        if message.retain() {
            if message.payload().is_empty() {
                // A zero-byte retained payload clears the slot; the
                // message itself is still routed to current subscribers.
                self.trie.set_retained(message.topic(), None);
            } else {
                self.trie
                    .set_retained(message.topic(), Some(Arc::clone(message)));
            }
        }

        let recipients = self
            .trie
            .collect_recipients(message.topic(), self.general.allow_duplicate_messages());
        let mut reached = 0;
        for recipient in recipients {
            if recipient.no_local && publisher == Some(recipient.session_id) {
                continue;
            }
            if self.deliver_to_session(&recipient, message, false) {
                reached += 1;
            }
        }
        reached
    }

    /// Attach `message` to one session's outbound lists, subject to flow
    /// control, and push it onto the wire when possible.
    ///
    /// `as_retained` marks a delivery triggered by a new subscription,
    /// which always carries the retain flag [MQTT-3.3.1-8].
    pub(super) fn deliver_to_session(
        &mut self,
        recipient: &Recipient,
        message: &Arc<Message>,
        as_retained: bool,
    ) -> bool {
        let now = self.clock.monotonic_secs();
        let Some(session) = self.sessions.get_mut(&recipient.session_id) else {
            return false;
        };
        let online = match session.state() {
            SessionState::Active => true,
            SessionState::Disconnected => false,
            _ => return false,
        };

        let qos = message
            .qos()
            .min(recipient.qos)
            .min(session.max_qos());
        let retain = as_retained || (message.retain() && recipient.retain_as_published);
        let mid = if qos == QoS::AtMostOnce {
            PacketId::new(0)
        } else {
            session.next_mid()
        };
        let client_id = session.client_id().to_string();
        let payload_len = message.payload().len();

        let entry = ClientMessage {
            store: Arc::clone(message),
            mid,
            qos,
            state: MessageState::initial_publish(qos),
            direction: Direction::Out,
            dup: false,
            retain,
            timestamp: now,
            properties: Properties::new(),
        };

        let md = session.msgs_out();
        let delivered = if online && md.ready_for_flight(qos, payload_len) {
            md.push_inflight(entry);
            md.clear_dropping();
            true
        } else if md.ready_for_queue(qos, payload_len, online) {
            md.push_queued(entry);
            md.clear_dropping();
            true
        } else {
            // One log line per transition into the dropping condition;
            // further drops stay silent until an admission succeeds.
            if md.enter_dropping() {
                log::warn!(
                    "broker: Dropping outgoing messages for {client_id}, queue limits reached"
                );
            }
            false
        };

        if delivered && online {
            if let Err(err) = self.write_inflight_out(recipient.session_id, true) {
                log::warn!(
                    "broker: Failed to write to session {}: {err}",
                    recipient.session_id
                );
            }
        }
        delivered
    }
}
