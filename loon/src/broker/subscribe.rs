// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! SUBSCRIBE and UNSUBSCRIBE processing, including the retained-message
//! catch-up for new subscriptions.

use codec::v5::{ReasonCode, RetainHandling};
use codec::{ByteArray, DecodePacket, ProtocolLevel, QoS};

use super::Broker;
use crate::auth::{AclAccess, AclResult};
use crate::error::{Error, ErrorKind};
use crate::trie::{split_shared_filter, Recipient, SubscribeOptions};
use crate::types::SessionId;

/// One requested subscription, version differences flattened.
struct SubscribeRequest {
    filter: String,
    qos: QoS,
    no_local: bool,
    retain_as_published: bool,
    retain_handling: RetainHandling,
}

/// Prefix the listener mount point onto a filter, keeping a `$share`
/// prefix in front of it.
fn mount_filter(mount_point: &str, filter: &str) -> String {
    if mount_point.is_empty() {
        return filter.to_string();
    }
    match split_shared_filter(filter) {
        Some((group, plain)) => format!("$share/{group}/{mount_point}{plain}"),
        None => format!("{mount_point}{filter}"),
    }
}

impl Broker {
    pub(super) fn on_subscribe(&mut self, id: SessionId, buf: &[u8]) -> Result<(), Error> {
        let protocol = self.protocol_of(id);
        let mut ba = ByteArray::new(buf);

        let (packet_id, requests) = if protocol == ProtocolLevel::V5 {
            let packet = codec::v5::SubscribePacket::decode(&mut ba)?;
            let requests = packet
                .topics()
                .iter()
                .map(|topic| SubscribeRequest {
                    filter: topic.topic().to_string(),
                    qos: topic.options().qos(),
                    no_local: topic.options().no_local(),
                    retain_as_published: topic.options().retain_as_published(),
                    retain_handling: topic.options().retain_handling(),
                })
                .collect::<Vec<_>>();
            (packet.packet_id(), requests)
        } else {
            let packet = codec::v3::SubscribePacket::decode(&mut ba)?;
            let requests = packet
                .topics()
                .iter()
                .map(|topic| SubscribeRequest {
                    filter: topic.topic().to_string(),
                    qos: topic.qos(),
                    no_local: false,
                    retain_as_published: false,
                    retain_handling: RetainHandling::SendAtSubscribe,
                })
                .collect::<Vec<_>>();
            (packet.packet_id(), requests)
        };

        let (client_id, username, mount_point) = match self.sessions.get(&id) {
            Some(session) => (
                session.client_id().to_string(),
                session.username().to_string(),
                session.mount_point().to_string(),
            ),
            None => {
                return Err(Error::new(ErrorKind::NotFound, "broker: Session gone"));
            }
        };

        let mut v3_acks = Vec::with_capacity(requests.len());
        let mut v5_reasons = Vec::with_capacity(requests.len());
        let mut retained_jobs: Vec<(String, QoS)> = Vec::new();

        for request in &requests {
            let mounted = mount_filter(&mount_point, &request.filter);
            let shared = split_shared_filter(&mounted).is_some();
            let acl_topic = split_shared_filter(&mounted).map_or(mounted.as_str(), |(_, p)| p);

            let allowed = self.acl.acl_check(
                &client_id,
                &username,
                acl_topic,
                AclAccess::Subscribe,
                request.qos,
                false,
            ) == AclResult::Allow;
            if !allowed {
                log::info!("broker: Denied subscription of {client_id} to {mounted}");
                v3_acks.push(codec::v3::SubscribeAck::Failed);
                v5_reasons.push(ReasonCode::NotAuthorized);
                continue;
            }

            let granted = request.qos.min(self.general.max_qos());
            let options = SubscribeOptions {
                qos: granted,
                no_local: request.no_local,
                retain_as_published: request.retain_as_published,
            };
            match self.trie.subscribe(id, &mounted, options) {
                Ok(newly) => {
                    if let Some(session) = self.sessions.get_mut(&id) {
                        session.add_subscription(&mounted);
                    }
                    v3_acks.push(codec::v3::SubscribeAck::QoS(granted));
                    v5_reasons.push(match granted {
                        QoS::AtMostOnce => ReasonCode::Success,
                        QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
                        QoS::ExactOnce => ReasonCode::GrantedQoS2,
                    });

                    // Retained catch-up never applies to shared
                    // subscriptions, and v5 clients can opt out of it.
                    let send_retained = !shared
                        && match request.retain_handling {
                            RetainHandling::SendAtSubscribe => true,
                            RetainHandling::SendAtNewSubscribe => newly,
                            RetainHandling::DoNotSend => false,
                        };
                    if send_retained {
                        retained_jobs.push((mounted, granted));
                    }
                }
                Err(err) => {
                    log::error!("broker: Invalid subscribe filter {mounted}: {err}");
                    v3_acks.push(codec::v3::SubscribeAck::Failed);
                    v5_reasons.push(ReasonCode::TopicFilterInvalid);
                }
            }
        }

        if protocol == ProtocolLevel::V5 {
            let ack = codec::v5::SubscribeAckPacket::with_vec(packet_id, v5_reasons);
            self.send_packet(id, &ack)?;
        } else {
            let ack = codec::v3::SubscribeAckPacket::with_vec(packet_id, v3_acks);
            self.send_packet(id, &ack)?;
        }

        // Retained messages for the new subscriptions go out after the
        // SUBACK and before any later live publish.
        for (filter, granted) in retained_jobs {
            self.deliver_retained(id, &filter, granted, false);
        }
        Ok(())
    }

    /// Deliver the retained messages matching `filter` to session `id`.
    ///
    /// With `skip_carried`, messages already sitting in the session's
    /// outbound lists are not sent a second time; the resume path uses
    /// this so a queued copy and the retained copy do not both arrive.
    pub(super) fn deliver_retained(
        &mut self,
        id: SessionId,
        filter: &str,
        granted: QoS,
        skip_carried: bool,
    ) {
        let wall = self.clock.wall_secs();
        let messages = self.trie.retained_for_filter(filter);
        for message in messages {
            if message.is_expired(wall) {
                continue;
            }
            if skip_carried {
                let carried = self
                    .sessions
                    .get(&id)
                    .is_some_and(|s| s.msgs_out_ref().contains_db_id(message.db_id()));
                if carried {
                    continue;
                }
            }
            let recipient = Recipient {
                session_id: id,
                qos: granted,
                no_local: false,
                retain_as_published: true,
            };
            self.deliver_to_session(&recipient, &message, true);
        }
    }

    pub(super) fn on_unsubscribe(&mut self, id: SessionId, buf: &[u8]) -> Result<(), Error> {
        let protocol = self.protocol_of(id);
        let mut ba = ByteArray::new(buf);

        let (packet_id, filters) = if protocol == ProtocolLevel::V5 {
            let packet = codec::v5::UnsubscribePacket::decode(&mut ba)?;
            let filters = packet
                .topics()
                .iter()
                .map(|t| t.as_ref().to_string())
                .collect::<Vec<_>>();
            (packet.packet_id(), filters)
        } else {
            let packet = codec::v3::UnsubscribePacket::decode(&mut ba)?;
            let filters = packet
                .topics()
                .iter()
                .map(|t| t.as_ref().to_string())
                .collect::<Vec<_>>();
            (packet.packet_id(), filters)
        };

        let mount_point = self
            .sessions
            .get(&id)
            .map_or_else(String::new, |s| s.mount_point().to_string());

        let mut reasons = Vec::with_capacity(filters.len());
        for filter in &filters {
            let mounted = mount_filter(&mount_point, filter);
            let removed = self.trie.unsubscribe(id, &mounted);
            if let Some(session) = self.sessions.get_mut(&id) {
                session.remove_subscription(&mounted);
            }
            reasons.push(if removed {
                ReasonCode::Success
            } else {
                ReasonCode::NoSubscriptionExisted
            });
        }

        if protocol == ProtocolLevel::V5 {
            let ack = codec::v5::UnsubscribeAckPacket::with_vec(packet_id, reasons);
            self.send_packet(id, &ack)
        } else {
            let ack = codec::v3::UnsubscribeAckPacket::new(packet_id);
            self.send_packet(id, &ack)
        }
    }
}
