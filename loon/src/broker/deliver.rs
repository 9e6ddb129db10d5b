// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The outbound write scheduler.
//!
//! Three entry points, mirroring the three situations a session's outbound
//! list is in: `write_inflight_out(id, true)` writes only the trailing run
//! of not-yet-sent messages after something new was appended,
//! `write_inflight_out(id, false)` additionally walks older entries to
//! retry blocked writes and reconnect retransmissions, and
//! `write_queued_out` first promotes queued messages into the window.

use codec::{EncodePacket, PacketId, ProtocolLevel, QoS};

use super::Broker;
use crate::error::{Error, ErrorKind};
use crate::session::{ClientMessage, MessageState, SessionState};
use crate::sink::SinkOutcome;
use crate::types::SessionId;

fn encode_publish(
    entry: &ClientMessage,
    protocol: ProtocolLevel,
    mount_point: &str,
) -> Result<Vec<u8>, Error> {
    let topic = if mount_point.is_empty() {
        entry.store.topic()
    } else {
        entry
            .store
            .topic()
            .strip_prefix(mount_point)
            .unwrap_or_else(|| entry.store.topic())
    };

    let mut buf = Vec::new();
    if protocol == ProtocolLevel::V5 {
        let mut packet = codec::v5::PublishPacket::new(topic, entry.qos, entry.store.payload())?;
        packet.set_retain(entry.retain);
        if entry.qos != QoS::AtMostOnce {
            packet.set_packet_id(entry.mid);
            if entry.dup {
                packet.set_dup(true)?;
            }
        }
        for property in entry.store.properties().props() {
            packet.properties_mut().push(property.clone());
        }
        for property in entry.properties.props() {
            packet.properties_mut().push(property.clone());
        }
        packet.encode(&mut buf)?;
    } else {
        let mut packet = codec::v3::PublishPacket::new(topic, entry.qos, entry.store.payload())?;
        packet.set_retain(entry.retain);
        if entry.qos != QoS::AtMostOnce {
            packet.set_packet_id(entry.mid);
            if entry.dup {
                packet.set_dup(true)?;
            }
        }
        packet.encode(&mut buf)?;
    }
    Ok(buf)
}

fn encode_pubrel(mid: PacketId, protocol: ProtocolLevel) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    if protocol == ProtocolLevel::V5 {
        codec::v5::PublishReleasePacket::new(mid).encode(&mut buf)?;
    } else {
        codec::v3::PublishReleasePacket::new(mid).encode(&mut buf)?;
    }
    Ok(buf)
}

impl Broker {
    /// Write pending in-flight messages of `id`.
    ///
    /// With `only_latest` the walk starts behind the last entry that is
    /// already waiting for an acknowledgement, so a freshly appended
    /// message goes out without re-visiting older pending entries. Without
    /// it, every writable entry is visited, which also re-sends PUBREL for
    /// reconnect entries in `ResendPubrel` state.
    pub(crate) fn write_inflight_out(
        &mut self,
        id: SessionId,
        only_latest: bool,
    ) -> Result<(), Error> {
        let now = self.clock.monotonic_secs();
        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(());
        };
        if session.state() != SessionState::Active {
            return Ok(());
        }
        let protocol = session.protocol();
        let mount_point = session.mount_point().to_string();
        let max_packet_size = session.max_packet_size() as usize;

        let md = session.msgs_out();
        let mut index = if only_latest {
            let mut start = md.inflight_len();
            while start > 0 {
                let Some(entry) = md.inflight_get_mut(start - 1) else {
                    break;
                };
                if entry.state.is_publish_state() {
                    start -= 1;
                } else {
                    break;
                }
            }
            start
        } else {
            0
        };

        let Some(sink) = self.sinks.get_mut(&id) else {
            return Ok(());
        };

        while index < md.inflight_len() {
            let Some(entry) = md.inflight_get_mut(index) else {
                break;
            };
            let state = entry.state;
            let qos = entry.qos;
            let mid = entry.mid;

            let bytes = match state {
                MessageState::PublishQos0
                | MessageState::PublishQos1
                | MessageState::PublishQos2 => encode_publish(entry, protocol, &mount_point)?,
                MessageState::ResendPubrel if !only_latest => encode_pubrel(mid, protocol)?,
                _ => {
                    index += 1;
                    continue;
                }
            };

            // An oversize message is dropped, not truncated; the peer never
            // observes it and the window slot is handed back.
            if max_packet_size != 0 && bytes.len() > max_packet_size {
                log::warn!(
                    "broker: Dropping oversize outbound packet for session {id}, mid {mid}"
                );
                if qos == QoS::AtMostOnce {
                    md.remove_inflight_at(index);
                } else {
                    md.remove_inflight(mid, state);
                }
                continue;
            }

            match sink.write(&bytes) {
                SinkOutcome::Written => match state {
                    MessageState::PublishQos0 => {
                        md.remove_inflight_at(index);
                    }
                    MessageState::PublishQos1 => {
                        if let Some(entry) = md.inflight_get_mut(index) {
                            entry.state = MessageState::WaitForPuback;
                            entry.timestamp = now;
                        }
                        index += 1;
                    }
                    MessageState::PublishQos2 => {
                        if let Some(entry) = md.inflight_get_mut(index) {
                            entry.state = MessageState::WaitForPubrec;
                            entry.timestamp = now;
                        }
                        index += 1;
                    }
                    MessageState::ResendPubrel => {
                        if let Some(entry) = md.inflight_get_mut(index) {
                            entry.state = MessageState::WaitForPubcomp;
                            entry.timestamp = now;
                        }
                        index += 1;
                    }
                    _ => {
                        index += 1;
                    }
                },
                SinkOutcome::WouldBlock => {
                    // State untouched; the next tick retries from here.
                    return Ok(());
                }
                SinkOutcome::Closed => {
                    return Err(Error::from_string(
                        ErrorKind::ConnectionLost,
                        format!("broker: Connection of session {id} is gone"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Promote queued messages into the window, then write the promoted
    /// run.
    pub(crate) fn write_queued_out(&mut self, id: SessionId) -> Result<(), Error> {
        let now = self.clock.monotonic_secs();
        if let Some(session) = self.sessions.get_mut(&id) {
            if session.state() != SessionState::Active {
                return Ok(());
            }
            let md = session.msgs_out();
            while md.promote_one(now) {}
        }
        self.write_inflight_out(id, true)
    }

    /// Promote everything admissible and write the whole in-flight list;
    /// the reconnect drain.
    pub(crate) fn drain_after_connect(&mut self, id: SessionId) -> Result<(), Error> {
        let now = self.clock.monotonic_secs();
        if let Some(session) = self.sessions.get_mut(&id) {
            let md = session.msgs_out();
            while md.promote_one(now) {}
        }
        self.write_inflight_out(id, false)
    }
}
