// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The broker context: session table, subscription trie and message store
//! behind one value, driven by frames and clock ticks.
//!
//! Nothing here touches a socket. Frames come in through `handle_frame`,
//! outbound packets leave through each session's `PacketSink`, and the
//! server layer decides what to do when the broker reports a connection as
//! dead. Tests drive a broker instance directly with encoded packets.

use codec::{ByteArray, DecodePacket, EncodePacket, FixedHeader, PacketType, ProtocolLevel};
use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::{AccessControl, Authenticator};
use crate::clock::Clock;
use crate::config::General;
use crate::error::{Error, ErrorKind};
use crate::session::{Session, SessionConfig, SessionState};
use crate::sink::{PacketSink, SinkOutcome};
use crate::store::{Message, MessageStore};
use crate::trie::SubTrie;
use crate::types::SessionId;

mod connect;
mod deliver;
mod publish;
mod subscribe;

/// Data collected while a CONNECT is in flight, emitted with the CONNACK
/// once authentication completes.
#[derive(Debug, Default)]
struct PendingConnAck {
    assigned_client_id: Option<String>,
    server_keepalive: Option<u16>,
    session_expiry: Option<u32>,
}

pub struct Broker {
    general: General,
    clock: Arc<dyn Clock>,
    auth: Box<dyn Authenticator>,
    acl: Box<dyn AccessControl>,

    store: MessageStore,
    trie: SubTrie,

    sessions: HashMap<SessionId, Session>,

    /// Client id to session id; the takeover lookup.
    client_ids: HashMap<String, SessionId>,

    sinks: HashMap<SessionId, Box<dyn PacketSink>>,
    pending_connacks: HashMap<SessionId, PendingConnAck>,

    /// Connections the server must close: displaced takeover victims.
    pending_closes: Vec<SessionId>,
    next_session_id: SessionId,
}

impl Broker {
    #[must_use]
    pub fn new(
        general: General,
        clock: Arc<dyn Clock>,
        auth: Box<dyn Authenticator>,
        acl: Box<dyn AccessControl>,
    ) -> Self {
        Self {
            general,
            clock,
            auth,
            acl,
            store: MessageStore::new(),
            trie: SubTrie::new(),
            sessions: HashMap::new(),
            client_ids: HashMap::new(),
            sinks: HashMap::new(),
            pending_connacks: HashMap::new(),
            pending_closes: Vec::new(),
            next_session_id: 0,
        }
    }

    /// Register a freshly accepted connection. The session starts in `New`
    /// state and must present a CONNECT as its first packet.
    pub fn attach_connection(
        &mut self,
        sink: Box<dyn PacketSink>,
        config: &SessionConfig,
    ) -> SessionId {
        self.next_session_id += 1;
        let id = self.next_session_id;
        let session = Session::new(id, config, self.clock.monotonic_secs());
        self.sessions.insert(id, session);
        self.sinks.insert(id, sink);
        id
    }

    #[must_use]
    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(&id).map(Session::state)
    }

    #[must_use]
    pub fn session_id_of(&self, client_id: &str) -> Option<SessionId> {
        self.client_ids.get(client_id).copied()
    }

    /// Process one complete control packet from the client.
    ///
    /// # Errors
    ///
    /// An error means the connection must be closed; any required error
    /// response has already been written to the sink.
    pub fn handle_frame(&mut self, id: SessionId, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let fixed_header = FixedHeader::decode(&mut ba)?;
        let packet_type = fixed_header.packet_type();

        let Some(session) = self.sessions.get_mut(&id) else {
            return Err(Error::from_string(
                ErrorKind::NotFound,
                format!("broker: No session with id {id}"),
            ));
        };
        session.touch(self.clock.monotonic_secs());

        match session.state() {
            SessionState::New => {
                // The first packet MUST be a CONNECT [MQTT-3.1.0-1].
                if packet_type != PacketType::Connect {
                    return Err(Error::new(
                        ErrorKind::ProtocolError,
                        "broker: First packet is not CONNECT",
                    ));
                }
            }
            SessionState::Authenticating => {
                if packet_type != PacketType::Auth && packet_type != PacketType::Disconnect {
                    return Err(Error::new(
                        ErrorKind::ProtocolError,
                        "broker: Only AUTH may be exchanged during extended authentication",
                    ));
                }
            }
            SessionState::Active | SessionState::Disconnecting => {
                // A second CONNECT is a protocol violation [MQTT-3.1.0-2].
                if packet_type == PacketType::Connect {
                    return Err(Error::new(
                        ErrorKind::ProtocolError,
                        "broker: Got a second CONNECT packet",
                    ));
                }
            }
            SessionState::Duplicate | SessionState::Disconnected => {
                return Err(Error::from_string(
                    ErrorKind::NotFound,
                    format!("broker: Session {id} has no live connection"),
                ));
            }
        }

        match packet_type {
            PacketType::Connect => self.on_connect(id, buf),
            PacketType::Auth => self.on_auth(id, buf),
            PacketType::Publish { .. } => self.on_publish(id, buf),
            PacketType::PublishAck => self.on_puback(id, buf),
            PacketType::PublishReceived => self.on_pubrec(id, buf),
            PacketType::PublishRelease => self.on_pubrel(id, buf),
            PacketType::PublishComplete => self.on_pubcomp(id, buf),
            PacketType::Subscribe => self.on_subscribe(id, buf),
            PacketType::Unsubscribe => self.on_unsubscribe(id, buf),
            PacketType::PingRequest => self.on_ping_request(id, buf),
            PacketType::Disconnect => self.on_disconnect(id, buf),
            PacketType::ConnectAck
            | PacketType::SubscribeAck
            | PacketType::UnsubscribeAck
            | PacketType::PingResponse => Err(Error::from_string(
                ErrorKind::ProtocolError,
                format!("broker: Client must not send {packet_type:?}"),
            )),
        }
    }

    fn protocol_of(&self, id: SessionId) -> ProtocolLevel {
        self.sessions
            .get(&id)
            .map_or(ProtocolLevel::V311, Session::protocol)
    }

    /// Encode and write one control packet to the session's sink.
    fn send_packet<P: EncodePacket>(&mut self, id: SessionId, packet: &P) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        let max_packet_size = self
            .sessions
            .get(&id)
            .map_or(0, Session::max_packet_size);
        if max_packet_size != 0 && buf.len() > max_packet_size as usize {
            return Err(Error::from_string(
                ErrorKind::OversizePacket,
                format!(
                    "broker: Packet of {} bytes exceeds peer maximum {max_packet_size}",
                    buf.len()
                ),
            ));
        }
        let Some(sink) = self.sinks.get_mut(&id) else {
            return Err(Error::from_string(
                ErrorKind::NotFound,
                format!("broker: No sink for session {id}"),
            ));
        };
        match sink.write(&buf) {
            SinkOutcome::Written => Ok(()),
            SinkOutcome::WouldBlock => {
                log::warn!("broker: Outbound path congested for session {id}");
                Ok(())
            }
            SinkOutcome::Closed => Err(Error::from_string(
                ErrorKind::ConnectionLost,
                format!("broker: Connection of session {id} is gone"),
            )),
        }
    }

    fn on_ping_request(&mut self, id: SessionId, buf: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(buf);
        let _packet = codec::v3::PingRequestPacket::decode(&mut ba)?;
        self.send_packet(id, &codec::v3::PingResponsePacket::new())
    }

    fn on_puback(&mut self, id: SessionId, buf: &[u8]) -> Result<(), Error> {
        use crate::session::MessageState;

        let mut ba = ByteArray::new(buf);
        let mid = match self.protocol_of(id) {
            ProtocolLevel::V5 => codec::v5::PublishAckPacket::decode(&mut ba)?.packet_id(),
            _ => codec::v3::PublishAckPacket::decode(&mut ba)?.packet_id(),
        };

        if let Some(session) = self.sessions.get_mut(&id) {
            if session
                .msgs_out()
                .remove_inflight(mid, MessageState::WaitForPuback)
                .is_none()
            {
                log::warn!("broker: PUBACK for unknown mid {mid} from session {id}");
            }
        }
        self.write_queued_out(id)
    }

    fn on_pubrec(&mut self, id: SessionId, buf: &[u8]) -> Result<(), Error> {
        use crate::session::MessageState;

        let mut ba = ByteArray::new(buf);
        let (mid, failed) = match self.protocol_of(id) {
            ProtocolLevel::V5 => {
                let packet = codec::v5::PublishReceivedPacket::decode(&mut ba)?;
                (packet.packet_id(), packet.reason_code().is_error())
            }
            _ => (
                codec::v3::PublishReceivedPacket::decode(&mut ba)?.packet_id(),
                false,
            ),
        };

        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(());
        };
        if failed {
            // The receiver refused the message; the exchange ends here and
            // the window slot is released.
            if session
                .msgs_out()
                .remove_inflight(mid, MessageState::WaitForPubrec)
                .is_none()
            {
                log::warn!("broker: PUBREC error for unknown mid {mid} from session {id}");
            }
            return self.write_queued_out(id);
        }

        let now = self.clock.monotonic_secs();
        let found = session
            .msgs_out()
            .find_inflight(mid, MessageState::WaitForPubrec)
            .map(|entry| {
                entry.state = MessageState::WaitForPubcomp;
                entry.timestamp = now;
            })
            .is_some();

        if !found {
            log::warn!("broker: PUBREC for unknown mid {mid} from session {id}");
            if self.protocol_of(id) == ProtocolLevel::V5 {
                let packet = codec::v5::PublishReleasePacket::with_reason(
                    mid,
                    codec::v5::ReasonCode::PacketIdentifierNotFound,
                );
                return self.send_packet(id, &packet);
            }
            return Ok(());
        }

        match self.protocol_of(id) {
            ProtocolLevel::V5 => {
                self.send_packet(id, &codec::v5::PublishReleasePacket::new(mid))
            }
            _ => self.send_packet(id, &codec::v3::PublishReleasePacket::new(mid)),
        }
    }

    fn on_pubcomp(&mut self, id: SessionId, buf: &[u8]) -> Result<(), Error> {
        use crate::session::MessageState;

        let mut ba = ByteArray::new(buf);
        let mid = match self.protocol_of(id) {
            ProtocolLevel::V5 => codec::v5::PublishCompletePacket::decode(&mut ba)?.packet_id(),
            _ => codec::v3::PublishCompletePacket::decode(&mut ba)?.packet_id(),
        };

        if let Some(session) = self.sessions.get_mut(&id) {
            if session
                .msgs_out()
                .remove_inflight(mid, MessageState::WaitForPubcomp)
                .is_none()
            {
                log::warn!("broker: PUBCOMP for unknown mid {mid} from session {id}");
            }
        }
        self.write_queued_out(id)
    }

    fn on_disconnect(&mut self, id: SessionId, buf: &[u8]) -> Result<(), Error> {
        let protocol = self.protocol_of(id);
        let mut keep_will = false;

        if protocol == ProtocolLevel::V5 {
            let mut ba = ByteArray::new(buf);
            let packet = codec::v5::DisconnectPacket::decode(&mut ba)?;
            keep_will =
                packet.reason_code() == codec::v5::ReasonCode::DisconnectWithWillMessage;
            if let Some(interval) = packet.properties().session_expiry_interval() {
                let Some(session) = self.sessions.get_mut(&id) else {
                    return Ok(());
                };
                // A client that connected with expiry 0 cannot resurrect
                // its session on the way out [MQTT-3.1.2-23].
                if session.session_expiry_interval() == 0 && interval != 0 {
                    return Err(Error::new(
                        ErrorKind::ProtocolError,
                        "broker: DISCONNECT tried to raise a zero session expiry",
                    ));
                }
                session.set_session_expiry_interval(
                    interval.min(self.general.session_expiry_interval()),
                );
            }
        } else {
            let mut ba = ByteArray::new(buf);
            let _packet = codec::v3::DisconnectPacket::decode(&mut ba)?;
        }

        let wall = self.clock.wall_secs();
        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(());
        };
        session.set_state(SessionState::Disconnecting);

        // On a normal DISCONNECT the will MUST be discarded without being
        // published [MQTT-3.14.4-3]; the v5 with-will reason keeps it.
        if !keep_will {
            let _will = session.take_will();
        }
        let will_delay = session.will().map_or(0, |w| w.delay_interval);
        let expiry = session.session_expiry_interval();

        if expiry == 0 {
            if keep_will {
                self.activate_will(id);
            }
            self.remove_session(id);
        } else {
            if keep_will && will_delay > 0 {
                session.set_will_delay_until(Some(wall + u64::from(will_delay)));
            }
            session.mark_disconnected(wall);
            self.sinks.remove(&id);
            if keep_will && will_delay == 0 {
                self.activate_will(id);
            }
        }
        Ok(())
    }

    /// The socket of `id` is gone without a DISCONNECT having been
    /// processed: an abnormal close, which triggers the will.
    pub fn connection_closed(&mut self, id: SessionId) {
        let wall = self.clock.wall_secs();
        self.pending_connacks.remove(&id);

        let Some(session) = self.sessions.get_mut(&id) else {
            self.sinks.remove(&id);
            return;
        };
        match session.state() {
            SessionState::Disconnecting | SessionState::Disconnected | SessionState::Duplicate => {
                self.sinks.remove(&id);
                return;
            }
            SessionState::New
            | SessionState::Authenticating
            | SessionState::Active => {}
        }

        log::info!(
            "broker: Abnormal close of session {id} ({})",
            session.client_id()
        );
        let expiry = session.session_expiry_interval();
        let will_delay = session.will().map_or(0, |w| w.delay_interval);

        if expiry == 0 {
            // Session ends now: the will fires immediately, delay or not.
            self.activate_will(id);
            self.remove_session(id);
        } else {
            if will_delay > 0 {
                session.set_will_delay_until(Some(wall + u64::from(will_delay)));
            }
            session.mark_disconnected(wall);
            self.sinks.remove(&id);
            if will_delay == 0 {
                self.activate_will(id);
            }
        }
    }

    /// Publish the session's will message through the normal publish path.
    fn activate_will(&mut self, id: SessionId) {
        let wall = self.clock.wall_secs();
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let Some(will) = session.take_will() else {
            return;
        };
        let client_id = session.client_id().to_string();
        let username = session.username().to_string();

        let expiry_at = will
            .properties
            .message_expiry_interval()
            .map_or(0, |interval| wall + u64::from(interval));
        let qos = will.qos.min(self.general.max_qos());
        let retain = will.retain && self.general.retain_available();
        let properties = will.message_properties();
        log::info!("broker: Publishing will of {client_id} to {}", will.topic);
        let message = Message::new(
            will.topic,
            will.payload,
            qos,
            retain,
            client_id,
            username,
            properties,
            expiry_at,
        );
        let message = self.store.insert(message);
        self.route_message(Some(id), &message);
    }

    /// Drop every trace of the session: trie leaves, queues, table entry.
    /// Queue entries release their message references as they go.
    fn remove_session(&mut self, id: SessionId) {
        self.trie.clean_session(id);
        self.pending_connacks.remove(&id);
        self.sinks.remove(&id);
        if let Some(session) = self.sessions.remove(&id) {
            let client_id = session.client_id();
            if self.client_ids.get(client_id) == Some(&id) {
                self.client_ids.remove(client_id);
            }
        }
    }

    /// Periodic sweep: connect timeouts, keepalives, delayed wills,
    /// session expiry, queue expiry and pending writes.
    ///
    /// Returns the sessions whose sockets the server must close.
    pub fn tick(&mut self) -> Vec<SessionId> {
        let now = self.clock.monotonic_secs();
        let wall = self.clock.wall_secs();
        let mut to_close = std::mem::take(&mut self.pending_closes);
        let mut fire_will = Vec::new();
        let mut expire = Vec::new();
        let mut drain = Vec::new();

        for (&id, session) in &mut self.sessions {
            match session.state() {
                SessionState::New | SessionState::Authenticating => {
                    if self.general.connect_timeout() > 0
                        && session.idle_secs(now) > self.general.connect_timeout()
                    {
                        log::warn!("broker: Connect timeout of session {id}");
                        to_close.push(id);
                    }
                }
                SessionState::Active => {
                    if session.keepalive_expired(now) {
                        log::warn!(
                            "broker: Keepalive of session {id} ({}) expired",
                            session.client_id()
                        );
                        to_close.push(id);
                        continue;
                    }
                    session.msgs_out().drop_expired_queued(wall);
                    drain.push(id);
                }
                SessionState::Disconnected => {
                    if session.expired(wall) {
                        expire.push(id);
                        continue;
                    }
                    if session.will_delay_until().is_some_and(|at| wall >= at) {
                        fire_will.push(id);
                    }
                    session.msgs_out().drop_expired_queued(wall);
                }
                SessionState::Duplicate | SessionState::Disconnecting => {}
            }
        }

        for id in fire_will {
            self.activate_will(id);
        }
        for id in expire {
            // A will still pending at expiry fires as the session ends.
            self.activate_will(id);
            log::info!("broker: Session {id} expired");
            self.remove_session(id);
        }
        for id in drain {
            if let Err(err) = self.write_queued_out(id) {
                log::warn!("broker: Failed to drain session {id}: {err}");
                to_close.push(id);
                continue;
            }
            if let Err(err) = self.write_inflight_out(id, false) {
                log::warn!("broker: Failed to flush session {id}: {err}");
                to_close.push(id);
            }
        }

        self.store.compact();
        to_close
    }
}

#[cfg(test)]
mod tests;
