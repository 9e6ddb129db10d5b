// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::utils::validate_client_id;
use crate::{
    BinaryData, ByteArray, ConnectFlags, DecodeError, DecodePacket, EncodeError, EncodePacket,
    FixedHeader, Packet, PacketType, ProtocolLevel, PubTopic, StringData,
};

/// `ConnectPacket` is the first packet a client sends after the network
/// connection is established.
///
/// Basic structure of the packet:
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// +-----------------------+
/// | Protocol name         |
/// +-----------------------+
/// | Protocol level        |
/// +-----------------------+
/// | Connect flags         |
/// +-----------------------+
/// | Keep alive            |
/// +-----------------------+
/// | Client id             |
/// +-----------------------+
/// | Will topic (optional) |
/// +-----------------------+
/// | Will message (opt)    |
/// +-----------------------+
/// | Username (optional)   |
/// +-----------------------+
/// | Password (optional)   |
/// +-----------------------+
/// ```
///
/// The high bit of the protocol level byte marks a bridge connection; it is
/// only defined for protocol 3.1 and 3.1.1.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectPacket {
    protocol_level: ProtocolLevel,
    bridge: bool,
    connect_flags: ConnectFlags,
    keep_alive: u16,
    client_id: String,
    will_topic: Option<PubTopic>,
    will_message: Vec<u8>,
    username: String,
    password: Vec<u8>,
}

impl Default for ConnectPacket {
    fn default() -> Self {
        Self {
            protocol_level: ProtocolLevel::V311,
            bridge: false,
            connect_flags: ConnectFlags::default(),
            keep_alive: 60,
            client_id: String::new(),
            will_topic: None,
            will_message: Vec::new(),
            username: String::new(),
            password: Vec::new(),
        }
    }
}

impl ConnectPacket {
    /// Create a clean-start connect packet with `client_id`.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        validate_client_id(client_id)?;
        Ok(Self {
            client_id: client_id.to_string(),
            ..Self::default()
        })
    }

    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    #[must_use]
    pub const fn bridge(&self) -> bool {
        self.bridge
    }

    #[must_use]
    pub const fn connect_flags(&self) -> &ConnectFlags {
        &self.connect_flags
    }

    pub fn connect_flags_mut(&mut self) -> &mut ConnectFlags {
        &mut self.connect_flags
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Update client id.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn set_client_id(&mut self, client_id: &str) -> Result<&mut Self, EncodeError> {
        validate_client_id(client_id)?;
        self.client_id = client_id.to_string();
        Ok(self)
    }

    #[must_use]
    pub const fn will_topic(&self) -> Option<&PubTopic> {
        self.will_topic.as_ref()
    }

    #[must_use]
    pub fn will_message(&self) -> &[u8] {
        &self.will_message
    }

    /// Attach a will message.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic name.
    pub fn set_will(&mut self, topic: &str, message: &[u8]) -> Result<&mut Self, EncodeError> {
        self.will_topic = Some(PubTopic::new(topic).map_err(EncodeError::from)?);
        self.will_message = message.to_vec();
        self.connect_flags.set_will(true);
        Ok(self)
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn password(&self) -> &[u8] {
        &self.password
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let protocol_name = StringData::decode(ba)?;
        let level_byte = ba.read_byte()?;
        let bridge = level_byte & 0b1000_0000 != 0;
        let protocol_level = ProtocolLevel::try_from(level_byte & 0b0111_1111)?;
        if protocol_level == ProtocolLevel::V5 {
            // V5 connect packets carry properties and belong to the v5 module.
            return Err(DecodeError::InvalidProtocolLevel);
        }
        if protocol_name.as_ref() != protocol_level.protocol_name() {
            return Err(DecodeError::InvalidProtocolName);
        }

        let connect_flags = ConnectFlags::decode(ba, protocol_level)?;
        let keep_alive = ba.read_u16()?;

        let client_id = StringData::decode(ba)?;
        validate_client_id(client_id.as_ref()).map_err(|_| DecodeError::InvalidClientId)?;

        let (will_topic, will_message) = if connect_flags.will() {
            let topic = PubTopic::decode(ba)?;
            let message = BinaryData::decode(ba)?;
            (Some(topic), message.into_vec())
        } else {
            (None, Vec::new())
        };

        let username = if connect_flags.has_username() {
            StringData::decode(ba)?.into_string()
        } else {
            String::new()
        };
        let password = if connect_flags.has_password() {
            BinaryData::decode(ba)?.into_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            protocol_level,
            bridge,
            connect_flags,
            keep_alive,
            client_id: client_id.into_string(),
            will_topic,
            will_message,
            username,
            password,
        })
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let protocol_name = StringData::from(self.protocol_level.protocol_name())?;
        let mut remaining_length = protocol_name.bytes()
            + ProtocolLevel::bytes()
            + ConnectFlags::bytes()
            + 2 // keep alive
            + 2 + self.client_id.len();
        if let Some(will_topic) = &self.will_topic {
            remaining_length += will_topic.bytes();
            remaining_length += 2 + self.will_message.len();
        }
        if self.connect_flags.has_username() {
            remaining_length += 2 + self.username.len();
        }
        if self.connect_flags.has_password() {
            remaining_length += 2 + self.password.len();
        }

        let fixed_header = FixedHeader::new(PacketType::Connect, remaining_length)
            .map_err(|_| EncodeError::InvalidVarInt)?;
        fixed_header.encode(buf)?;

        protocol_name.encode(buf)?;
        let mut level_byte = self.protocol_level as u8;
        if self.bridge {
            level_byte |= 0b1000_0000;
        }
        buf.push(level_byte);
        self.connect_flags.encode(buf)?;
        buf.extend_from_slice(&self.keep_alive.to_be_bytes());

        StringData::from(&self.client_id)?.encode(buf)?;
        if let Some(will_topic) = &self.will_topic {
            will_topic.encode(buf)?;
            BinaryData::from_slice(&self.will_message)?.encode(buf)?;
        }
        if self.connect_flags.has_username() {
            StringData::from(&self.username)?.encode(buf)?;
        }
        if self.connect_flags.has_password() {
            BinaryData::from_slice(&self.password)?.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl Packet for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut packet = ConnectPacket::new("sensor-17").unwrap();
        packet.set_keep_alive(30);
        packet.set_will("alarms/offline", b"gone").unwrap();

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.will_topic().unwrap().as_ref(), "alarms/offline");
    }

    #[test]
    fn test_decode_rejects_bad_protocol_name() {
        let mut packet_buf = Vec::new();
        ConnectPacket::new("c").unwrap().encode(&mut packet_buf).unwrap();
        // Corrupt the protocol name.
        packet_buf[4] = b'X';
        let mut ba = ByteArray::new(&packet_buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidProtocolName)
        );
    }
}
