// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::utils::validate_client_id;
use crate::v5::property::check_property_type_list;
use crate::v5::{Properties, PropertyType};
use crate::{
    BinaryData, ByteArray, ConnectFlags, DecodeError, DecodePacket, EncodeError, EncodePacket,
    FixedHeader, Packet, PacketType, ProtocolLevel, PubTopic, StringData,
};

/// Properties allowed in the CONNECT variable header.
pub const CONNECT_PROPERTIES: &[PropertyType] = &[
    PropertyType::SessionExpiryInterval,
    PropertyType::ReceiveMaximum,
    PropertyType::MaximumPacketSize,
    PropertyType::TopicAliasMaximum,
    PropertyType::RequestResponseInformation,
    PropertyType::RequestProblemInformation,
    PropertyType::UserProperty,
    PropertyType::AuthenticationMethod,
    PropertyType::AuthenticationData,
];

/// Properties allowed in the will properties block of the payload.
pub const WILL_PROPERTIES: &[PropertyType] = &[
    PropertyType::WillDelayInterval,
    PropertyType::PayloadFormatIndicator,
    PropertyType::MessageExpiryInterval,
    PropertyType::ContentType,
    PropertyType::ResponseTopic,
    PropertyType::CorrelationData,
    PropertyType::UserProperty,
];

/// `ConnectPacket` for protocol 5.0.
///
/// Compared with the 3.x packet it adds a property list to the variable
/// header and, when the will flag is set, a will property block at the
/// front of the payload.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectPacket {
    connect_flags: ConnectFlags,
    keep_alive: u16,
    properties: Properties,
    client_id: String,
    will_properties: Properties,
    will_topic: Option<PubTopic>,
    will_message: Vec<u8>,
    username: String,
    password: Vec<u8>,
}

impl Default for ConnectPacket {
    fn default() -> Self {
        Self {
            connect_flags: ConnectFlags::default(),
            keep_alive: 60,
            properties: Properties::new(),
            client_id: String::new(),
            will_properties: Properties::new(),
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
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
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
    pub const fn will_properties(&self) -> &Properties {
        &self.will_properties
    }

    pub fn will_properties_mut(&mut self) -> &mut Properties {
        &mut self.will_properties
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
        let protocol_level = ProtocolLevel::try_from(level_byte)?;
        if protocol_level != ProtocolLevel::V5 {
            return Err(DecodeError::InvalidProtocolLevel);
        }
        if protocol_name.as_ref() != protocol_level.protocol_name() {
            return Err(DecodeError::InvalidProtocolName);
        }

        let connect_flags = ConnectFlags::decode(ba, protocol_level)?;
        let keep_alive = ba.read_u16()?;

        let properties = Properties::decode(ba)?;
        if let Err(property_type) = check_property_type_list(properties.props(), CONNECT_PROPERTIES)
        {
            log::error!("v5/connect: property type {property_type:?} cannot be used in properties!");
            return Err(DecodeError::PropertyNotAllowed);
        }

        let client_id = StringData::decode(ba)?;
        validate_client_id(client_id.as_ref()).map_err(|_| DecodeError::InvalidClientId)?;

        let (will_properties, will_topic, will_message) = if connect_flags.will() {
            let will_properties = Properties::decode(ba)?;
            if let Err(property_type) =
                check_property_type_list(will_properties.props(), WILL_PROPERTIES)
            {
                log::error!(
                    "v5/connect: property type {property_type:?} cannot be used in will properties!"
                );
                return Err(DecodeError::PropertyNotAllowed);
            }
            let topic = PubTopic::decode(ba)?;
            let message = BinaryData::decode(ba)?;
            (will_properties, Some(topic), message.into_vec())
        } else {
            (Properties::new(), None, Vec::new())
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
            connect_flags,
            keep_alive,
            properties,
            client_id: client_id.into_string(),
            will_properties,
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

        let protocol_name = StringData::from(ProtocolLevel::V5.protocol_name())?;
        let mut remaining_length = protocol_name.bytes()
            + ProtocolLevel::bytes()
            + ConnectFlags::bytes()
            + 2 // keep alive
            + self.properties.bytes()
            + 2 + self.client_id.len();
        if let Some(will_topic) = &self.will_topic {
            remaining_length += self.will_properties.bytes();
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
        ProtocolLevel::V5.encode(buf)?;
        self.connect_flags.encode(buf)?;
        buf.extend_from_slice(&self.keep_alive.to_be_bytes());
        self.properties.encode(buf)?;

        StringData::from(&self.client_id)?.encode(buf)?;
        if let Some(will_topic) = &self.will_topic {
            self.will_properties.encode(buf)?;
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
    use crate::v5::Property;
    use crate::U32Data;

    #[test]
    fn test_round_trip() {
        let mut packet = ConnectPacket::new("station-4").unwrap();
        packet
            .properties_mut()
            .push(Property::SessionExpiryInterval(U32Data::new(3600)));
        packet.set_will("status/station-4", b"offline").unwrap();

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.properties().session_expiry_interval(), Some(3600));
    }

    #[test]
    fn test_will_property_allow_list() {
        let mut packet = ConnectPacket::new("c").unwrap();
        packet.set_will("t", b"m").unwrap();
        // ServerKeepAlive is a CONNACK property and may not appear in the
        // will property block.
        packet.will_properties = {
            let mut p = Properties::new();
            p.push(Property::ServerKeepAlive(crate::U16Data::new(30)));
            p
        };
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::PropertyNotAllowed)
        );
    }
}
