// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::v5::property::check_property_type_list;
use crate::v5::{Properties, PropertyType};
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet, PacketId,
    PacketType, QoS, SubTopic,
};

/// Properties allowed in SUBSCRIBE.
pub const SUBSCRIBE_PROPERTIES: &[PropertyType] = &[
    PropertyType::SubscriptionIdentifier,
    PropertyType::UserProperty,
];

/// Retain handling controls whether retained messages are sent when the
/// subscription is established.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetainHandling {
    /// Send retained messages at the time of the subscribe.
    #[default]
    SendAtSubscribe = 0,

    /// Send retained messages only if the subscription does not currently
    /// exist.
    SendAtNewSubscribe = 1,

    /// Do not send retained messages.
    DoNotSend = 2,
}

impl TryFrom<u8> for RetainHandling {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::SendAtSubscribe),
            1 => Ok(Self::SendAtNewSubscribe),
            2 => Ok(Self::DoNotSend),
            _ => Err(DecodeError::InvalidPacketFlags),
        }
    }
}

/// The subscription options byte that follows each topic filter.
///
/// ```txt
///  7 6 5 4 3 2 1 0
/// +---+---+-+-+---+
/// |Res| RH|R|N|QoS|
/// +---+---+-+-+---+
/// ```
///
/// Bits 6 and 7 are reserved and MUST be zero [MQTT-3.8.3-5].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    qos: QoS,
    no_local: bool,
    retain_as_published: bool,
    retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    #[must_use]
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// If set, messages are not forwarded to a connection whose client id
    /// equals the publisher's [MQTT-3.8.3-3].
    #[must_use]
    pub const fn no_local(&self) -> bool {
        self.no_local
    }

    pub fn set_no_local(&mut self, no_local: bool) -> &mut Self {
        self.no_local = no_local;
        self
    }

    /// If set, forwarded messages keep the retain flag they were published
    /// with.
    #[must_use]
    pub const fn retain_as_published(&self) -> bool {
        self.retain_as_published
    }

    pub fn set_retain_as_published(&mut self, retain_as_published: bool) -> &mut Self {
        self.retain_as_published = retain_as_published;
        self
    }

    #[must_use]
    pub const fn retain_handling(&self) -> RetainHandling {
        self.retain_handling
    }

    pub fn set_retain_handling(&mut self, retain_handling: RetainHandling) -> &mut Self {
        self.retain_handling = retain_handling;
        self
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl DecodePacket for SubscriptionOptions {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let byte = ba.read_byte()?;
        if byte & 0b1100_0000 != 0 {
            return Err(DecodeError::InvalidPacketFlags);
        }
        let qos = QoS::try_from(byte & 0b0000_0011)?;
        let no_local = byte & 0b0000_0100 != 0;
        let retain_as_published = byte & 0b0000_1000 != 0;
        let retain_handling = RetainHandling::try_from((byte & 0b0011_0000) >> 4)?;
        Ok(Self {
            qos,
            no_local,
            retain_as_published,
            retain_handling,
        })
    }
}

impl EncodePacket for SubscriptionOptions {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let mut byte = self.qos as u8;
        if self.no_local {
            byte |= 0b0000_0100;
        }
        if self.retain_as_published {
            byte |= 0b0000_1000;
        }
        byte |= (self.retain_handling as u8) << 4;
        buf.push(byte);
        Ok(Self::bytes())
    }
}

/// One topic filter / options pair in the SUBSCRIBE payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeTopic {
    topic: SubTopic,
    options: SubscriptionOptions,
}

impl SubscribeTopic {
    /// Create a new filter entry.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic filter.
    pub fn new(topic: &str, options: SubscriptionOptions) -> Result<Self, EncodeError> {
        let topic = SubTopic::new(topic).map_err(EncodeError::from)?;
        Ok(Self { topic, options })
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    #[must_use]
    pub const fn options(&self) -> SubscriptionOptions {
        self.options
    }

    fn bytes(&self) -> usize {
        self.topic.bytes() + SubscriptionOptions::bytes()
    }
}

/// `SubscribePacket` for protocol 5.0.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribePacket {
    packet_id: PacketId,
    properties: Properties,
    topics: Vec<SubscribeTopic>,
}

impl SubscribePacket {
    /// Create a packet subscribing to a single filter.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic filter.
    pub fn new(topic: &str, qos: QoS, packet_id: PacketId) -> Result<Self, EncodeError> {
        let topic = SubscribeTopic::new(topic, SubscriptionOptions::new(qos))?;
        Ok(Self {
            packet_id,
            properties: Properties::new(),
            topics: vec![topic],
        })
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    #[must_use]
    pub fn topics(&self) -> &[SubscribeTopic] {
        &self.topics
    }
}

impl DecodePacket for SubscribePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Subscribe {
            return Err(DecodeError::InvalidPacketType);
        }
        let body_start = ba.offset();

        let packet_id = PacketId::decode(ba)?;
        if packet_id.value() == 0 {
            return Err(DecodeError::InvalidPacketId);
        }

        let properties = Properties::decode(ba)?;
        if let Err(property_type) =
            check_property_type_list(properties.props(), SUBSCRIBE_PROPERTIES)
        {
            log::error!(
                "v5/subscribe: property type {property_type:?} cannot be used in properties!"
            );
            return Err(DecodeError::PropertyNotAllowed);
        }

        let mut topics = Vec::new();
        while ba.offset() - body_start < fixed_header.remaining_length() {
            let topic = SubTopic::decode(ba)?;
            let options = SubscriptionOptions::decode(ba)?;
            topics.push(SubscribeTopic { topic, options });
        }

        if topics.is_empty() {
            // A SUBSCRIBE packet with no payload is a protocol error
            // [MQTT-3.8.3-2].
            return Err(DecodeError::EmptyTopicFilter);
        }

        Ok(Self {
            packet_id,
            properties,
            topics,
        })
    }
}

impl EncodePacket for SubscribePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        let remaining_length = PacketId::bytes()
            + self.properties.bytes()
            + self.topics.iter().map(SubscribeTopic::bytes).sum::<usize>();
        let fixed_header = FixedHeader::new(PacketType::Subscribe, remaining_length)
            .map_err(|_| EncodeError::InvalidVarInt)?;
        fixed_header.encode(buf)?;
        self.packet_id.encode(buf)?;
        self.properties.encode(buf)?;
        for topic in &self.topics {
            topic.topic.encode(buf)?;
            topic.options.encode(buf)?;
        }
        Ok(buf.len() - old_len)
    }
}

impl Packet for SubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let packet = SubscribePacket::new("x/#", QoS::AtLeastOnce, PacketId::new(17)).unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(SubscribePacket::decode(&mut ba), Ok(packet));
    }

    #[test]
    fn test_options_reserved_bits() {
        let buf = [0b1100_0000];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            SubscriptionOptions::decode(&mut ba),
            Err(DecodeError::InvalidPacketFlags)
        );
    }

    #[test]
    fn test_options_round_trip() {
        let mut options = SubscriptionOptions::new(QoS::ExactOnce);
        options
            .set_no_local(true)
            .set_retain_handling(RetainHandling::DoNotSend);
        let mut buf = Vec::new();
        options.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(SubscriptionOptions::decode(&mut ba), Ok(options));
    }
}
