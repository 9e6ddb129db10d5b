// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The property list carried in the variable header of most MQTT 5.0
//! packets.
//!
//! A property consists of an identifier byte followed by a value whose
//! layout depends on the identifier. The whole list is prefixed with its
//! byte length as a variable byte integer. Except for User Property and
//! Subscription Identifier, it is a Protocol Error to include any property
//! more than once.

use crate::{
    BinaryData, BoolData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket,
    PubTopic, QoS, StringData, StringPairData, U16Data, U32Data, VarInt,
};

/// Properties that may legally appear multiple times in one list.
pub const MULTIPLE_PROPERTIES: &[PropertyType] = &[
    PropertyType::UserProperty,
    PropertyType::SubscriptionIdentifier,
];

/// Verify that `properties` only contains types from `types` and that no
/// single-valued property is duplicated.
///
/// # Errors
///
/// Returns the offending property type.
pub fn check_property_type_list(
    properties: &[Property],
    types: &[PropertyType],
) -> Result<(), PropertyType> {
    for property in properties {
        if !types.contains(&property.property_type()) {
            return Err(property.property_type());
        }
    }

    for property_type in types {
        if MULTIPLE_PROPERTIES.contains(property_type) {
            continue;
        }
        let count = properties
            .iter()
            .filter(|p| p.property_type() == *property_type)
            .count();
        if count > 1 {
            return Err(*property_type);
        }
    }

    Ok(())
}

#[allow(clippy::module_name_repetitions)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0b,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1a,
    ServerReference = 0x1c,
    ReasonString = 0x1f,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2a,
}

impl PropertyType {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for PropertyType {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(Self::PayloadFormatIndicator),
            0x02 => Ok(Self::MessageExpiryInterval),
            0x03 => Ok(Self::ContentType),
            0x08 => Ok(Self::ResponseTopic),
            0x09 => Ok(Self::CorrelationData),
            0x0b => Ok(Self::SubscriptionIdentifier),
            0x11 => Ok(Self::SessionExpiryInterval),
            0x12 => Ok(Self::AssignedClientIdentifier),
            0x13 => Ok(Self::ServerKeepAlive),
            0x15 => Ok(Self::AuthenticationMethod),
            0x16 => Ok(Self::AuthenticationData),
            0x17 => Ok(Self::RequestProblemInformation),
            0x18 => Ok(Self::WillDelayInterval),
            0x19 => Ok(Self::RequestResponseInformation),
            0x1a => Ok(Self::ResponseInformation),
            0x1c => Ok(Self::ServerReference),
            0x1f => Ok(Self::ReasonString),
            0x21 => Ok(Self::ReceiveMaximum),
            0x22 => Ok(Self::TopicAliasMaximum),
            0x23 => Ok(Self::TopicAlias),
            0x24 => Ok(Self::MaximumQoS),
            0x25 => Ok(Self::RetainAvailable),
            0x26 => Ok(Self::UserProperty),
            0x27 => Ok(Self::MaximumPacketSize),
            0x28 => Ok(Self::WildcardSubscriptionAvailable),
            0x29 => Ok(Self::SubscriptionIdentifierAvailable),
            0x2a => Ok(Self::SharedSubscriptionAvailable),
            _ => Err(DecodeError::InvalidPropertyType),
        }
    }
}

/// One property value.
///
/// Used-in notes follow MQTT 5.0 section 2.2.2.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    /// Byte. PUBLISH, Will Properties. 1 means the payload is UTF-8 data.
    PayloadFormatIndicator(BoolData),

    /// Four Byte Integer. PUBLISH, Will Properties. Lifetime of the message
    /// in seconds.
    MessageExpiryInterval(U32Data),

    /// UTF-8 String. PUBLISH, Will Properties. Application-defined content
    /// description.
    ContentType(StringData),

    /// UTF-8 String. PUBLISH, Will Properties. Topic name for a response
    /// message.
    ResponseTopic(PubTopic),

    /// Binary Data. PUBLISH, Will Properties. Opaque request/response
    /// correlation tag.
    CorrelationData(BinaryData),

    /// Variable Byte Integer. PUBLISH, SUBSCRIBE. Identifier of the matching
    /// subscription; 0 is a Protocol Error.
    SubscriptionIdentifier(VarInt),

    /// Four Byte Integer. CONNECT, CONNACK, DISCONNECT. Session lifetime in
    /// seconds after the network connection closes; 0xFFFFFFFF never
    /// expires [MQTT-3.1.2-23].
    SessionExpiryInterval(U32Data),

    /// UTF-8 String. CONNACK. The identifier the server assigned because the
    /// client connected with a zero-length one [MQTT-3.2.2-16].
    AssignedClientIdentifier(StringData),

    /// Two Byte Integer. CONNACK. Keep alive value the client MUST use
    /// instead of its own [MQTT-3.2.2-21].
    ServerKeepAlive(U16Data),

    /// UTF-8 String. CONNECT, CONNACK, AUTH. Name of the extended
    /// authentication method.
    AuthenticationMethod(StringData),

    /// Binary Data. CONNECT, CONNACK, AUTH. Method-defined authentication
    /// payload.
    AuthenticationData(BinaryData),

    /// Byte. CONNECT. Whether reason strings may be sent on packets other
    /// than PUBLISH, CONNACK and DISCONNECT [MQTT-3.1.2-29].
    RequestProblemInformation(BoolData),

    /// Four Byte Integer. Will Properties. Delay in seconds before the will
    /// is published; a reconnect within the delay cancels it [MQTT-3.1.3-9].
    WillDelayInterval(U32Data),

    /// Byte. CONNECT. Client asks the server to return response information
    /// in CONNACK.
    RequestResponseInformation(BoolData),

    /// UTF-8 String. CONNACK. Basis for building response topics.
    ResponseInformation(StringData),

    /// UTF-8 String. CONNACK, DISCONNECT. Another server the client may use.
    ServerReference(StringData),

    /// UTF-8 String. All acknowledgement packets. Human readable diagnostic.
    /// It must not be parsed by the receiver.
    ReasonString(StringData),

    /// Two Byte Integer. CONNECT, CONNACK. Number of QoS 1/2 publications
    /// the sender is willing to process concurrently; 0 is a Protocol
    /// Error.
    ReceiveMaximum(U16Data),

    /// Two Byte Integer. CONNECT, CONNACK. Highest topic alias the sender
    /// accepts; 0 means aliases are not accepted.
    TopicAliasMaximum(U16Data),

    /// Two Byte Integer. PUBLISH. Alias standing in for the topic name;
    /// 0 is a Protocol Error.
    TopicAlias(U16Data),

    /// Byte. CONNACK. Maximum QoS the server supports, 0 or 1.
    MaximumQoS(QoS),

    /// Byte. CONNACK. 0 means retained messages are not supported.
    RetainAvailable(BoolData),

    /// UTF-8 String Pair. Any packet. Application key/value metadata; may
    /// appear any number of times.
    UserProperty(StringPairData),

    /// Four Byte Integer. CONNECT, CONNACK. Largest packet the sender is
    /// willing to accept; 0 is a Protocol Error.
    MaximumPacketSize(U32Data),

    /// Byte. CONNACK. 0 means wildcard subscriptions are not supported.
    WildcardSubscriptionAvailable(BoolData),

    /// Byte. CONNACK. 0 means subscription identifiers are not supported.
    SubscriptionIdentifierAvailable(BoolData),

    /// Byte. CONNACK. 0 means shared subscriptions are not supported.
    SharedSubscriptionAvailable(BoolData),
}

impl Property {
    #[must_use]
    pub const fn property_type(&self) -> PropertyType {
        match self {
            Self::PayloadFormatIndicator(_) => PropertyType::PayloadFormatIndicator,
            Self::MessageExpiryInterval(_) => PropertyType::MessageExpiryInterval,
            Self::ContentType(_) => PropertyType::ContentType,
            Self::ResponseTopic(_) => PropertyType::ResponseTopic,
            Self::CorrelationData(_) => PropertyType::CorrelationData,
            Self::SubscriptionIdentifier(_) => PropertyType::SubscriptionIdentifier,
            Self::SessionExpiryInterval(_) => PropertyType::SessionExpiryInterval,
            Self::AssignedClientIdentifier(_) => PropertyType::AssignedClientIdentifier,
            Self::ServerKeepAlive(_) => PropertyType::ServerKeepAlive,
            Self::AuthenticationMethod(_) => PropertyType::AuthenticationMethod,
            Self::AuthenticationData(_) => PropertyType::AuthenticationData,
            Self::RequestProblemInformation(_) => PropertyType::RequestProblemInformation,
            Self::WillDelayInterval(_) => PropertyType::WillDelayInterval,
            Self::RequestResponseInformation(_) => PropertyType::RequestResponseInformation,
            Self::ResponseInformation(_) => PropertyType::ResponseInformation,
            Self::ServerReference(_) => PropertyType::ServerReference,
            Self::ReasonString(_) => PropertyType::ReasonString,
            Self::ReceiveMaximum(_) => PropertyType::ReceiveMaximum,
            Self::TopicAliasMaximum(_) => PropertyType::TopicAliasMaximum,
            Self::TopicAlias(_) => PropertyType::TopicAlias,
            Self::MaximumQoS(_) => PropertyType::MaximumQoS,
            Self::RetainAvailable(_) => PropertyType::RetainAvailable,
            Self::UserProperty(_) => PropertyType::UserProperty,
            Self::MaximumPacketSize(_) => PropertyType::MaximumPacketSize,
            Self::WildcardSubscriptionAvailable(_) => PropertyType::WildcardSubscriptionAvailable,
            Self::SubscriptionIdentifierAvailable(_) => {
                PropertyType::SubscriptionIdentifierAvailable
            }
            Self::SharedSubscriptionAvailable(_) => PropertyType::SharedSubscriptionAvailable,
        }
    }

    /// Get byte length used in packet, including the identifier byte.
    #[must_use]
    pub fn bytes(&self) -> usize {
        let value_bytes = match self {
            Self::PayloadFormatIndicator(_)
            | Self::RequestProblemInformation(_)
            | Self::RequestResponseInformation(_)
            | Self::MaximumQoS(_)
            | Self::RetainAvailable(_)
            | Self::WildcardSubscriptionAvailable(_)
            | Self::SubscriptionIdentifierAvailable(_)
            | Self::SharedSubscriptionAvailable(_) => BoolData::bytes(),

            Self::ServerKeepAlive(_)
            | Self::ReceiveMaximum(_)
            | Self::TopicAliasMaximum(_)
            | Self::TopicAlias(_) => U16Data::bytes(),

            Self::MessageExpiryInterval(_)
            | Self::SessionExpiryInterval(_)
            | Self::WillDelayInterval(_)
            | Self::MaximumPacketSize(_) => U32Data::bytes(),

            Self::ContentType(s)
            | Self::AssignedClientIdentifier(s)
            | Self::AuthenticationMethod(s)
            | Self::ResponseInformation(s)
            | Self::ServerReference(s)
            | Self::ReasonString(s) => s.bytes(),

            Self::ResponseTopic(t) => t.bytes(),
            Self::CorrelationData(b) | Self::AuthenticationData(b) => b.bytes(),
            Self::SubscriptionIdentifier(v) => v.bytes(),
            Self::UserProperty(p) => p.bytes(),
        };
        PropertyType::bytes() + value_bytes
    }
}

impl DecodePacket for Property {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let property_type = PropertyType::try_from(ba.read_byte()?)?;
        match property_type {
            PropertyType::PayloadFormatIndicator => {
                Ok(Self::PayloadFormatIndicator(BoolData::decode(ba)?))
            }
            PropertyType::MessageExpiryInterval => {
                Ok(Self::MessageExpiryInterval(U32Data::decode(ba)?))
            }
            PropertyType::ContentType => Ok(Self::ContentType(StringData::decode(ba)?)),
            PropertyType::ResponseTopic => Ok(Self::ResponseTopic(PubTopic::decode(ba)?)),
            PropertyType::CorrelationData => Ok(Self::CorrelationData(BinaryData::decode(ba)?)),
            PropertyType::SubscriptionIdentifier => {
                let id = VarInt::decode(ba)?;
                if id.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::SubscriptionIdentifier(id))
            }
            PropertyType::SessionExpiryInterval => {
                Ok(Self::SessionExpiryInterval(U32Data::decode(ba)?))
            }
            PropertyType::AssignedClientIdentifier => {
                Ok(Self::AssignedClientIdentifier(StringData::decode(ba)?))
            }
            PropertyType::ServerKeepAlive => Ok(Self::ServerKeepAlive(U16Data::decode(ba)?)),
            PropertyType::AuthenticationMethod => {
                Ok(Self::AuthenticationMethod(StringData::decode(ba)?))
            }
            PropertyType::AuthenticationData => {
                Ok(Self::AuthenticationData(BinaryData::decode(ba)?))
            }
            PropertyType::RequestProblemInformation => {
                Ok(Self::RequestProblemInformation(BoolData::decode(ba)?))
            }
            PropertyType::WillDelayInterval => Ok(Self::WillDelayInterval(U32Data::decode(ba)?)),
            PropertyType::RequestResponseInformation => {
                Ok(Self::RequestResponseInformation(BoolData::decode(ba)?))
            }
            PropertyType::ResponseInformation => {
                Ok(Self::ResponseInformation(StringData::decode(ba)?))
            }
            PropertyType::ServerReference => Ok(Self::ServerReference(StringData::decode(ba)?)),
            PropertyType::ReasonString => Ok(Self::ReasonString(StringData::decode(ba)?)),
            PropertyType::ReceiveMaximum => {
                let max = U16Data::decode(ba)?;
                if max.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::ReceiveMaximum(max))
            }
            PropertyType::TopicAliasMaximum => Ok(Self::TopicAliasMaximum(U16Data::decode(ba)?)),
            PropertyType::TopicAlias => {
                let alias = U16Data::decode(ba)?;
                if alias.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::TopicAlias(alias))
            }
            PropertyType::MaximumQoS => {
                let qos = QoS::decode(ba)?;
                if qos == QoS::ExactOnce {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::MaximumQoS(qos))
            }
            PropertyType::RetainAvailable => Ok(Self::RetainAvailable(BoolData::decode(ba)?)),
            PropertyType::UserProperty => Ok(Self::UserProperty(StringPairData::decode(ba)?)),
            PropertyType::MaximumPacketSize => {
                let max = U32Data::decode(ba)?;
                if max.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::MaximumPacketSize(max))
            }
            PropertyType::WildcardSubscriptionAvailable => {
                Ok(Self::WildcardSubscriptionAvailable(BoolData::decode(ba)?))
            }
            PropertyType::SubscriptionIdentifierAvailable => {
                Ok(Self::SubscriptionIdentifierAvailable(BoolData::decode(ba)?))
            }
            PropertyType::SharedSubscriptionAvailable => {
                Ok(Self::SharedSubscriptionAvailable(BoolData::decode(ba)?))
            }
        }
    }
}

impl EncodePacket for Property {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(self.property_type() as u8);
        let value_bytes = match self {
            Self::PayloadFormatIndicator(v)
            | Self::RequestProblemInformation(v)
            | Self::RequestResponseInformation(v)
            | Self::RetainAvailable(v)
            | Self::WildcardSubscriptionAvailable(v)
            | Self::SubscriptionIdentifierAvailable(v)
            | Self::SharedSubscriptionAvailable(v) => v.encode(buf)?,

            Self::ServerKeepAlive(v)
            | Self::ReceiveMaximum(v)
            | Self::TopicAliasMaximum(v)
            | Self::TopicAlias(v) => v.encode(buf)?,

            Self::MessageExpiryInterval(v)
            | Self::SessionExpiryInterval(v)
            | Self::WillDelayInterval(v)
            | Self::MaximumPacketSize(v) => v.encode(buf)?,

            Self::ContentType(v)
            | Self::AssignedClientIdentifier(v)
            | Self::AuthenticationMethod(v)
            | Self::ResponseInformation(v)
            | Self::ServerReference(v)
            | Self::ReasonString(v) => v.encode(buf)?,

            Self::ResponseTopic(v) => v.encode(buf)?,
            Self::CorrelationData(v) | Self::AuthenticationData(v) => v.encode(buf)?,
            Self::SubscriptionIdentifier(v) => v.encode(buf)?,
            Self::MaximumQoS(v) => v.encode(buf)?,
            Self::UserProperty(v) => v.encode(buf)?,
        };
        Ok(PropertyType::bytes() + value_bytes)
    }
}

/// The property list of one packet.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Properties(Vec<Property>);

impl AsRef<[Property]> for Properties {
    fn as_ref(&self) -> &[Property] {
        &self.0
    }
}

impl Properties {
    /// Create an empty property list.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Get byte length used in packet, including the length prefix.
    ///
    /// # Panics
    ///
    /// Raise panic if properties are larger than 256MB.
    #[must_use]
    pub fn bytes(&self) -> usize {
        let payload: usize = self.0.iter().map(Property::bytes).sum();
        let len = VarInt::from(payload).unwrap();
        len.bytes() + payload
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get a reference to property list.
    #[must_use]
    pub fn props(&self) -> &[Property] {
        &self.0
    }

    /// Push a property to the back of the list.
    pub fn push(&mut self, v: Property) {
        self.0.push(v);
    }

    /// Clear property list.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    fn first_of(&self, property_type: PropertyType) -> Option<&Property> {
        self.0.iter().find(|p| p.property_type() == property_type)
    }

    #[must_use]
    pub fn session_expiry_interval(&self) -> Option<u32> {
        match self.first_of(PropertyType::SessionExpiryInterval) {
            Some(Property::SessionExpiryInterval(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn receive_maximum(&self) -> Option<u16> {
        match self.first_of(PropertyType::ReceiveMaximum) {
            Some(Property::ReceiveMaximum(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn maximum_packet_size(&self) -> Option<u32> {
        match self.first_of(PropertyType::MaximumPacketSize) {
            Some(Property::MaximumPacketSize(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn topic_alias_maximum(&self) -> Option<u16> {
        match self.first_of(PropertyType::TopicAliasMaximum) {
            Some(Property::TopicAliasMaximum(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn topic_alias(&self) -> Option<u16> {
        match self.first_of(PropertyType::TopicAlias) {
            Some(Property::TopicAlias(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn authentication_method(&self) -> Option<&str> {
        match self.first_of(PropertyType::AuthenticationMethod) {
            Some(Property::AuthenticationMethod(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    #[must_use]
    pub fn authentication_data(&self) -> Option<&[u8]> {
        match self.first_of(PropertyType::AuthenticationData) {
            Some(Property::AuthenticationData(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    #[must_use]
    pub fn will_delay_interval(&self) -> Option<u32> {
        match self.first_of(PropertyType::WillDelayInterval) {
            Some(Property::WillDelayInterval(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn message_expiry_interval(&self) -> Option<u32> {
        match self.first_of(PropertyType::MessageExpiryInterval) {
            Some(Property::MessageExpiryInterval(v)) => Some(v.value()),
            _ => None,
        }
    }
}

impl DecodePacket for Properties {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let total = VarInt::decode(ba)?;
        let mut remaining = total.value();
        if remaining > ba.remaining_bytes() {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let mut properties = Vec::new();
        while remaining > 0 {
            let property = Property::decode(ba)?;
            remaining = remaining
                .checked_sub(property.bytes())
                .ok_or(DecodeError::InvalidRemainingLength)?;
            properties.push(property);
        }

        Ok(Self(properties))
    }
}

impl EncodePacket for Properties {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let payload: usize = self.0.iter().map(Property::bytes).sum();
        let len = VarInt::from(payload).map_err(|_| EncodeError::InvalidVarInt)?;
        let mut bytes_written = len.bytes();
        len.encode(buf)?;
        for property in &self.0 {
            bytes_written += property.encode(buf)?;
        }
        Ok(bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut properties = Properties::new();
        properties.push(Property::SessionExpiryInterval(U32Data::new(3600)));
        properties.push(Property::ReceiveMaximum(U16Data::new(20)));
        properties.push(Property::UserProperty(
            StringPairData::from("origin", "unit-test").unwrap(),
        ));

        let mut buf = Vec::new();
        let written = properties.encode(&mut buf).unwrap();
        assert_eq!(written, properties.bytes());

        let mut ba = ByteArray::new(&buf);
        let decoded = Properties::decode(&mut ba).unwrap();
        assert_eq!(decoded, properties);
        assert_eq!(decoded.session_expiry_interval(), Some(3600));
        assert_eq!(decoded.receive_maximum(), Some(20));
    }

    #[test]
    fn test_duplicate_single_valued_property() {
        let mut properties = Properties::new();
        properties.push(Property::ReceiveMaximum(U16Data::new(20)));
        properties.push(Property::ReceiveMaximum(U16Data::new(10)));
        assert_eq!(
            check_property_type_list(
                properties.props(),
                &[PropertyType::ReceiveMaximum, PropertyType::UserProperty]
            ),
            Err(PropertyType::ReceiveMaximum)
        );
    }

    #[test]
    fn test_property_not_allowed() {
        let mut properties = Properties::new();
        properties.push(Property::TopicAlias(U16Data::new(4)));
        assert_eq!(
            check_property_type_list(properties.props(), &[PropertyType::ReceiveMaximum]),
            Err(PropertyType::TopicAlias)
        );
    }

    #[test]
    fn test_zero_receive_maximum_rejected() {
        let buf = [0x03, 0x21, 0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            Properties::decode(&mut ba),
            Err(DecodeError::InvalidPropertyValue)
        );
    }
}
