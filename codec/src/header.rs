// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;
use std::fmt;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, ProtocolLevel, QoS,
    StringData, VarInt, VarIntError,
};

/// Common interface of all control packets.
pub trait Packet: Send + fmt::Debug {
    fn packet_type(&self) -> PacketType;
}

/// Control packet type, including the flag bits of the first header byte.
///
/// Only PUBLISH carries variable flags; every other type has a fixed
/// reserved pattern which MUST be validated [MQTT-2.2.2-2].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PacketType {
    /// Request to connect to broker.
    #[default]
    Connect,

    /// Broker reply to connect request.
    ConnectAck,

    /// Publish message.
    Publish { dup: bool, qos: QoS, retain: bool },

    /// Publish acknowledgement, QoS 1 reply.
    PublishAck,

    /// Publish received, first QoS 2 reply.
    PublishReceived,

    /// Publish release, second QoS 2 step.
    PublishRelease,

    /// Publish complete, final QoS 2 step.
    PublishComplete,

    /// Client subscribe request.
    Subscribe,

    /// Subscribe acknowledgement.
    SubscribeAck,

    /// Unsubscribe request.
    Unsubscribe,

    /// Unsubscribe acknowledgement.
    UnsubscribeAck,

    /// Client ping request.
    PingRequest,

    /// Server ping response.
    PingResponse,

    /// Connection is being closed.
    Disconnect,

    /// Authentication exchange, MQTT 5.0 only.
    Auth,
}

impl PacketType {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        let type_bits: Self = match packet_type {
            PacketType::Connect => 1,
            PacketType::ConnectAck => 2,
            PacketType::Publish { .. } => 3,
            PacketType::PublishAck => 4,
            PacketType::PublishReceived => 5,
            PacketType::PublishRelease => 6,
            PacketType::PublishComplete => 7,
            PacketType::Subscribe => 8,
            PacketType::SubscribeAck => 9,
            PacketType::Unsubscribe => 10,
            PacketType::UnsubscribeAck => 11,
            PacketType::PingRequest => 12,
            PacketType::PingResponse => 13,
            PacketType::Disconnect => 14,
            PacketType::Auth => 15,
        };

        let flag_bits: Self = match packet_type {
            PacketType::Publish { dup, qos, retain } => {
                let dup = if dup { 0b0000_1000 } else { 0b0000_0000 };
                let qos = (qos as Self) << 1;
                let retain = Self::from(retain);
                dup | qos | retain
            }
            // Bits 3,2,1 and 0 of the fixed header of these packets are
            // reserved and MUST be set to 0,0,1 and 0 [MQTT-3.6.1-1].
            PacketType::PublishRelease | PacketType::Subscribe | PacketType::Unsubscribe => {
                0b0000_0010
            }
            _ => 0b0000_0000,
        };

        (type_bits << 4) | flag_bits
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    /// Parse packet type and flag bits from one byte.
    ///
    /// If reserved flag bits do not hold the value required for the packet
    /// type, the receiver MUST close the network connection [MQTT-2.2.2-2];
    /// that is signalled here with `InvalidPacketFlags`.
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let type_bits = (v & 0b1111_0000) >> 4;
        let flag = v & 0b0000_1111;

        let packet_type = match type_bits {
            1 => Self::Connect,
            2 => Self::ConnectAck,
            3 => {
                let dup = (flag & 0b0000_1000) == 0b0000_1000;
                let retain = (flag & 0b0000_0001) == 0b0000_0001;
                let qos = match flag & 0b0000_0110 {
                    0b0000_0000 => QoS::AtMostOnce,
                    0b0000_0010 => QoS::AtLeastOnce,
                    0b0000_0100 => QoS::ExactOnce,
                    _ => return Err(DecodeError::InvalidPacketFlags),
                };
                return Ok(Self::Publish { dup, qos, retain });
            }
            4 => Self::PublishAck,
            5 => Self::PublishReceived,
            6 => Self::PublishRelease,
            7 => Self::PublishComplete,
            8 => Self::Subscribe,
            9 => Self::SubscribeAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubscribeAck,
            12 => Self::PingRequest,
            13 => Self::PingResponse,
            14 => Self::Disconnect,
            15 => Self::Auth,
            t => {
                log::error!("header: Invalid type bits: {t:#b}");
                return Err(DecodeError::InvalidPacketType);
            }
        };

        let expected_flag = match packet_type {
            PacketType::PublishRelease | PacketType::Subscribe | PacketType::Unsubscribe => {
                0b0000_0010
            }
            _ => 0b0000_0000,
        };
        if flag != expected_flag {
            log::error!("header: Got packet flag {flag:#b} in {packet_type:?}");
            return Err(DecodeError::InvalidPacketFlags);
        }

        Ok(packet_type)
    }
}

/// Fixed header part of a mqtt control packet. It consists of at least two
/// bytes.
///
/// ```txt
///  7 6 5 4 3 2 1 0
/// +-------+-------+
/// | Type  | Flags |
/// +-------+-------+
/// | Remaining Len |
/// +-------+-------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedHeader {
    packet_type: PacketType,

    /// `Remaining Length` is the number of bytes remaining within the
    /// current packet, not including the fixed header itself. It is encoded
    /// as a variable byte integer of at most four bytes.
    remaining_length: VarInt,
}

impl FixedHeader {
    /// Create a new fixed header with `packet_type` and `remaining_length`.
    ///
    /// # Errors
    ///
    /// Returns error if `remaining_length` is invalid.
    pub const fn new(packet_type: PacketType, remaining_length: usize) -> Result<Self, VarIntError> {
        let remaining_length = match VarInt::from(remaining_length) {
            Ok(v) => v,
            Err(err) => return Err(err),
        };
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }

    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[must_use]
    pub const fn remaining_length(&self) -> usize {
        self.remaining_length.value()
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        PacketType::bytes() + self.remaining_length.bytes()
    }
}

impl DecodePacket for FixedHeader {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flag = ba.read_byte()?;
        let packet_type = PacketType::try_from(flag)?;
        let remaining_length = VarInt::decode(ba)?;

        // The whole body must already be in the buffer; a short body is a
        // truncated packet, not a partial success.
        if ba.remaining_bytes() < remaining_length.value() {
            return Err(DecodeError::InvalidRemainingLength);
        }

        Ok(Self {
            packet_type,
            remaining_length,
        })
    }
}

impl EncodePacket for FixedHeader {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let packet_type: u8 = self.packet_type.into();
        buf.push(packet_type);
        self.remaining_length.encode(buf)?;
        Ok(self.bytes())
    }
}

/// Read the protocol name and level out of a complete CONNECT packet
/// buffer, without touching the rest of the packet.
///
/// The level decides whether the buffer is handed to the `v3` or `v5`
/// connect decoder. The second value is the bridge bit, which is only
/// defined for protocol 3.1/3.1.1.
///
/// # Errors
///
/// Returns error if the fixed header is malformed, the protocol name does
/// not match the level, or the level is unknown.
pub fn peek_connect_level(buf: &[u8]) -> Result<(ProtocolLevel, bool), DecodeError> {
    let mut ba = ByteArray::new(buf);
    let fixed_header = FixedHeader::decode(&mut ba)?;
    if fixed_header.packet_type() != PacketType::Connect {
        return Err(DecodeError::InvalidPacketType);
    }
    let protocol_name = StringData::decode(&mut ba)?;
    let level_byte = ba.read_byte()?;
    let bridge = level_byte & 0b1000_0000 != 0;
    let level = ProtocolLevel::try_from(level_byte & 0b0111_1111)?;
    if bridge && level == ProtocolLevel::V5 {
        return Err(DecodeError::InvalidProtocolLevel);
    }
    if protocol_name.as_ref() != level.protocol_name() {
        return Err(DecodeError::InvalidProtocolName);
    }
    Ok((level, bridge))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let mut buf = Vec::new();
        let fixed_header = FixedHeader::new(PacketType::PingResponse, 0).unwrap();
        assert_eq!(fixed_header.encode(&mut buf), Ok(2));
        assert_eq!(&buf, &[0xd0, 0x00]);
    }

    #[test]
    fn test_decode() {
        let buf = [
            0x30, 0x13, 0x00, 0x05, 0x68, 0x65, 0x6c, 0x6c, 0x6f, 0x48, 0x65, 0x6c, 0x6c, 0x6f,
            0x2c, 0x20, 0x77, 0x6f, 0x72, 0x6c, 0x64,
        ];
        let mut ba = ByteArray::new(&buf);
        let fixed_header = FixedHeader::decode(&mut ba).unwrap();
        assert_eq!(
            fixed_header.packet_type(),
            PacketType::Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false
            }
        );
        assert_eq!(fixed_header.remaining_length(), 19);
    }

    #[test]
    fn test_decode_rejects_reserved_flags() {
        // SUBSCRIBE with flag bits 0b0000 instead of 0b0010.
        let buf = [0x80, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            FixedHeader::decode(&mut ba),
            Err(DecodeError::InvalidPacketFlags)
        );
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        // Remaining length of 4 with only two body bytes present.
        let buf = [0xe0, 0x04, 0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            FixedHeader::decode(&mut ba),
            Err(DecodeError::InvalidRemainingLength)
        );
    }
}
