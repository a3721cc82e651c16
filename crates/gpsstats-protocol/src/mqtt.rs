//! MQTT 3.1.1 packet codec
//!
//! Covers what a publish-only client exchanges with a broker: CONNECT/CONNACK,
//! PUBLISH and its acknowledgement flows, PINGREQ/PINGRESP and DISCONNECT.
//!
//! Fixed header layout:
//!
//! ```text
//! byte 0      : packet type (high nibble) | flags (low nibble)
//! byte 1..=4  : remaining length, 7 bits per byte, MSB = continuation
//! ```

use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::ProtocolError;

/// Default plain-text MQTT port
pub const DEFAULT_PORT: u16 = 1883;
/// Default MQTT-over-TLS port
pub const DEFAULT_TLS_PORT: u16 = 8883;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const MAX_REMAINING_LENGTH: usize = 268_435_455;

// ============================================================================
// Packet types
// ============================================================================

/// Control packet type (high nibble of the first header byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

/// Delivery guarantee of a PUBLISH
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive)]
pub enum QoS {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        QoS::try_from(value).map_err(|_| ProtocolError::InvalidValue {
            field: "QoS".to_string(),
            value,
        })
    }
}

/// CONNACK return code
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl std::fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            ConnectReturnCode::Accepted => "connection accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnectReturnCode::IdentifierRejected => "identifier rejected",
            ConnectReturnCode::ServerUnavailable => "server unavailable",
            ConnectReturnCode::BadUserNameOrPassword => "bad user name or password",
            ConnectReturnCode::NotAuthorized => "not authorized",
        };
        f.write_str(reason)
    }
}

// ============================================================================
// Outgoing packets
// ============================================================================

/// CONNECT packet fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect<'a> {
    pub client_id: &'a str,
    /// Keep-alive in seconds
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
}

/// PUBLISH packet fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
    /// Required for QoS 1/2, ignored for QoS 0
    pub packet_id: Option<u16>,
}

/// Packets a publish-only client receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    ConnAck {
        session_present: bool,
        code: ConnectReturnCode,
    },
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    PingResp,
}

pub fn encode_connect(connect: &Connect<'_>, out: &mut BytesMut) -> Result<(), ProtocolError> {
    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }

    let mut len = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;
    len += 2 + connect.client_id.len();
    if let Some(username) = connect.username {
        flags |= 0x80;
        len += 2 + username.len();
    }
    if let Some(password) = connect.password {
        flags |= 0x40;
        len += 2 + password.len();
    }

    out.reserve(len + 5);
    out.put_u8((PacketType::Connect as u8) << 4);
    write_remaining_length(len, out)?;
    put_str(PROTOCOL_NAME, out)?;
    out.put_u8(PROTOCOL_LEVEL);
    out.put_u8(flags);
    out.put_u16(connect.keep_alive);
    put_str(connect.client_id, out)?;
    if let Some(username) = connect.username {
        put_str(username, out)?;
    }
    if let Some(password) = connect.password {
        put_str(password, out)?;
    }
    Ok(())
}

pub fn encode_publish(publish: &Publish<'_>, out: &mut BytesMut) -> Result<(), ProtocolError> {
    let packet_id = match publish.qos {
        QoS::AtMostOnce => None,
        QoS::AtLeastOnce | QoS::ExactlyOnce => {
            Some(publish.packet_id.ok_or(ProtocolError::InvalidValue {
                field: "packet_id".to_string(),
                value: 0,
            })?)
        },
    };

    let mut len = 2 + publish.topic.len() + publish.payload.len();
    if packet_id.is_some() {
        len += 2;
    }

    let mut header = (PacketType::Publish as u8) << 4;
    header |= (publish.qos as u8) << 1;
    if publish.retain {
        header |= 0x01;
    }

    out.reserve(len + 5);
    out.put_u8(header);
    write_remaining_length(len, out)?;
    put_str(publish.topic, out)?;
    if let Some(id) = packet_id {
        out.put_u16(id);
    }
    out.put_slice(publish.payload);
    Ok(())
}

pub fn encode_pubrel(packet_id: u16, out: &mut BytesMut) {
    // PUBREL carries the mandatory 0b0010 flags
    out.put_u8(((PacketType::PubRel as u8) << 4) | 0x02);
    out.put_u8(2);
    out.put_u16(packet_id);
}

pub fn encode_pingreq(out: &mut BytesMut) {
    out.put_u8((PacketType::PingReq as u8) << 4);
    out.put_u8(0);
}

pub fn encode_disconnect(out: &mut BytesMut) {
    out.put_u8((PacketType::Disconnect as u8) << 4);
    out.put_u8(0);
}

// ============================================================================
// Incoming packets
// ============================================================================

/// Decodes one packet from the front of `buf`.
///
/// Returns `Ok(None)` until a complete packet is buffered. A complete packet is
/// always consumed, even when it is rejected, so the stream stays framed unless
/// the error [`is_desync`](ProtocolError::is_desync).
pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let Some((remaining, header_len)) = read_remaining_length(&buf[1..])? else {
        return Ok(None);
    };
    let total = 1 + header_len + remaining;
    if buf.len() < total {
        return Ok(None);
    }

    let mut frame = buf.split_to(total);
    let first = frame.get_u8();
    frame.advance(header_len);

    let kind = first >> 4;
    let packet_type =
        PacketType::try_from(kind).map_err(|_| ProtocolError::UnsupportedPacket(kind))?;

    let packet = match packet_type {
        PacketType::ConnAck => {
            expect_length(remaining, 2)?;
            let session_present = frame.get_u8() & 0x01 == 0x01;
            let raw = frame.get_u8();
            let code =
                ConnectReturnCode::try_from(raw).map_err(|_| ProtocolError::InvalidValue {
                    field: "ConnectReturnCode".to_string(),
                    value: raw,
                })?;
            Packet::ConnAck {
                session_present,
                code,
            }
        },
        PacketType::PubAck => {
            expect_length(remaining, 2)?;
            Packet::PubAck(frame.get_u16())
        },
        PacketType::PubRec => {
            expect_length(remaining, 2)?;
            Packet::PubRec(frame.get_u16())
        },
        PacketType::PubRel => {
            expect_length(remaining, 2)?;
            Packet::PubRel(frame.get_u16())
        },
        PacketType::PubComp => {
            expect_length(remaining, 2)?;
            Packet::PubComp(frame.get_u16())
        },
        PacketType::PingResp => {
            expect_length(remaining, 0)?;
            Packet::PingResp
        },
        other => return Err(ProtocolError::UnsupportedPacket(other as u8)),
    };

    Ok(Some(packet))
}

fn expect_length(actual: usize, expected: usize) -> Result<(), ProtocolError> {
    if actual != expected {
        return Err(ProtocolError::InvalidLength { expected, actual });
    }
    Ok(())
}

// ============================================================================
// Primitives
// ============================================================================

pub fn write_remaining_length(mut len: usize, out: &mut BytesMut) -> Result<(), ProtocolError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PacketTooLarge(len));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Returns `(value, encoded_bytes)`, or `None` if the field is still incomplete.
pub fn read_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(ProtocolError::MalformedRemainingLength);
        }
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if buf.len() >= 4 {
        return Err(ProtocolError::MalformedRemainingLength);
    }
    Ok(None)
}

fn put_str(value: &str, out: &mut BytesMut) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::StringTooLong(value.len()))?;
    out.put_u16(len);
    out.put_slice(value.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remaining_length_bytes(len: usize) -> Vec<u8> {
        let mut out = BytesMut::new();
        write_remaining_length(len, &mut out).unwrap();
        out.to_vec()
    }

    #[test]
    fn test_remaining_length_boundaries() {
        assert_eq!(remaining_length_bytes(0), [0x00]);
        assert_eq!(remaining_length_bytes(127), [0x7F]);
        assert_eq!(remaining_length_bytes(128), [0x80, 0x01]);
        assert_eq!(remaining_length_bytes(16_383), [0xFF, 0x7F]);
        assert_eq!(remaining_length_bytes(16_384), [0x80, 0x80, 0x01]);

        assert_eq!(
            read_remaining_length(&[0x80, 0x80, 0x01]).unwrap(),
            Some((16_384, 3))
        );
        assert_eq!(read_remaining_length(&[0x80]).unwrap(), None);
        assert!(matches!(
            read_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(ProtocolError::MalformedRemainingLength)
        ));
    }

    #[test]
    fn test_remaining_length_too_large() {
        let mut out = BytesMut::new();
        assert!(matches!(
            write_remaining_length(MAX_REMAINING_LENGTH + 1, &mut out),
            Err(ProtocolError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn test_encode_connect_with_credentials() {
        let mut out = BytesMut::new();
        encode_connect(
            &Connect {
                client_id: "gps",
                keep_alive: 60,
                clean_session: true,
                username: Some("u"),
                password: Some("pw"),
            },
            &mut out,
        )
        .unwrap();

        let expected: &[u8] = &[
            0x10, 22, // header, remaining length
            0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
            0x04, // level
            0xC2, // username | password | clean session
            0x00, 0x3C, // keep alive
            0x00, 0x03, b'g', b'p', b's', // client id
            0x00, 0x01, b'u', // username
            0x00, 0x02, b'p', b'w', // password
        ];
        assert_eq!(&out[..], expected);
    }

    #[test]
    fn test_encode_publish_qos1_retain() {
        let mut out = BytesMut::new();
        encode_publish(
            &Publish {
                topic: "t",
                payload: b"{}",
                qos: QoS::AtLeastOnce,
                retain: true,
                packet_id: Some(7),
            },
            &mut out,
        )
        .unwrap();
        assert_eq!(
            &out[..],
            &[0x33, 7, 0x00, 0x01, b't', 0x00, 0x07, b'{', b'}']
        );
    }

    #[test]
    fn test_encode_publish_qos0_has_no_packet_id() {
        let mut out = BytesMut::new();
        encode_publish(
            &Publish {
                topic: "t",
                payload: b"x",
                qos: QoS::AtMostOnce,
                retain: false,
                packet_id: Some(9),
            },
            &mut out,
        )
        .unwrap();
        assert_eq!(&out[..], &[0x30, 4, 0x00, 0x01, b't', b'x']);
    }

    #[test]
    fn test_encode_publish_qos2_requires_packet_id() {
        let mut out = BytesMut::new();
        let result = encode_publish(
            &Publish {
                topic: "t",
                payload: b"x",
                qos: QoS::ExactlyOnce,
                retain: false,
                packet_id: None,
            },
            &mut out,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_control_packets() {
        let mut out = BytesMut::new();
        encode_pingreq(&mut out);
        encode_disconnect(&mut out);
        encode_pubrel(0x0102, &mut out);
        assert_eq!(&out[..], &[0xC0, 0x00, 0xE0, 0x00, 0x62, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn test_decode_connack_refused() {
        let mut buf = BytesMut::from(&[0x20, 0x02, 0x00, 0x05][..]);
        assert_eq!(
            decode(&mut buf).unwrap(),
            Some(Packet::ConnAck {
                session_present: false,
                code: ConnectReturnCode::NotAuthorized,
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut buf = BytesMut::from(&[0x40, 0x02, 0x00][..]);
        assert_eq!(decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);

        buf.extend_from_slice(&[0x2A, 0xD0, 0x00]);
        assert_eq!(decode(&mut buf).unwrap(), Some(Packet::PubAck(0x2A)));
        assert_eq!(decode(&mut buf).unwrap(), Some(Packet::PingResp));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_unsupported_packet_is_consumed() {
        // SUBACK with one return code, then PUBCOMP
        let mut buf = BytesMut::from(&[0x90, 0x03, 0x00, 0x01, 0x00, 0x70, 0x02, 0x00, 0x01][..]);
        assert!(matches!(
            decode(&mut buf),
            Err(ProtocolError::UnsupportedPacket(9))
        ));
        assert_eq!(decode(&mut buf).unwrap(), Some(Packet::PubComp(1)));
    }

    #[test]
    fn test_decode_bad_length() {
        let mut buf = BytesMut::from(&[0xD0, 0x01, 0x00][..]);
        assert!(matches!(
            decode(&mut buf),
            Err(ProtocolError::InvalidLength {
                expected: 0,
                actual: 1
            })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::from_u8(2).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::from_u8(3).is_err());
    }
}
