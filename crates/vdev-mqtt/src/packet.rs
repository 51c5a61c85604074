//! ---
//! vdev_section: "04-transport"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "MQTT 3.1.1 packet codec and client transport."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
//! MQTT 3.1.1 control packets used by a QoS 0 client.
//!
//! Fixed header: one type/flags byte followed by the remaining length as a
//! variable-length integer (7 bits per byte, at most four bytes).

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_LEVEL: u8 = 4;
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

const FLAG_CLEAN_SESSION: u8 = 0b0000_0010;
const FLAG_PASSWORD: u8 = 0b0100_0000;
const FLAG_USERNAME: u8 = 0b1000_0000;

/// Framing and field errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("remaining length is not a valid variable-length integer")]
    InvalidLength,
    #[error("packet body is truncated")]
    Truncated,
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("unsupported packet type {0}")]
    UnsupportedType(u8),
    #[error("field of {0} bytes exceeds the 65535-byte limit")]
    FieldTooLong(usize),
    #[error("packet of {0} bytes exceeds the maximum remaining length")]
    TooLarge(usize),
}

/// CONNECT payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// PUBLISH packet. `packet_id` is present only for QoS > 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    /// Fire-and-forget publish.
    pub fn at_most_once(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            qos: 0,
            retain: false,
            dup: false,
            packet_id: None,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, code: u8 },
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe { packet_id: u16, filters: Vec<(String, u8)> },
    SubAck { packet_id: u16, codes: Vec<u8> },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck { .. } => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::SubAck { .. } => "SUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }

    /// Append the wire form of the packet to `out`.
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), PacketError> {
        let mut body = BytesMut::new();
        let first = match self {
            Packet::Connect(connect) => {
                put_str(&mut body, PROTOCOL_NAME)?;
                body.put_u8(PROTOCOL_LEVEL);
                let mut flags = 0;
                if connect.clean_session {
                    flags |= FLAG_CLEAN_SESSION;
                }
                if connect.username.is_some() {
                    flags |= FLAG_USERNAME;
                }
                if connect.password.is_some() {
                    flags |= FLAG_PASSWORD;
                }
                body.put_u8(flags);
                body.put_u16(connect.keep_alive);
                put_str(&mut body, &connect.client_id)?;
                if let Some(username) = &connect.username {
                    put_str(&mut body, username)?;
                }
                if let Some(password) = &connect.password {
                    put_bytes(&mut body, password)?;
                }
                CONNECT << 4
            }
            Packet::ConnAck {
                session_present,
                code,
            } => {
                body.put_u8(u8::from(*session_present));
                body.put_u8(*code);
                CONNACK << 4
            }
            Packet::Publish(publish) => {
                put_str(&mut body, &publish.topic)?;
                if publish.qos > 0 {
                    body.put_u16(publish.packet_id.unwrap_or(1));
                }
                body.put_slice(&publish.payload);
                let mut flags = (publish.qos & 0b11) << 1;
                if publish.dup {
                    flags |= 0b1000;
                }
                if publish.retain {
                    flags |= 0b0001;
                }
                PUBLISH << 4 | flags
            }
            Packet::PubAck { packet_id } => {
                body.put_u16(*packet_id);
                PUBACK << 4
            }
            Packet::Subscribe { packet_id, filters } => {
                body.put_u16(*packet_id);
                for (filter, qos) in filters {
                    put_str(&mut body, filter)?;
                    body.put_u8(*qos);
                }
                SUBSCRIBE << 4 | 0b0010
            }
            Packet::SubAck { packet_id, codes } => {
                body.put_u16(*packet_id);
                body.put_slice(codes);
                SUBACK << 4
            }
            Packet::PingReq => PINGREQ << 4,
            Packet::PingResp => PINGRESP << 4,
            Packet::Disconnect => DISCONNECT << 4,
        };
        out.put_u8(first);
        put_remaining_length(out, body.len())?;
        out.put_slice(&body);
        Ok(())
    }

    /// Take one complete packet off the front of `buffer`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; `buffer` is then untouched.
    pub fn decode(buffer: &mut BytesMut) -> Result<Option<Packet>, PacketError> {
        let Some((remaining, header_len)) = read_remaining_length(buffer)? else {
            return Ok(None);
        };
        let total = header_len + remaining;
        if buffer.len() < total {
            return Ok(None);
        }
        let first = buffer[0];
        let mut frame = buffer.split_to(total).freeze();
        frame.advance(header_len);
        decode_body(first, frame).map(Some)
    }
}

fn decode_body(first: u8, mut body: Bytes) -> Result<Packet, PacketError> {
    let flags = first & 0x0F;
    match first >> 4 {
        CONNECT => {
            let name = get_str(&mut body)?;
            if name != PROTOCOL_NAME {
                return Err(PacketError::UnsupportedType(CONNECT));
            }
            let _level = get_u8(&mut body)?;
            let connect_flags = get_u8(&mut body)?;
            let keep_alive = get_u16(&mut body)?;
            let client_id = get_str(&mut body)?;
            let username = if connect_flags & FLAG_USERNAME != 0 {
                Some(get_str(&mut body)?)
            } else {
                None
            };
            let password = if connect_flags & FLAG_PASSWORD != 0 {
                Some(get_bytes(&mut body)?)
            } else {
                None
            };
            Ok(Packet::Connect(Connect {
                client_id,
                keep_alive,
                clean_session: connect_flags & FLAG_CLEAN_SESSION != 0,
                username,
                password,
            }))
        }
        CONNACK => {
            let ack_flags = get_u8(&mut body)?;
            let code = get_u8(&mut body)?;
            Ok(Packet::ConnAck {
                session_present: ack_flags & 0x01 != 0,
                code,
            })
        }
        PUBLISH => {
            let qos = (flags >> 1) & 0b11;
            let topic = get_str(&mut body)?;
            let packet_id = if qos > 0 {
                Some(get_u16(&mut body)?)
            } else {
                None
            };
            Ok(Packet::Publish(Publish {
                topic,
                qos,
                retain: flags & 0b0001 != 0,
                dup: flags & 0b1000 != 0,
                packet_id,
                payload: body,
            }))
        }
        PUBACK => Ok(Packet::PubAck {
            packet_id: get_u16(&mut body)?,
        }),
        SUBSCRIBE => {
            let packet_id = get_u16(&mut body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                let filter = get_str(&mut body)?;
                filters.push((filter, get_u8(&mut body)?));
            }
            Ok(Packet::Subscribe { packet_id, filters })
        }
        SUBACK => {
            let packet_id = get_u16(&mut body)?;
            Ok(Packet::SubAck {
                packet_id,
                codes: body.to_vec(),
            })
        }
        PINGREQ => Ok(Packet::PingReq),
        PINGRESP => Ok(Packet::PingResp),
        DISCONNECT => Ok(Packet::Disconnect),
        other => Err(PacketError::UnsupportedType(other)),
    }
}

/// Returns `(remaining_length, fixed_header_length)` or `None` if incomplete.
fn read_remaining_length(buffer: &[u8]) -> Result<Option<(usize, usize)>, PacketError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (index, byte) in buffer.iter().enumerate().skip(1) {
        if index > 4 {
            return Err(PacketError::InvalidLength);
        }
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }
    if buffer.len() > 4 {
        return Err(PacketError::InvalidLength);
    }
    Ok(None)
}

fn put_remaining_length(out: &mut BytesMut, mut value: usize) -> Result<(), PacketError> {
    if value > MAX_REMAINING_LENGTH {
        return Err(PacketError::TooLarge(value));
    }
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

fn put_bytes(out: &mut BytesMut, bytes: &[u8]) -> Result<(), PacketError> {
    let len = u16::try_from(bytes.len()).map_err(|_| PacketError::FieldTooLong(bytes.len()))?;
    out.put_u16(len);
    out.put_slice(bytes);
    Ok(())
}

fn put_str(out: &mut BytesMut, value: &str) -> Result<(), PacketError> {
    put_bytes(out, value.as_bytes())
}

fn get_u8(body: &mut Bytes) -> Result<u8, PacketError> {
    if body.remaining() < 1 {
        return Err(PacketError::Truncated);
    }
    Ok(body.get_u8())
}

fn get_u16(body: &mut Bytes) -> Result<u16, PacketError> {
    if body.remaining() < 2 {
        return Err(PacketError::Truncated);
    }
    Ok(body.get_u16())
}

fn get_bytes(body: &mut Bytes) -> Result<Vec<u8>, PacketError> {
    let len = usize::from(get_u16(body)?);
    if body.remaining() < len {
        return Err(PacketError::Truncated);
    }
    Ok(body.split_to(len).to_vec())
}

fn get_str(body: &mut Bytes) -> Result<String, PacketError> {
    String::from_utf8(get_bytes(body)?).map_err(|_| PacketError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(packet: &Packet) -> BytesMut {
        let mut out = BytesMut::new();
        packet.encode(&mut out).unwrap();
        out
    }

    #[test]
    fn connect_matches_reference_bytes() {
        let packet = Packet::Connect(Connect {
            client_id: "dev".into(),
            keep_alive: 60,
            clean_session: true,
            username: Some("u".into()),
            password: Some(b"p".to_vec()),
        });
        let bytes = wire(&packet);
        assert_eq!(
            &bytes[..],
            &[
                0x10, 21, 0, 4, b'M', b'Q', b'T', b'T', 4, 0b1100_0010, 0, 60, 0, 3, b'd', b'e',
                b'v', 0, 1, b'u', 0, 1, b'p'
            ]
        );
        let mut buffer = bytes;
        assert_eq!(Packet::decode(&mut buffer).unwrap(), Some(packet));
        assert!(buffer.is_empty());
    }

    #[test]
    fn publish_qos0_has_no_packet_id() {
        let packet = Packet::Publish(Publish::at_most_once("/d/d2p", Bytes::from_static(b"{}")));
        let bytes = wire(&packet);
        assert_eq!(&bytes[..], &[0x30, 10, 0, 6, b'/', b'd', b'/', b'd', b'2', b'p', b'{', b'}']);
    }

    #[test]
    fn inbound_qos1_publish_keeps_packet_id() {
        let mut buffer = BytesMut::from(&[0x32, 7, 0, 1, b't', 0, 9, b'h', b'i'][..]);
        match Packet::decode(&mut buffer).unwrap() {
            Some(Packet::Publish(publish)) => {
                assert_eq!(publish.qos, 1);
                assert_eq!(publish.packet_id, Some(9));
                assert_eq!(&publish.payload[..], b"hi");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn multi_byte_remaining_length() {
        let payload = vec![7u8; 200];
        let packet = Packet::Publish(Publish::at_most_once("t", payload));
        let bytes = wire(&packet);
        assert_eq!(bytes[1], 0x80 | (203 & 0x7F) as u8);
        assert_eq!(bytes[2], 1);
        let mut buffer = bytes;
        assert_eq!(Packet::decode(&mut buffer).unwrap(), Some(packet));
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let full = wire(&Packet::SubAck {
            packet_id: 3,
            codes: vec![0],
        });
        let mut buffer = BytesMut::from(&full[..1]);
        assert_eq!(Packet::decode(&mut buffer).unwrap(), None);
        buffer.extend_from_slice(&full[1..3]);
        assert_eq!(Packet::decode(&mut buffer).unwrap(), None);
        assert_eq!(buffer.len(), 3);
        buffer.extend_from_slice(&full[3..]);
        buffer.extend_from_slice(&wire(&Packet::PingResp));
        assert_eq!(
            Packet::decode(&mut buffer).unwrap(),
            Some(Packet::SubAck {
                packet_id: 3,
                codes: vec![0]
            })
        );
        assert_eq!(Packet::decode(&mut buffer).unwrap(), Some(Packet::PingResp));
        assert!(buffer.is_empty());
    }

    #[test]
    fn rejects_bad_frames() {
        let mut too_long = BytesMut::from(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
        assert_eq!(Packet::decode(&mut too_long), Err(PacketError::InvalidLength));

        let mut reserved = BytesMut::from(&[0xF0, 0][..]);
        assert_eq!(
            Packet::decode(&mut reserved),
            Err(PacketError::UnsupportedType(15))
        );

        let mut short_connack = BytesMut::from(&[0x20, 1, 0][..]);
        assert_eq!(Packet::decode(&mut short_connack), Err(PacketError::Truncated));
    }

    #[test]
    fn subscribe_sets_reserved_flag_bits() {
        let bytes = wire(&Packet::Subscribe {
            packet_id: 1,
            filters: vec![("/d/p2d".into(), 0)],
        });
        assert_eq!(bytes[0], 0x82);
    }
}
