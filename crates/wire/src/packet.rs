// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Packet framing over the item encoding. A packet is a top-level array of
//! 4 items (notification) or 6 items (request/reply):
//! `[requestId, type, command, payload, (timeout, timestamp)]`.

use crate::reader::{DecodeError, ItemReader};
use crate::value::{MAJOR_ARRAY, MAJOR_BYTES, put_head, put_int};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Bit-field constants for [`Packet::packet_type`]: one TYPE bit ored with a
/// SRC and a DEST bit.
pub mod packet_type {
    pub const REQUEST: i32 = 0x100;
    pub const REPLY: i32 = 0x200;
    pub const NOTIFICATION: i32 = 0x400;

    pub const SRC_CLIENT: i32 = 0x010;
    pub const SRC_SERVER: i32 = 0x020;
    pub const SRC_LOBBY: i32 = 0x040;

    pub const DEST_CLIENT: i32 = 0x001;
    pub const DEST_SERVER: i32 = 0x002;
    pub const DEST_LOBBY: i32 = 0x004;
}

/// The request id carried by session-establishment and server-initiated
/// notifications.
pub const NOTIFICATION_REQUEST_ID: i32 = -2;

#[derive(Debug, Clone)]
pub struct Packet {
    pub request_id: i32,
    pub packet_type: i32,
    pub command: Bytes,
    pub payload: Bytes,
    /// Seconds the sender will wait for a reply. Requests/replies only.
    pub timeout: i32,
    /// Sender clock at request time, milliseconds. Requests/replies only.
    pub timestamp: i64,
    /// 4 or 6, the on-wire array length this packet was read from.
    pub len: usize,
}

impl Packet {
    pub fn command_str(&self) -> &str {
        std::str::from_utf8(&self.command).unwrap_or("")
    }

    pub fn is_notification(&self) -> bool {
        self.packet_type & packet_type::NOTIFICATION != 0
    }

    pub fn is_reply(&self) -> bool {
        self.packet_type & packet_type::REPLY != 0
    }
}

/// Encode a 4-item notification packet.
pub fn encode_notification(packet_type: i32, command: &[u8], payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(command.len() + payload.len() + 16);
    put_head(&mut out, MAJOR_ARRAY, 4);
    put_int(&mut out, NOTIFICATION_REQUEST_ID as i64);
    put_int(&mut out, packet_type as i64);
    put_head(&mut out, MAJOR_BYTES, command.len() as u64);
    out.put_slice(command);
    put_head(&mut out, MAJOR_BYTES, payload.len() as u64);
    out.put_slice(payload);
    out.freeze()
}

/// Encode a 6-item request packet.
pub fn encode_request(
    request_id: i32,
    packet_type: i32,
    command: &[u8],
    payload: &[u8],
    timeout: i32,
    timestamp: i64,
) -> Bytes {
    let mut out = BytesMut::with_capacity(command.len() + payload.len() + 32);
    put_head(&mut out, MAJOR_ARRAY, 6);
    put_int(&mut out, request_id as i64);
    put_int(&mut out, packet_type as i64);
    put_head(&mut out, MAJOR_BYTES, command.len() as u64);
    out.put_slice(command);
    put_head(&mut out, MAJOR_BYTES, payload.len() as u64);
    out.put_slice(payload);
    put_int(&mut out, timeout as i64);
    put_int(&mut out, timestamp);
    out.freeze()
}

#[derive(Debug, Error)]
pub enum CodecError {
    /// The inbound byte stream can never parse into a legal packet. The
    /// session is terminated; subsequent bytes are not trusted.
    #[error("malformed frame")]
    MalformedFrame,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Streaming decoder for inbound packets. Tolerates many packets per read
/// and a packet split across reads; a prefix that cannot become a legal
/// packet surfaces [`CodecError::MalformedFrame`].
#[derive(Debug, Default)]
pub struct PacketCodec {}

impl PacketCodec {
    pub fn new() -> Self {
        Self {}
    }
}

fn parse_packet(rd: &mut ItemReader<'_>) -> Result<Packet, DecodeError> {
    let len = rd.read_array_header()?;
    if len != 4 && len != 6 {
        return Err(DecodeError::Malformed);
    }

    let request_id = int_field(rd)?;
    let packet_type = int_field(rd)?;
    let command = Bytes::copy_from_slice(rd.read_bytes()?);
    let payload = Bytes::copy_from_slice(rd.read_bytes()?);

    let (timeout, timestamp) = if len == 6 {
        (int_field(rd)?, rd.read_int()?)
    } else {
        (0, 0)
    };

    Ok(Packet {
        request_id,
        packet_type,
        command,
        payload,
        timeout,
        timestamp,
        len: len as usize,
    })
}

fn int_field(rd: &mut ItemReader<'_>) -> Result<i32, DecodeError> {
    let v = rd.read_int()?;
    i32::try_from(v).map_err(|_| DecodeError::Malformed)
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut rd = ItemReader::new(&src[..]);
        match parse_packet(&mut rd) {
            Ok(pkt) => {
                let consumed = rd.position();
                let _ = src.split_to(consumed);
                Ok(Some(pkt))
            }
            Err(DecodeError::Incomplete) => Ok(None),
            Err(DecodeError::Malformed) => Err(CodecError::MalformedFrame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use crate::{ItemReader, encode_array, v_bool, v_bytes, v_int, v_null, v_str};

    fn decode_all(codec: &mut PacketCodec, buf: &mut BytesMut) -> Vec<Packet> {
        let mut pkts = Vec::new();
        while let Some(p) = codec.decode(buf).unwrap() {
            pkts.push(p);
        }
        pkts
    }

    #[test]
    fn test_int_widths_round_trip() {
        for i in [
            0i64,
            1,
            23,
            24,
            255,
            256,
            65535,
            65536,
            0xFFFF_FFFF,
            0x1_0000_0000,
            i64::MAX,
            -1,
            -24,
            -25,
            -256,
            -257,
            -65537,
            i64::MIN + 1,
        ] {
            let enc = v_int(i).encode();
            let mut rd = ItemReader::new(&enc);
            assert_eq!(rd.read_int().unwrap(), i, "value {i}");
            assert!(rd.is_empty());
        }
    }

    #[test]
    fn test_minimum_width_heads() {
        assert_eq!(v_int(0).encode().as_ref(), &[0x00]);
        assert_eq!(v_int(23).encode().as_ref(), &[0x17]);
        assert_eq!(v_int(24).encode().as_ref(), &[0x18, 24]);
        assert_eq!(v_int(256).encode().as_ref(), &[0x19, 0x01, 0x00]);
        assert_eq!(v_int(-1).encode().as_ref(), &[0x20]);
        assert_eq!(v_int(-2).encode().as_ref(), &[0x21]);
    }

    #[test]
    fn test_value_round_trip() {
        let v = Value::Array(vec![
            v_int(-2),
            v_str("阴间大乱斗"),
            v_bytes(&b"\x01\x02\xFF"[..]),
            v_bool(true),
            v_null(),
            Value::Map(vec![(v_str("gameMode"), v_str("aaa"))]),
        ]);
        let enc = v.encode();
        let got = crate::load_value(&enc).unwrap();
        assert_eq!(got, v);
    }

    #[test]
    fn test_notification_decodes_as_4_array() {
        let buf = encode_notification(
            packet_type::NOTIFICATION | packet_type::SRC_SERVER | packet_type::DEST_CLIENT,
            b"Heartbeat",
            b"\xF6",
        );
        let mut codec = PacketCodec::new();
        let mut bytes = BytesMut::from(&buf[..]);
        let pkt = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(pkt.len, 4);
        assert_eq!(pkt.request_id, NOTIFICATION_REQUEST_ID);
        assert_eq!(pkt.command_str(), "Heartbeat");
        assert!(pkt.is_notification());
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_request_round_trip() {
        let payload = encode_array(&[v_str("jink"), v_int(1)]);
        let buf = encode_request(
            42,
            packet_type::REQUEST | packet_type::SRC_SERVER | packet_type::DEST_CLIENT,
            b"PlayCard",
            &payload,
            15,
            1_700_000_000_000,
        );
        let mut codec = PacketCodec::new();
        let mut bytes = BytesMut::from(&buf[..]);
        let pkt = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(pkt.len, 6);
        assert_eq!(pkt.request_id, 42);
        assert_eq!(pkt.timeout, 15);
        assert_eq!(pkt.timestamp, 1_700_000_000_000);
        assert_eq!(&pkt.payload[..], &payload[..]);
    }

    #[test]
    fn test_multiple_packets_per_segment() {
        let mut bytes = BytesMut::new();
        for i in 0..5 {
            bytes.extend_from_slice(&encode_notification(
                packet_type::NOTIFICATION | packet_type::SRC_CLIENT | packet_type::DEST_SERVER,
                b"Chat",
                &encode_array(&[v_int(i)]),
            ));
        }
        let mut codec = PacketCodec::new();
        let pkts = decode_all(&mut codec, &mut bytes);
        assert_eq!(pkts.len(), 5);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_packet_split_at_every_boundary() {
        let frame = encode_request(
            7,
            packet_type::REQUEST | packet_type::SRC_SERVER | packet_type::DEST_CLIENT,
            b"AskForCardChosen",
            &encode_array(&[v_str("slash"), v_bool(false)]),
            30,
            99,
        );

        for split in 1..frame.len() {
            let mut codec = PacketCodec::new();
            let mut bytes = BytesMut::from(&frame[..split]);
            assert!(
                codec.decode(&mut bytes).unwrap().is_none(),
                "split at {split} yielded a packet early"
            );
            bytes.extend_from_slice(&frame[split..]);
            let pkt = codec.decode(&mut bytes).unwrap().unwrap();
            assert_eq!(pkt.request_id, 7);
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn test_byte_by_byte_feed() {
        let frame = encode_notification(
            packet_type::NOTIFICATION | packet_type::SRC_CLIENT | packet_type::DEST_SERVER,
            b"Setup",
            &encode_array(&[v_bytes(&b"alice"[..])]),
        );
        let mut codec = PacketCodec::new();
        let mut bytes = BytesMut::new();
        let mut got = None;
        for (i, b) in frame.iter().enumerate() {
            bytes.put_u8(*b);
            if let Some(p) = codec.decode(&mut bytes).unwrap() {
                assert_eq!(i, frame.len() - 1, "packet completed early");
                got = Some(p);
            }
        }
        assert_eq!(got.unwrap().command_str(), "Setup");
    }

    #[test]
    fn test_malformed_leading_bytes() {
        // 0xFF = major 7 with indefinite-length info, never legal here.
        let mut codec = PacketCodec::new();
        let mut bytes = BytesMut::from(&b"\xFF\xFF\xFF"[..]);
        assert!(matches!(
            codec.decode(&mut bytes),
            Err(CodecError::MalformedFrame)
        ));
    }

    #[test]
    fn test_wrong_arity_array_is_malformed() {
        let buf = encode_array(&[v_int(1), v_int(2), v_int(3)]);
        let mut codec = PacketCodec::new();
        let mut bytes = BytesMut::from(&buf[..]);
        assert!(matches!(
            codec.decode(&mut bytes),
            Err(CodecError::MalformedFrame)
        ));
    }

    #[test]
    fn test_wrong_field_type_is_malformed() {
        // command slot holds an int instead of a byte string
        let buf = encode_array(&[v_int(-2), v_int(0x400), v_int(9), v_bytes(&b""[..])]);
        let mut codec = PacketCodec::new();
        let mut bytes = BytesMut::from(&buf[..]);
        assert!(matches!(
            codec.decode(&mut bytes),
            Err(CodecError::MalformedFrame)
        ));
    }

    #[test]
    fn test_good_packet_after_good_packet_survives() {
        // Decoding is sequential; a complete packet must not eat into the next.
        let a = encode_notification(packet_type::NOTIFICATION, b"A", b"\xF6");
        let b = encode_request(1, packet_type::REQUEST, b"B", b"\xF6", 5, 0);
        let mut bytes = BytesMut::new();
        bytes.extend_from_slice(&a);
        bytes.extend_from_slice(&b);
        let mut codec = PacketCodec::new();
        let pkts = decode_all(&mut codec, &mut bytes);
        assert_eq!(pkts.len(), 2);
        assert_eq!(pkts[0].command_str(), "A");
        assert_eq!(pkts[1].command_str(), "B");
    }

    #[test]
    fn test_reader_reads_mixed_payload() {
        let payload = encode_array(&[v_str("room"), v_int(8), v_int(15), v_bool(true)]);
        let mut rd = ItemReader::new(&payload);
        assert_eq!(rd.read_array_header().unwrap(), 4);
        assert_eq!(rd.read_str().unwrap(), "room");
        assert_eq!(rd.read_int().unwrap(), 8);
        assert_eq!(rd.read_int().unwrap(), 15);
        assert!(rd.read_bool().unwrap());
        assert!(rd.is_empty());
    }

    #[test]
    fn test_reader_remaining_is_opaque_tail() {
        // CreateRoom-style payloads: leading fields then an opaque settings blob.
        let settings = Value::Map(vec![(v_str("password"), v_str("hunter2"))]).encode();
        let mut payload = BytesMut::new();
        payload.put_u8(0x84); // array(4)
        v_str("n").encode_into(&mut payload);
        v_int(2).encode_into(&mut payload);
        v_int(15).encode_into(&mut payload);
        payload.extend_from_slice(&settings);

        let mut rd = ItemReader::new(&payload);
        rd.read_array_header().unwrap();
        rd.read_str().unwrap();
        rd.read_int().unwrap();
        rd.read_int().unwrap();
        assert_eq!(rd.remaining(), &settings[..]);
    }
}
