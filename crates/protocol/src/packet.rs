//! Binary packet codec for the CoAP-style device protocol.
//!
//! # Wire Format
//!
//! Each packet consists of:
//! - 1 byte: version (2 bits, always 1), type (2 bits), token length (4 bits)
//! - 1 byte: code (3-bit class, 5-bit detail, displayed as e.g. `2.05`)
//! - 2 bytes: message id (big-endian)
//! - N bytes: token (this protocol uses single-byte tokens)
//! - options in ascending option-number order with delta/length nibble
//!   encoding (13/14 extended forms supported)
//! - 0xFF payload marker followed by the payload, both omitted when the
//!   payload is empty

use crate::error::{ProtocolError, Result};

/// Protocol version carried in the packet header.
pub const PACKET_VERSION: u8 = 1;

/// Marker byte separating options from the payload.
const PAYLOAD_MARKER: u8 = 0xFF;

/// Message type from the header type nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Requires acknowledgment from the peer.
    Confirmable,
    /// Fire-and-forget.
    NonConfirmable,
    /// Acknowledges a confirmable message.
    Acknowledgment,
    /// Rejects a message.
    Reset,
}

impl PacketKind {
    fn to_bits(self) -> u8 {
        match self {
            PacketKind::Confirmable => 0,
            PacketKind::NonConfirmable => 1,
            PacketKind::Acknowledgment => 2,
            PacketKind::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => PacketKind::Confirmable,
            1 => PacketKind::NonConfirmable,
            2 => PacketKind::Acknowledgment,
            _ => PacketKind::Reset,
        }
    }
}

/// A CoAP-style decimal code: class.detail, e.g. `0.02` (POST) or `2.05`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code {
    /// The class digit (upper 3 bits on the wire).
    pub class: u8,
    /// The detail value (lower 5 bits on the wire).
    pub detail: u8,
}

impl Code {
    pub const EMPTY: Code = Code::new(0, 0);
    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const PUT: Code = Code::new(0, 3);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);
    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const NOT_ACCEPTABLE: Code = Code::new(4, 6);
    pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);

    /// Creates a code from class and detail digits.
    pub const fn new(class: u8, detail: u8) -> Self {
        Self { class, detail }
    }

    /// Packs the code into its wire byte.
    pub fn to_byte(self) -> u8 {
        (self.class << 5) | (self.detail & 0x1F)
    }

    /// Unpacks a wire byte.
    pub fn from_byte(byte: u8) -> Self {
        Self {
            class: byte >> 5,
            detail: byte & 0x1F,
        }
    }

    /// True for the 0.xx request classes (and the empty code).
    pub fn is_request(self) -> bool {
        self.class == 0
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class, self.detail)
    }
}

/// Option names used by the protocol, with their CoAP option numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionName {
    UriPath,
    ContentFormat,
    MaxAge,
    UriQuery,
    /// Any option number this catalog does not name. Preserved verbatim so
    /// defensive decoding never drops data.
    Other(u16),
}

impl OptionName {
    /// The CoAP option number.
    pub fn number(self) -> u16 {
        match self {
            OptionName::UriPath => 11,
            OptionName::ContentFormat => 12,
            OptionName::MaxAge => 14,
            OptionName::UriQuery => 15,
            OptionName::Other(n) => n,
        }
    }

    fn from_number(number: u16) -> Self {
        match number {
            11 => OptionName::UriPath,
            12 => OptionName::ContentFormat,
            14 => OptionName::MaxAge,
            15 => OptionName::UriQuery,
            n => OptionName::Other(n),
        }
    }
}

/// A decoded protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Message type.
    pub kind: PacketKind,
    /// Decimal code.
    pub code: Code,
    /// Sequence number; 16-bit, wraps.
    pub message_id: u16,
    /// Correlation token. This protocol always uses single-byte tokens.
    pub token: Option<u8>,
    /// Options in wire order.
    pub options: Vec<(OptionName, Vec<u8>)>,
    /// Application payload.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Creates an empty confirmable packet (a ping).
    pub fn ping(message_id: u16) -> Self {
        Self {
            kind: PacketKind::Confirmable,
            code: Code::EMPTY,
            message_id,
            token: None,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// True when the packet acknowledges a confirmable message.
    pub fn is_ack(&self) -> bool {
        self.kind == PacketKind::Acknowledgment
    }

    /// True when the packet demands an acknowledgment.
    pub fn is_confirmable(&self) -> bool {
        self.kind == PacketKind::Confirmable
    }

    /// True when the packet resets the exchange.
    pub fn is_reset(&self) -> bool {
        self.kind == PacketKind::Reset
    }

    /// True for an empty confirmable keepalive probe.
    pub fn is_empty_ping(&self) -> bool {
        self.is_confirmable() && self.code == Code::EMPTY && self.payload.is_empty()
    }

    /// All Uri-Path segments, decoded as UTF-8 (lossy).
    pub fn uri_path(&self) -> Vec<String> {
        self.options
            .iter()
            .filter(|(name, _)| *name == OptionName::UriPath)
            .map(|(_, value)| String::from_utf8_lossy(value).into_owned())
            .collect()
    }

    /// The first Uri-Path segment, if any.
    pub fn first_path_segment(&self) -> Option<String> {
        self.uri_path().into_iter().next()
    }

    /// All Uri-Query arguments, decoded as UTF-8 (lossy).
    pub fn uri_query(&self) -> Vec<String> {
        self.options
            .iter()
            .filter(|(name, _)| *name == OptionName::UriQuery)
            .map(|(_, value)| String::from_utf8_lossy(value).into_owned())
            .collect()
    }

    /// Looks up a `key=value` query argument.
    pub fn query_arg(&self, key: &str) -> Option<String> {
        self.uri_query().into_iter().find_map(|arg| {
            arg.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
                .map(str::to_owned)
        })
    }

    /// Serializes the packet to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let token_len = u8::from(self.token.is_some());
        let mut out = Vec::with_capacity(8 + self.payload.len());

        out.push((PACKET_VERSION << 6) | (self.kind.to_bits() << 4) | token_len);
        out.push(self.code.to_byte());
        out.extend_from_slice(&self.message_id.to_be_bytes());
        if let Some(token) = self.token {
            out.push(token);
        }

        // Options are delta-encoded in ascending number order. Stable sort
        // keeps repeated Uri-Path segments in insertion order.
        let mut options = self.options.clone();
        options.sort_by_key(|(name, _)| name.number());

        let mut previous = 0u16;
        for (name, value) in &options {
            let number = name.number();
            if number < previous {
                return Err(ProtocolError::MalformedPacket(format!(
                    "option number {} out of order",
                    number
                )));
            }
            let delta = number - previous;
            previous = number;
            encode_option_header(&mut out, delta, value.len())?;
            out.extend_from_slice(value);
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }

        Ok(out)
    }

    /// Parses wire bytes into a packet.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(ProtocolError::MalformedPacket(format!(
                "packet header needs 4 bytes, got {}",
                data.len()
            )));
        }

        let version = data[0] >> 6;
        if version != PACKET_VERSION {
            return Err(ProtocolError::MalformedPacket(format!(
                "unsupported version {}",
                version
            )));
        }
        let kind = PacketKind::from_bits(data[0] >> 4);
        let token_len = (data[0] & 0x0F) as usize;
        if token_len > 1 {
            // The protocol only ever issues single-byte tokens.
            return Err(ProtocolError::MalformedPacket(format!(
                "token length {} unsupported",
                token_len
            )));
        }
        let code = Code::from_byte(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);

        let mut cursor = 4;
        let token = if token_len == 1 {
            let byte = *data.get(cursor).ok_or_else(|| {
                ProtocolError::MalformedPacket("truncated token".to_string())
            })?;
            cursor += 1;
            Some(byte)
        } else {
            None
        };

        let mut options = Vec::new();
        let mut number = 0u16;
        while cursor < data.len() {
            if data[cursor] == PAYLOAD_MARKER {
                cursor += 1;
                break;
            }
            let (delta, length, consumed) = decode_option_header(&data[cursor..])?;
            cursor += consumed;
            number = number.checked_add(delta).ok_or_else(|| {
                ProtocolError::MalformedPacket("option number overflow".to_string())
            })?;
            let end = cursor.checked_add(length).filter(|&e| e <= data.len()).ok_or_else(
                || ProtocolError::MalformedPacket("truncated option value".to_string()),
            )?;
            options.push((OptionName::from_number(number), data[cursor..end].to_vec()));
            cursor = end;
        }

        let payload = data[cursor..].to_vec();

        Ok(Self {
            kind,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

fn encode_option_header(out: &mut Vec<u8>, delta: u16, length: usize) -> Result<()> {
    let length = u16::try_from(length).map_err(|_| ProtocolError::MalformedPacket(
        "option value too long".to_string(),
    ))?;

    let (delta_nibble, delta_ext) = nibble_parts(delta)?;
    let (len_nibble, len_ext) = nibble_parts(length)?;

    out.push((delta_nibble << 4) | len_nibble);
    out.extend_from_slice(&delta_ext);
    out.extend_from_slice(&len_ext);
    Ok(())
}

/// Splits a value into its header nibble and extended bytes (13/14 forms).
fn nibble_parts(value: u16) -> Result<(u8, Vec<u8>)> {
    match value {
        0..=12 => Ok((value as u8, Vec::new())),
        13..=268 => Ok((13, vec![(value - 13) as u8])),
        _ => Ok((14, (value - 269).to_be_bytes().to_vec())),
    }
}

fn decode_option_header(data: &[u8]) -> Result<(u16, usize, usize)> {
    let first = data[0];
    let mut consumed = 1;

    let mut read_extended = |nibble: u8| -> Result<u16> {
        match nibble {
            0..=12 => Ok(u16::from(nibble)),
            13 => {
                let byte = *data.get(consumed).ok_or_else(|| {
                    ProtocolError::MalformedPacket("truncated option header".to_string())
                })?;
                consumed += 1;
                Ok(u16::from(byte) + 13)
            }
            14 => {
                let hi = *data.get(consumed).ok_or_else(|| {
                    ProtocolError::MalformedPacket("truncated option header".to_string())
                })?;
                let lo = *data.get(consumed + 1).ok_or_else(|| {
                    ProtocolError::MalformedPacket("truncated option header".to_string())
                })?;
                consumed += 2;
                let value = u16::from_be_bytes([hi, lo]);
                value.checked_add(269).ok_or_else(|| {
                    ProtocolError::MalformedPacket("option header overflow".to_string())
                })
            }
            _ => Err(ProtocolError::MalformedPacket(
                "reserved option nibble 15".to_string(),
            )),
        }
    };

    let delta = read_extended(first >> 4)?;
    let length = read_extended(first & 0x0F)?;
    Ok((delta, length as usize, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet {
            kind: PacketKind::Confirmable,
            code: Code::POST,
            message_id: 0x1234,
            token: Some(0x42),
            options: vec![
                (OptionName::UriPath, b"f".to_vec()),
                (OptionName::UriPath, b"reboot".to_vec()),
                (OptionName::UriQuery, b"crc=1a2b3c4d".to_vec()),
            ],
            payload: b"payload bytes".to_vec(),
        }
    }

    #[test]
    fn test_code_display() {
        assert_eq!(Code::CONTENT.to_string(), "2.05");
        assert_eq!(Code::POST.to_string(), "0.02");
        assert_eq!(Code::NOT_ACCEPTABLE.to_string(), "4.06");
    }

    #[test]
    fn test_code_byte_roundtrip() {
        for code in [
            Code::EMPTY,
            Code::GET,
            Code::POST,
            Code::PUT,
            Code::CHANGED,
            Code::CONTENT,
            Code::BAD_REQUEST,
            Code::SERVICE_UNAVAILABLE,
        ] {
            assert_eq!(Code::from_byte(code.to_byte()), code);
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let packet = sample_packet();
        let encoded = packet.encode().unwrap();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_roundtrip_no_token_no_payload() {
        let packet = Packet {
            kind: PacketKind::NonConfirmable,
            code: Code::POST,
            message_id: 7,
            token: None,
            options: vec![(OptionName::UriPath, b"e".to_vec())],
            payload: Vec::new(),
        };
        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_ping_shape() {
        let ping = Packet::ping(99);
        assert!(ping.is_empty_ping());
        assert!(ping.is_confirmable());
        let encoded = ping.encode().unwrap();
        // Header only: no token, no options, no payload marker.
        assert_eq!(encoded.len(), 4);
        let decoded = Packet::decode(&encoded).unwrap();
        assert!(decoded.is_empty_ping());
        assert_eq!(decoded.message_id, 99);
    }

    #[test]
    fn test_ack_flags() {
        let ack = Packet {
            kind: PacketKind::Acknowledgment,
            code: Code::CHANGED,
            message_id: 1,
            token: Some(9),
            options: Vec::new(),
            payload: Vec::new(),
        };
        assert!(ack.is_ack());
        assert!(!ack.is_confirmable());
        assert!(!ack.is_reset());
        let decoded = Packet::decode(&ack.encode().unwrap()).unwrap();
        assert!(decoded.is_ack());
    }

    #[test]
    fn test_uri_path_helpers() {
        let packet = sample_packet();
        assert_eq!(packet.uri_path(), vec!["f".to_string(), "reboot".to_string()]);
        assert_eq!(packet.first_path_segment(), Some("f".to_string()));
        assert_eq!(packet.query_arg("crc"), Some("1a2b3c4d".to_string()));
        assert_eq!(packet.query_arg("idx"), None);
    }

    #[test]
    fn test_long_option_value() {
        // A 300-byte option exercises the 14-form extended length.
        let packet = Packet {
            kind: PacketKind::Confirmable,
            code: Code::POST,
            message_id: 2,
            token: Some(1),
            options: vec![(OptionName::UriQuery, vec![b'x'; 300])],
            payload: Vec::new(),
        };
        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded.options[0].1.len(), 300);
    }

    #[test]
    fn test_unknown_option_preserved() {
        let packet = Packet {
            kind: PacketKind::Confirmable,
            code: Code::GET,
            message_id: 3,
            token: None,
            options: vec![(OptionName::Other(2053), vec![1, 2, 3, 4])],
            payload: Vec::new(),
        };
        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded.options, vec![(OptionName::Other(2053), vec![1, 2, 3, 4])]);
    }

    #[test]
    fn test_decode_truncated_header() {
        let result = Packet::decode(&[0x40, 0x02]);
        assert!(matches!(result, Err(ProtocolError::MalformedPacket(_))));
    }

    #[test]
    fn test_decode_wrong_version() {
        let mut bytes = sample_packet().encode().unwrap();
        bytes[0] = (bytes[0] & 0x3F) | (2 << 6);
        let result = Packet::decode(&bytes);
        assert!(matches!(result, Err(ProtocolError::MalformedPacket(_))));
    }

    #[test]
    fn test_decode_truncated_option() {
        // Header + option header claiming 12 bytes with only 2 present.
        let mut bytes = vec![(1 << 6) | 0, Code::GET.to_byte(), 0, 1];
        bytes.push((11 << 4) | 12);
        bytes.extend_from_slice(&[1, 2]);
        let result = Packet::decode(&bytes);
        assert!(matches!(result, Err(ProtocolError::MalformedPacket(_))));
    }

    #[test]
    fn test_decode_multibyte_token_rejected() {
        // TKL of 4 is never produced by this protocol.
        let bytes = vec![(1 << 6) | 4, Code::GET.to_byte(), 0, 1, 1, 2, 3, 4];
        let result = Packet::decode(&bytes);
        assert!(matches!(result, Err(ProtocolError::MalformedPacket(_))));
    }

    #[test]
    fn test_message_id_boundaries() {
        for id in [0u16, 1, 0x7FFF, 0xFFFF] {
            let packet = Packet::ping(id);
            let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
            assert_eq!(decoded.message_id, id);
        }
    }
}
