//! Static message catalog and the wrap/unwrap entry points.
//!
//! Every message the protocol can carry is declared once in [`CATALOG`]
//! with its decimal code, message kind, URI template and (where one
//! exists) the name of the message that answers it. The catalog is the
//! only place wire names live; everything above it speaks [`MessageName`].

use std::collections::HashMap;
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::packet::{Code, OptionName, Packet, PacketKind};

/// Closed enumeration of every message kind in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageName {
    Hello,
    KeyChange,
    UpdateBegin,
    UpdateReady,
    UpdateAbort,
    UpdateDone,
    Chunk,
    ChunkMissed,
    ChunkMissedAck,
    ChunkReceived,
    ChunkReceivedError,
    FunctionCall,
    FunctionReturn,
    FunctionError,
    VariableRequest,
    VariableValue,
    VariableError,
    PrivateEvent,
    PublicEvent,
    Subscribe,
    SubscribeAck,
    SubscribeFail,
    Describe,
    DescribeReturn,
    GetTime,
    GetTimeReturn,
    SignalStart,
    SignalStartReturn,
    Ping,
    PingAck,
    EventAck,
    EventSlowdown,
    Ignored,
}

impl std::fmt::Display for MessageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Transmission discipline for a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Confirmable; the peer must acknowledge.
    Con,
    /// Non-confirmable; fire-and-forget, never allocates a token.
    Non,
    /// Acknowledgment of a confirmable message.
    Ack,
    /// Reset.
    Rst,
}

impl MessageKind {
    /// The packet type used on the wire for this kind.
    pub fn packet_kind(self) -> PacketKind {
        match self {
            MessageKind::Con => PacketKind::Confirmable,
            MessageKind::Non => PacketKind::NonConfirmable,
            MessageKind::Ack => PacketKind::Acknowledgment,
            MessageKind::Rst => PacketKind::Reset,
        }
    }
}

/// One immutable catalog entry.
#[derive(Debug, Clone, Copy)]
pub struct MessageSpec {
    /// The message this entry describes.
    pub name: MessageName,
    /// Decimal wire code.
    pub code: Code,
    /// Transmission discipline.
    pub kind: MessageKind,
    /// URI template; `{param}` segments and `key={param}` query arguments
    /// are substituted at wrap time.
    pub uri: Option<&'static str>,
    /// The message that answers this one, where the exchange has one.
    pub response: Option<MessageName>,
}

impl MessageSpec {
    /// The name an acknowledgment correlated to this request dispatches
    /// under: the declared response, or the request name itself.
    pub fn reply_name(&self) -> MessageName {
        self.response.unwrap_or(self.name)
    }
}

/// The full message table. Single-character path segments are the wire
/// convention for message identifiers.
pub static CATALOG: &[MessageSpec] = &[
    MessageSpec { name: MessageName::Hello, code: Code::POST, kind: MessageKind::Con, uri: Some("h"), response: Some(MessageName::Hello) },
    MessageSpec { name: MessageName::KeyChange, code: Code::PUT, kind: MessageKind::Con, uri: Some("k"), response: None },
    MessageSpec { name: MessageName::UpdateBegin, code: Code::POST, kind: MessageKind::Con, uri: Some("u"), response: Some(MessageName::UpdateReady) },
    MessageSpec { name: MessageName::UpdateReady, code: Code::CHANGED, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::UpdateAbort, code: Code::BAD_REQUEST, kind: MessageKind::Non, uri: Some("u"), response: None },
    MessageSpec { name: MessageName::UpdateDone, code: Code::PUT, kind: MessageKind::Con, uri: Some("u"), response: None },
    MessageSpec { name: MessageName::Chunk, code: Code::POST, kind: MessageKind::Con, uri: Some("c?crc={crc}&idx={idx}"), response: Some(MessageName::ChunkReceived) },
    MessageSpec { name: MessageName::ChunkMissed, code: Code::GET, kind: MessageKind::Con, uri: Some("c"), response: Some(MessageName::ChunkMissedAck) },
    MessageSpec { name: MessageName::ChunkMissedAck, code: Code::CHANGED, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::ChunkReceived, code: Code::CHANGED, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::ChunkReceivedError, code: Code::BAD_REQUEST, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::FunctionCall, code: Code::POST, kind: MessageKind::Con, uri: Some("f/{name}"), response: Some(MessageName::FunctionReturn) },
    MessageSpec { name: MessageName::FunctionReturn, code: Code::CHANGED, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::FunctionError, code: Code::BAD_REQUEST, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::VariableRequest, code: Code::GET, kind: MessageKind::Con, uri: Some("v/{name}"), response: Some(MessageName::VariableValue) },
    MessageSpec { name: MessageName::VariableValue, code: Code::CONTENT, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::VariableError, code: Code::BAD_REQUEST, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::PrivateEvent, code: Code::POST, kind: MessageKind::Non, uri: Some("E/{name}"), response: None },
    MessageSpec { name: MessageName::PublicEvent, code: Code::POST, kind: MessageKind::Non, uri: Some("e/{name}"), response: None },
    MessageSpec { name: MessageName::Subscribe, code: Code::GET, kind: MessageKind::Con, uri: Some("e/{name}"), response: Some(MessageName::SubscribeAck) },
    MessageSpec { name: MessageName::SubscribeAck, code: Code::CHANGED, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::SubscribeFail, code: Code::BAD_REQUEST, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::Describe, code: Code::GET, kind: MessageKind::Con, uri: Some("d"), response: Some(MessageName::DescribeReturn) },
    MessageSpec { name: MessageName::DescribeReturn, code: Code::CONTENT, kind: MessageKind::Ack, uri: Some("d"), response: None },
    MessageSpec { name: MessageName::GetTime, code: Code::GET, kind: MessageKind::Con, uri: Some("t"), response: Some(MessageName::GetTimeReturn) },
    MessageSpec { name: MessageName::GetTimeReturn, code: Code::CONTENT, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::SignalStart, code: Code::PUT, kind: MessageKind::Con, uri: Some("s"), response: Some(MessageName::SignalStartReturn) },
    MessageSpec { name: MessageName::SignalStartReturn, code: Code::CHANGED, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::Ping, code: Code::EMPTY, kind: MessageKind::Con, uri: None, response: Some(MessageName::PingAck) },
    MessageSpec { name: MessageName::PingAck, code: Code::EMPTY, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::EventAck, code: Code::CHANGED, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::EventSlowdown, code: Code::NOT_ACCEPTABLE, kind: MessageKind::Ack, uri: None, response: None },
    MessageSpec { name: MessageName::Ignored, code: Code::EMPTY, kind: MessageKind::Rst, uri: None, response: None },
];

/// Looks up the catalog entry for a message.
pub fn spec(name: MessageName) -> &'static MessageSpec {
    CATALOG
        .iter()
        .find(|entry| entry.name == name)
        .expect("catalog covers every message name")
}

/// The route key of a code + first path segment pair.
fn route_key(code: Code, first_segment: &str) -> String {
    format!("{}{}", code, first_segment)
}

fn route_table() -> &'static HashMap<String, MessageName> {
    static TABLE: OnceLock<HashMap<String, MessageName>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        for entry in CATALOG {
            if let Some(uri) = entry.uri {
                let first = uri
                    .split('?')
                    .next()
                    .and_then(|path| path.split('/').next())
                    .unwrap_or("");
                table.insert(route_key(entry.code, first), entry.name);
            }
        }
        table
    })
}

/// Classifies an inbound request packet by its route key.
///
/// Reset packets classify as [`MessageName::Ignored`] regardless of
/// their route.
pub fn resolve_route(packet: &Packet) -> Option<MessageName> {
    if packet.is_reset() {
        return Some(MessageName::Ignored);
    }
    let first = packet.first_path_segment()?;
    route_table().get(&route_key(packet.code, &first)).copied()
}

/// Builds and serializes a packet for the named message.
///
/// `params` fills the `{param}` placeholders of the entry's URI template.
/// A missing parameter or an encoding failure logs and yields `None`;
/// wrap never panics and never propagates an error.
pub fn wrap(
    name: MessageName,
    message_id: u16,
    params: &[(&str, String)],
    extra_options: &[(OptionName, Vec<u8>)],
    payload: &[u8],
    token: Option<u8>,
) -> Option<Vec<u8>> {
    let entry = spec(name);

    let mut options: Vec<(OptionName, Vec<u8>)> = Vec::new();
    if let Some(uri) = entry.uri {
        if !render_uri(uri, params, &mut options) {
            warn!(message = %name, uri, "missing uri parameter, dropping message");
            return None;
        }
    }
    options.extend_from_slice(extra_options);

    let packet = Packet {
        kind: entry.kind.packet_kind(),
        code: entry.code,
        message_id,
        token,
        options,
        payload: payload.to_vec(),
    };

    match packet.encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(message = %name, error = %e, "failed to encode message");
            None
        }
    }
}

/// Parses inbound wire bytes defensively.
///
/// Malformed input logs at debug level and yields `None`; it never
/// propagates an error that could take down the connection task.
pub fn unwrap(bytes: &[u8]) -> Option<Packet> {
    match Packet::decode(bytes) {
        Ok(packet) => Some(packet),
        Err(e) => {
            debug!(error = %e, len = bytes.len(), "dropping malformed packet");
            None
        }
    }
}

/// Renders a URI template into Uri-Path and Uri-Query options.
fn render_uri(
    template: &str,
    params: &[(&str, String)],
    options: &mut Vec<(OptionName, Vec<u8>)>,
) -> bool {
    let lookup = |key: &str| -> Option<&str> {
        params
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.as_str())
    };

    let (path, query) = match template.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (template, None),
    };

    for segment in path.split('/') {
        if let Some(key) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            match lookup(key) {
                Some(value) => options.push((OptionName::UriPath, value.as_bytes().to_vec())),
                None => return false,
            }
        } else if !segment.is_empty() {
            options.push((OptionName::UriPath, segment.as_bytes().to_vec()));
        }
    }

    if let Some(query) = query {
        for arg in query.split('&') {
            let mut rendered = String::with_capacity(arg.len());
            let mut rest = arg;
            loop {
                match rest.split_once('{') {
                    Some((literal, after)) => {
                        rendered.push_str(literal);
                        let Some((key, tail)) = after.split_once('}') else {
                            return false;
                        };
                        match lookup(key) {
                            Some(value) => rendered.push_str(value),
                            None => return false,
                        }
                        rest = tail;
                    }
                    None => {
                        rendered.push_str(rest);
                        break;
                    }
                }
            }
            options.push((OptionName::UriQuery, rendered.into_bytes()));
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL_NAMES: &[MessageName] = &[
        MessageName::Hello,
        MessageName::KeyChange,
        MessageName::UpdateBegin,
        MessageName::UpdateReady,
        MessageName::UpdateAbort,
        MessageName::UpdateDone,
        MessageName::Chunk,
        MessageName::ChunkMissed,
        MessageName::ChunkMissedAck,
        MessageName::ChunkReceived,
        MessageName::ChunkReceivedError,
        MessageName::FunctionCall,
        MessageName::FunctionReturn,
        MessageName::FunctionError,
        MessageName::VariableRequest,
        MessageName::VariableValue,
        MessageName::VariableError,
        MessageName::PrivateEvent,
        MessageName::PublicEvent,
        MessageName::Subscribe,
        MessageName::SubscribeAck,
        MessageName::SubscribeFail,
        MessageName::Describe,
        MessageName::DescribeReturn,
        MessageName::GetTime,
        MessageName::GetTimeReturn,
        MessageName::SignalStart,
        MessageName::SignalStartReturn,
        MessageName::Ping,
        MessageName::PingAck,
        MessageName::EventAck,
        MessageName::EventSlowdown,
        MessageName::Ignored,
    ];

    /// Parameters that satisfy any template in the catalog.
    fn full_params() -> Vec<(&'static str, String)> {
        vec![
            ("name", "probe".to_string()),
            ("crc", "1a2b3c4d".to_string()),
            ("idx", "17".to_string()),
        ]
    }

    #[test]
    fn test_catalog_covers_every_name() {
        let in_table: HashSet<_> = CATALOG.iter().map(|e| e.name).collect();
        for name in ALL_NAMES {
            assert!(in_table.contains(name), "{} missing from catalog", name);
        }
        assert_eq!(CATALOG.len(), ALL_NAMES.len());
    }

    #[test]
    fn test_route_keys_are_unique() {
        let mut seen = HashSet::new();
        for entry in CATALOG {
            if let Some(uri) = entry.uri {
                let first = uri.split(['?', '/']).next().unwrap();
                let key = route_key(entry.code, first);
                assert!(seen.insert(key.clone()), "duplicate route key {}", key);
            }
        }
    }

    #[test]
    fn test_wrap_unwrap_roundtrip_every_entry() {
        let params = full_params();
        for entry in CATALOG {
            let token = match entry.kind {
                MessageKind::Non => None,
                _ => Some(7),
            };
            let payload = b"abc";
            let bytes = wrap(entry.name, 42, &params, &[], payload, token)
                .unwrap_or_else(|| panic!("wrap failed for {}", entry.name));
            let packet = unwrap(&bytes).unwrap_or_else(|| panic!("unwrap failed for {}", entry.name));

            assert_eq!(packet.code, entry.code, "code mismatch for {}", entry.name);
            assert_eq!(
                packet.kind,
                entry.kind.packet_kind(),
                "kind mismatch for {}",
                entry.name
            );
            assert_eq!(packet.message_id, 42);
            assert_eq!(packet.token, token);
            assert_eq!(packet.payload, payload);

            if let Some(uri) = entry.uri {
                let expected_first = uri.split(['?', '/']).next().unwrap();
                assert_eq!(
                    packet.first_path_segment().as_deref(),
                    Some(expected_first),
                    "path mismatch for {}",
                    entry.name
                );
            }
        }
    }

    #[test]
    fn test_route_resolution_for_inbound_requests() {
        let params = full_params();
        for entry in CATALOG {
            let Some(_) = entry.uri else { continue };
            let bytes = wrap(entry.name, 1, &params, &[], &[], None).unwrap();
            let packet = unwrap(&bytes).unwrap();
            assert_eq!(
                resolve_route(&packet),
                Some(entry.name),
                "route resolution failed for {}",
                entry.name
            );
        }
    }

    #[test]
    fn test_reset_resolves_as_ignored() {
        let bytes = wrap(MessageName::Ignored, 5, &[], &[], &[], None).unwrap();
        let packet = unwrap(&bytes).unwrap();
        assert!(packet.is_reset());
        assert_eq!(resolve_route(&packet), Some(MessageName::Ignored));
    }

    #[test]
    fn test_wrap_missing_param_returns_none() {
        let result = wrap(MessageName::FunctionCall, 1, &[], &[], &[], Some(1));
        assert!(result.is_none());
    }

    #[test]
    fn test_wrap_renders_query_args() {
        let params = full_params();
        let bytes = wrap(MessageName::Chunk, 3, &params, &[], b"data", Some(2)).unwrap();
        let packet = unwrap(&bytes).unwrap();
        assert_eq!(packet.query_arg("crc"), Some("1a2b3c4d".to_string()));
        assert_eq!(packet.query_arg("idx"), Some("17".to_string()));
    }

    #[test]
    fn test_wrap_function_call_path() {
        let params = vec![("name", "reboot".to_string())];
        let bytes = wrap(MessageName::FunctionCall, 9, &params, &[], &[], Some(3)).unwrap();
        let packet = unwrap(&bytes).unwrap();
        assert_eq!(packet.uri_path(), vec!["f".to_string(), "reboot".to_string()]);
    }

    #[test]
    fn test_wrap_extra_options_merged() {
        let extra = vec![(OptionName::MaxAge, vec![0x3C])];
        let bytes = wrap(MessageName::Describe, 2, &[], &extra, &[], Some(1)).unwrap();
        let packet = unwrap(&bytes).unwrap();
        assert!(packet
            .options
            .iter()
            .any(|(name, value)| *name == OptionName::MaxAge && value == &vec![0x3C]));
    }

    #[test]
    fn test_unwrap_malformed_returns_none() {
        assert!(unwrap(&[]).is_none());
        assert!(unwrap(&[0xFF, 0xFF]).is_none());
    }

    #[test]
    fn test_reply_name() {
        assert_eq!(spec(MessageName::UpdateBegin).reply_name(), MessageName::UpdateReady);
        assert_eq!(spec(MessageName::KeyChange).reply_name(), MessageName::KeyChange);
    }

    #[test]
    fn test_fire_and_forget_entries() {
        for name in [
            MessageName::PrivateEvent,
            MessageName::PublicEvent,
            MessageName::UpdateAbort,
        ] {
            assert_eq!(spec(name).kind, MessageKind::Non);
        }
    }
}
