//! Control message codec
//!
//! Text frames on the socket are either a bare type (`TYPE`) or a type
//! followed by percent-encoded parameters (`TYPE:k1=v1&k2=v2`).

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::BTreeMap;

/// Characters left as-is when encoding a key or value
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Known message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `PULL` - client requests a stream
    Pull,
    /// `PUSH` - publisher announces a stream
    Push,
    /// `H` - heartbeat
    Heartbeat,
    /// `OK` - request acknowledged
    Ok,
    /// `E` - error, carries `code` and `message`
    Error,
    /// `F` - fragment metadata, carries `duration`
    Fragment,
    /// `CLOSE` - end of stream
    Close,
    /// Anything else
    Other,
}

impl MessageKind {
    pub fn from_type(msg_type: &str) -> Self {
        match msg_type {
            "PULL" => MessageKind::Pull,
            "PUSH" => MessageKind::Push,
            "H" => MessageKind::Heartbeat,
            "OK" => MessageKind::Ok,
            "E" => MessageKind::Error,
            "F" => MessageKind::Fragment,
            "CLOSE" => MessageKind::Close,
            _ => MessageKind::Other,
        }
    }
}

/// Control message exchanged with the CDN server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlMessage {
    /// Message type (uppercase)
    pub msg_type: String,
    /// Parameters, empty when the message carries none
    pub parameters: BTreeMap<String, String>,
}

impl ControlMessage {
    /// Create a message without parameters
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into().to_uppercase(),
            parameters: BTreeMap::new(),
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Get a parameter value
    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_type(&self.msg_type)
    }

    /// Serialize to the wire form
    pub fn serialize(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(k, COMPONENT),
                    utf8_percent_encode(v, COMPONENT)
                )
            })
            .collect();

        if params.is_empty() {
            self.msg_type.clone()
        } else {
            format!("{}:{}", self.msg_type, params.join("&"))
        }
    }

    /// Parse the wire form. Never fails: pairs that cannot be decoded are skipped.
    pub fn parse(raw: &str) -> Self {
        let (msg_type, params) = match raw.split_once(':') {
            Some((t, p)) => (t, Some(p)),
            None => (raw, None),
        };

        let mut parameters = BTreeMap::new();
        for pair in params.into_iter().flat_map(|p| p.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match (decode_component(key), decode_component(value)) {
                (Some(k), Some(v)) => {
                    parameters.insert(k, v);
                }
                _ => tracing::debug!(pair, "Skipping undecodable message parameter"),
            }
        }

        Self {
            msg_type: msg_type.to_uppercase(),
            parameters,
        }
    }
}

impl std::fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.serialize())
    }
}

/// Serialize a control message
pub fn serialize(msg: &ControlMessage) -> String {
    msg.serialize()
}

/// Parse a control message
pub fn parse(raw: &str) -> ControlMessage {
    ControlMessage::parse(raw)
}

/// Decode one percent-encoded component. `+` is read as a space, matching
/// the query escaping used by the server. Returns None on a malformed
/// escape or invalid UTF-8.
fn decode_component(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes
                .get(i + 1..i + 3)
                .is_some_and(|h| h.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return None;
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    let spaced = s.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_round_trip(msg: ControlMessage) {
        let raw = msg.serialize();
        let parsed = ControlMessage::parse(&raw);
        assert_eq!(parsed, msg, "round trip through {:?}", raw);
    }

    #[test]
    fn test_serialize_without_parameters() {
        assert_eq!(ControlMessage::new("H").serialize(), "H");
        assert_eq!(ControlMessage::new("close").serialize(), "CLOSE");
    }

    #[test]
    fn test_serialize_fragment() {
        let msg = ControlMessage::new("F").with_param("duration", "1.5");
        assert_eq!(msg.serialize(), "F:duration=1.5");
        assert_round_trip(msg);
    }

    #[test]
    fn test_empty_values_are_omitted() {
        let msg = ControlMessage::new("PULL")
            .with_param("stream", "abc")
            .with_param("auth", "");
        assert_eq!(msg.serialize(), "PULL:stream=abc");

        let only_empty = ControlMessage::new("PULL").with_param("auth", "");
        assert_eq!(only_empty.serialize(), "PULL");
    }

    #[test]
    fn test_round_trips() {
        assert_round_trip(ControlMessage::new("H"));
        assert_round_trip(ControlMessage::new("OK"));
        assert_round_trip(ControlMessage::new("CLOSE"));
        assert_round_trip(
            ControlMessage::new("E")
                .with_param("code", "ERROR_CODE")
                .with_param("message", "Example error message"),
        );
        assert_round_trip(
            ControlMessage::new("PULL")
                .with_param("stream", "stream_id")
                .with_param("auth", "example-auth-token")
                .with_param("only_source", "false")
                .with_param("max_initial_fragments", "10"),
        );
        assert_round_trip(
            ControlMessage::new("E").with_param("a&b=c", "x:y+z%/ünï"),
        );
    }

    #[test]
    fn test_parse_lowercase_type() {
        let msg = ControlMessage::parse("f:duration=2");
        assert_eq!(msg.msg_type, "F");
        assert_eq!(msg.kind(), MessageKind::Fragment);
        assert_eq!(msg.param("duration"), Some("2"));
    }

    #[test]
    fn test_parse_splits_on_first_colon_and_equals() {
        let msg = ControlMessage::parse("E:message=a:b=c&code=X");
        assert_eq!(msg.param("message"), Some("a:b=c"));
        assert_eq!(msg.param("code"), Some("X"));
    }

    #[test]
    fn test_parse_skips_bad_pairs() {
        let msg = ControlMessage::parse("E:code=%ZZ&message=ok&&broken=%E0%A4");
        assert_eq!(msg.param("code"), None);
        assert_eq!(msg.param("broken"), None);
        assert_eq!(msg.param("message"), Some("ok"));
    }

    #[test]
    fn test_parse_server_query_escaping() {
        let msg = ControlMessage::parse("E:code=AUTH_ERROR&message=Invalid+auth+token");
        assert_eq!(msg.kind(), MessageKind::Error);
        assert_eq!(msg.param("message"), Some("Invalid auth token"));
    }

    #[test]
    fn test_parse_without_parameters() {
        let msg = ControlMessage::parse("ok");
        assert_eq!(msg.kind(), MessageKind::Ok);
        assert!(msg.parameters.is_empty());

        let msg = ControlMessage::parse("");
        assert_eq!(msg.kind(), MessageKind::Other);
    }
}
