use log::warn;
use serde::Deserialize;
use serde_json::value::RawValue;

/// Content type required of bus deliveries; anything else is dropped.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// The JSON envelope transported over the bus.
///
/// `data` keeps the exact bytes the publisher sent — strings keep their
/// quotes, objects keep their braces — so the payload reaches subscribers
/// verbatim.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub data: Box<RawValue>,
}

impl Envelope {
    /// The payload to forward: the `data` field's original JSON text.
    pub fn payload(&self) -> &str {
        self.data.get()
    }
}

/// Decodes one bus delivery. Returns None, with a warning, for anything
/// that is not an `application/json` envelope; a bad delivery is never
/// fatal.
pub(crate) fn decode(content_type: Option<&str>, body: &[u8]) -> Option<Envelope> {
    match content_type {
        Some(JSON_CONTENT_TYPE) => match serde_json::from_slice(body) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                warn!("Can't decode JSON message: {err}");
                None
            }
        },
        other => {
            warn!("Message is not JSON: {}", other.unwrap_or("<missing>"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_keeps_string_payload_quotes() {
        let body = br#"{"channel":"/test/channel","data":"test message"}"#;
        let envelope = decode(Some(JSON_CONTENT_TYPE), body).expect("valid envelope");

        assert_eq!(envelope.channel, "/test/channel");
        assert_eq!(envelope.payload(), r#""test message""#);
    }

    #[test]
    fn test_decode_keeps_object_payload_bytes() {
        let body = br#"{"channel":"/t/3","data":{"k":1}}"#;
        let envelope = decode(Some(JSON_CONTENT_TYPE), body).unwrap();

        assert_eq!(envelope.payload(), r#"{"k":1}"#);
    }

    #[test]
    fn test_decode_keeps_number_payload() {
        let body = br#"{"channel":"/t/2","data":42}"#;
        let envelope = decode(Some(JSON_CONTENT_TYPE), body).unwrap();

        assert_eq!(envelope.payload(), "42");
    }

    #[test]
    fn test_decode_drops_wrong_content_type() {
        let body = br#"{"channel":"/t/1","data":"hello"}"#;

        assert!(decode(Some("text/plain"), body).is_none());
        assert!(decode(None, body).is_none());
    }

    #[test]
    fn test_decode_drops_malformed_envelopes() {
        assert!(decode(Some(JSON_CONTENT_TYPE), b"not json").is_none());
        assert!(decode(Some(JSON_CONTENT_TYPE), br#"{"data":"no channel"}"#).is_none());
        assert!(decode(Some(JSON_CONTENT_TYPE), br#"{"channel":"/t/1"}"#).is_none());
    }
}
