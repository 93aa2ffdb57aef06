//! Envelope grammar layered on top of the frame codec.
//!
//! A frame payload is `msgType DELIM value` with the fixed delimiter
//! `#@%`. INNER values nest once more: `subtype DELIM value`.

use crate::core::constants::{
    DELIMITER, KEY_ACK, KEY_HEART, KEY_REGIST, KEY_UNREGISTERED, MSG_TYPE_BIZ,
    MSG_TYPE_BIZ_NEED_ACK, MSG_TYPE_INNER,
};
use crate::core::ProtocolError;

/// A decoded top-level envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Plain business payload, no delivery confirmation.
    Biz(String),
    /// Business payload that requires an ACK frame for `id`.
    BizNeedAck {
        /// Unique message id the receiver must acknowledge.
        id: String,
        /// Message body.
        body: String,
    },
    /// Control-plane message.
    Inner(InnerMsg),
}

/// Control-plane message kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InnerMsg {
    /// Bind a client name to the sending connection.
    Regist(String),
    /// Liveness probe; carries no value.
    Heart,
    /// Delivery acknowledgement for the given message id.
    Ack(String),
    /// Server notice that the receiving connection carries no
    /// registration; the client should re-send REGIST.
    Unregistered,
}

impl Envelope {
    /// The bare heartbeat envelope.
    pub fn heartbeat() -> Self {
        Envelope::Inner(InnerMsg::Heart)
    }

    /// A registration envelope for `name`.
    pub fn regist(name: &str) -> Self {
        Envelope::Inner(InnerMsg::Regist(name.to_owned()))
    }

    /// An acknowledgement envelope for message `id`.
    pub fn ack(id: &str) -> Self {
        Envelope::Inner(InnerMsg::Ack(id.to_owned()))
    }

    /// The unregistered-notice envelope.
    pub fn unregistered() -> Self {
        Envelope::Inner(InnerMsg::Unregistered)
    }

    /// A plain business envelope.
    pub fn biz(payload: &str) -> Self {
        Envelope::Biz(payload.to_owned())
    }

    /// An ack-requested business envelope.
    pub fn biz_need_ack(id: &str, body: &str) -> Self {
        Envelope::BizNeedAck {
            id: id.to_owned(),
            body: body.to_owned(),
        }
    }

    /// Encode into a frame payload.
    pub fn encode(&self) -> String {
        match self {
            Envelope::Biz(payload) => format!("{MSG_TYPE_BIZ}{DELIMITER}{payload}"),
            Envelope::BizNeedAck { id, body } => {
                format!("{MSG_TYPE_BIZ_NEED_ACK}{DELIMITER}{id}{DELIMITER}{body}")
            }
            Envelope::Inner(inner) => {
                let (key, value) = match inner {
                    InnerMsg::Regist(name) => (KEY_REGIST, name.as_str()),
                    InnerMsg::Heart => (KEY_HEART, ""),
                    InnerMsg::Ack(id) => (KEY_ACK, id.as_str()),
                    InnerMsg::Unregistered => (KEY_UNREGISTERED, ""),
                };
                format!("{MSG_TYPE_INNER}{DELIMITER}{key}{DELIMITER}{value}")
            }
        }
    }

    /// Parse a frame payload.
    ///
    /// Returns `Ok(None)` for a well-formed envelope whose type or
    /// subtype code is unknown (ignored, for forward compatibility) and
    /// an error when the grammar itself is violated, which tears the
    /// connection down as stream-corrupt.
    pub fn parse(raw: &str) -> Result<Option<Envelope>, ProtocolError> {
        let (msg_type, value) = raw
            .split_once(DELIMITER)
            .ok_or_else(|| ProtocolError::MalformedEnvelope(raw.to_owned()))?;

        match msg_type {
            t if t == MSG_TYPE_BIZ => Ok(Some(Envelope::Biz(value.to_owned()))),
            t if t == MSG_TYPE_BIZ_NEED_ACK => {
                let (id, body) = value
                    .split_once(DELIMITER)
                    .ok_or_else(|| ProtocolError::MalformedEnvelope(raw.to_owned()))?;
                Ok(Some(Envelope::BizNeedAck {
                    id: id.to_owned(),
                    body: body.to_owned(),
                }))
            }
            t if t == MSG_TYPE_INNER => {
                let (subtype, rest) = value
                    .split_once(DELIMITER)
                    .ok_or_else(|| ProtocolError::MalformedEnvelope(raw.to_owned()))?;
                let inner = match subtype {
                    s if s == KEY_REGIST => Some(InnerMsg::Regist(rest.to_owned())),
                    s if s == KEY_HEART => Some(InnerMsg::Heart),
                    s if s == KEY_ACK => Some(InnerMsg::Ack(rest.to_owned())),
                    s if s == KEY_UNREGISTERED => Some(InnerMsg::Unregistered),
                    _ => None,
                };
                Ok(inner.map(Envelope::Inner))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_wire_literals() {
        assert_eq!(Envelope::biz("hello").encode(), "1#@%hello");
        assert_eq!(Envelope::biz_need_ack("id1", "msg").encode(), "3#@%id1#@%msg");
        assert_eq!(Envelope::regist("till-7").encode(), "2#@%3#@%till-7");
        assert_eq!(Envelope::heartbeat().encode(), "2#@%4#@%");
        assert_eq!(Envelope::ack("id1").encode(), "2#@%5#@%id1");
        assert_eq!(Envelope::unregistered().encode(), "2#@%6#@%");
    }

    #[test]
    fn test_parse_roundtrip() {
        let envelopes = [
            Envelope::biz("payload"),
            Envelope::biz(""),
            Envelope::biz_need_ack("u-1", "body"),
            Envelope::regist("name"),
            Envelope::heartbeat(),
            Envelope::ack("u-1"),
            Envelope::unregistered(),
        ];
        for envelope in envelopes {
            let parsed = Envelope::parse(&envelope.encode()).unwrap();
            assert_eq!(parsed, Some(envelope));
        }
    }

    #[test]
    fn test_payload_may_contain_delimiter() {
        // Only the first occurrence splits; the rest is payload.
        let parsed = Envelope::parse("1#@%a#@%b").unwrap();
        assert_eq!(parsed, Some(Envelope::Biz("a#@%b".to_owned())));

        let parsed = Envelope::parse("3#@%id#@%x#@%y").unwrap();
        assert_eq!(parsed, Some(Envelope::biz_need_ack("id", "x#@%y")));
    }

    #[test]
    fn test_regist_code_collides_with_biz_need_ack_only_on_paper() {
        // Both use the literal "3", but one is a top-level type and the
        // other an INNER subtype; the encodings never coincide.
        let regist = Envelope::regist("x").encode();
        let need_ack = Envelope::biz_need_ack("x", "y").encode();
        assert!(regist.starts_with("2#@%3#@%"));
        assert!(need_ack.starts_with("3#@%"));
        assert_ne!(
            Envelope::parse(&regist).unwrap(),
            Envelope::parse(&need_ack).unwrap()
        );
    }

    #[test]
    fn test_unknown_codes_are_ignored() {
        assert_eq!(Envelope::parse("9#@%whatever").unwrap(), None);
        assert_eq!(Envelope::parse("2#@%9#@%whatever").unwrap(), None);
    }

    #[test]
    fn test_malformed_envelope_is_an_error() {
        assert!(Envelope::parse("no delimiter here").is_err());
        // BIZ_NEED_ACK and INNER both require a second field.
        assert!(Envelope::parse("3#@%only-an-id").is_err());
        assert!(Envelope::parse("2#@%4").is_err());
    }
}
