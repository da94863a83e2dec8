//! Record keys and marker headers in the sessions topic.
//!
//! Other instances derive the same keys, so the separators must stay
//! byte-for-byte stable.

use std::fmt;

use bytes::Bytes;
use bytestring::ByteString;

use rmqtt_kafka_codec::kafka::{KafkaCondition, KafkaFilter, KafkaHeader};

pub const MIGRATE_SUFFIX: &str = "#migrate";
pub const WILL_SIGNAL_SUFFIX: &str = "#will-signal";
pub const EXPIRY_SIGNAL_SUFFIX: &str = "#expiry-signal";
pub const WILL_INFIX: &str = "#will-";

pub const HEADER_TYPE: &str = "type";
pub const HEADER_SENDER_ID: &str = "sender-id";
pub const TYPE_WILL_SIGNAL: &str = "will-signal";
pub const TYPE_EXPIRY_SIGNAL: &str = "expiry-signal";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(ByteString);

impl ClientId {
    #[inline]
    pub fn new(id: impl Into<ByteString>) -> Self {
        ClientId(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn as_bytestring(&self) -> &ByteString {
        &self.0
    }

    /// Key of the session state record
    #[inline]
    pub fn state_key(&self) -> Bytes {
        self.0.as_bytes().clone()
    }

    #[inline]
    pub fn migrate_key(&self) -> Bytes {
        self.suffixed(MIGRATE_SUFFIX)
    }

    #[inline]
    pub fn will_signal_key(&self) -> Bytes {
        self.suffixed(WILL_SIGNAL_SUFFIX)
    }

    #[inline]
    pub fn expiry_signal_key(&self) -> Bytes {
        self.suffixed(EXPIRY_SIGNAL_SUFFIX)
    }

    #[inline]
    pub fn will_key(&self, lifetime_id: &str) -> Bytes {
        Bytes::from(format!("{}{}{}", self.0, WILL_INFIX, lifetime_id))
    }

    #[inline]
    fn suffixed(&self, suffix: &str) -> Bytes {
        Bytes::from(format!("{}{}", self.0, suffix))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SignalKey {
    Will(ClientId),
    Expiry(ClientId),
}

/// Recover the client id from a signal record key.
pub(crate) fn parse_signal_key(key: &[u8]) -> Option<SignalKey> {
    let key = std::str::from_utf8(key).ok()?;
    if let Some(client_id) = key.strip_suffix(WILL_SIGNAL_SUFFIX) {
        Some(SignalKey::Will(ClientId::new(client_id)))
    } else {
        key.strip_suffix(EXPIRY_SIGNAL_SUFFIX).map(|client_id| SignalKey::Expiry(ClientId::new(client_id)))
    }
}

#[inline]
pub(crate) fn type_header(kind: &'static str) -> KafkaHeader {
    KafkaHeader::new(HEADER_TYPE, kind)
}

#[inline]
pub(crate) fn sender_header(session_id: &ByteString) -> KafkaHeader {
    KafkaHeader::new(HEADER_SENDER_ID, session_id.as_bytes().clone())
}

#[inline]
pub(crate) fn key_filter(key: Bytes) -> KafkaFilter {
    KafkaFilter::new(vec![KafkaCondition::Key(Some(key))])
}

/// Records on `key` not authored by `session_id`.
#[inline]
pub(crate) fn foreign_key_filter(key: Bytes, session_id: &ByteString) -> KafkaFilter {
    KafkaFilter::new(vec![
        KafkaCondition::Key(Some(key)),
        KafkaCondition::Not(Box::new(KafkaCondition::Header {
            name: Bytes::from_static(HEADER_SENDER_ID.as_bytes()),
            value: session_id.as_bytes().clone(),
        })),
    ])
}

#[inline]
pub(crate) fn type_filter(kind: &'static str) -> KafkaFilter {
    KafkaFilter::new(vec![KafkaCondition::Header {
        name: Bytes::from_static(HEADER_TYPE.as_bytes()),
        value: Bytes::from_static(kind.as_bytes()),
    }])
}
