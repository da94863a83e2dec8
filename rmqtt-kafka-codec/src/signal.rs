//! Records written to the sessions topic to coordinate owners of a client.
//!
//! Each record starts with a version byte; strings are `u16` length
//! prefixed, nullable fields use an `i16` length of `-1` and integers are
//! big-endian.

use bytes::{Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};
use crate::mqtt::{PayloadFormat, PublishFlags, QoS, UserProperty};
use crate::utils::{decode_blob, encode_blob, Decode, Encode};

/// Deadline that the receiving instance computes from `delay`
pub const UNKNOWN: i64 = -1;

const VERSION: u8 = 1;

fn check_version(src: &mut Bytes) -> Result<(), DecodeError> {
    match u8::decode(src)? {
        VERSION => Ok(()),
        v => Err(DecodeError::UnsupportedVersion(v)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillSignal {
    pub client_id: ByteString,
    /// milliseconds
    pub delay: i32,
    pub deliver_at: i64,
    pub lifetime_id: ByteString,
    pub will_id: ByteString,
    pub instance_id: ByteString,
}

impl Encode for WillSignal {
    fn encoded_size(&self) -> usize {
        1 + self.client_id.encoded_size()
            + 4
            + 8
            + self.lifetime_id.encoded_size()
            + self.will_id.encoded_size()
            + self.instance_id.encoded_size()
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        VERSION.encode(buf)?;
        self.client_id.encode(buf)?;
        self.delay.encode(buf)?;
        self.deliver_at.encode(buf)?;
        self.lifetime_id.encode(buf)?;
        self.will_id.encode(buf)?;
        self.instance_id.encode(buf)
    }
}

impl Decode for WillSignal {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        check_version(src)?;
        Ok(Self {
            client_id: ByteString::decode(src)?,
            delay: i32::decode(src)?,
            deliver_at: i64::decode(src)?,
            lifetime_id: ByteString::decode(src)?,
            will_id: ByteString::decode(src)?,
            instance_id: ByteString::decode(src)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirySignal {
    pub client_id: ByteString,
    /// milliseconds
    pub delay: i32,
    pub expire_at: i64,
    pub instance_id: ByteString,
}

impl Encode for ExpirySignal {
    fn encoded_size(&self) -> usize {
        1 + self.client_id.encoded_size() + 4 + 8 + self.instance_id.encoded_size()
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        VERSION.encode(buf)?;
        self.client_id.encode(buf)?;
        self.delay.encode(buf)?;
        self.expire_at.encode(buf)?;
        self.instance_id.encode(buf)
    }
}

impl Decode for ExpirySignal {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        check_version(src)?;
        Ok(Self {
            client_id: ByteString::decode(src)?,
            delay: i32::decode(src)?,
            expire_at: i64::decode(src)?,
            instance_id: ByteString::decode(src)?,
        })
    }
}

/// Announces that `session_id` is taking `client_id` over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateSignal {
    pub client_id: ByteString,
    pub session_id: ByteString,
}

impl Encode for MigrateSignal {
    fn encoded_size(&self) -> usize {
        1 + self.client_id.encoded_size() + self.session_id.encoded_size()
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        VERSION.encode(buf)?;
        self.client_id.encode(buf)?;
        self.session_id.encode(buf)
    }
}

impl Decode for MigrateSignal {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        check_version(src)?;
        Ok(Self { client_id: ByteString::decode(src)?, session_id: ByteString::decode(src)? })
    }
}

/// Will message as registered by the client, plus the ids the proxy assigns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: ByteString,
    /// seconds
    pub delay: i32,
    pub qos: QoS,
    pub flags: PublishFlags,
    pub expiry_interval: i32,
    pub content_type: Option<ByteString>,
    pub format: PayloadFormat,
    pub response_topic: Option<ByteString>,
    pub lifetime_id: Option<ByteString>,
    pub will_id: Option<ByteString>,
    pub correlation: Option<Bytes>,
    pub properties: Vec<UserProperty>,
    pub payload: Bytes,
}

impl Encode for WillMessage {
    fn encoded_size(&self) -> usize {
        1 + self.topic.encoded_size()
            + 4
            + 1
            + 1
            + 4
            + self.content_type.encoded_size()
            + 1
            + self.response_topic.encoded_size()
            + self.lifetime_id.encoded_size()
            + self.will_id.encoded_size()
            + self.correlation.encoded_size()
            + 2
            + self.properties.iter().map(|p| p.key.encoded_size() + p.value.encoded_size()).sum::<usize>()
            + 4
            + self.payload.len()
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        VERSION.encode(buf)?;
        self.topic.encode(buf)?;
        self.delay.encode(buf)?;
        u8::from(self.qos).encode(buf)?;
        self.flags.bits().encode(buf)?;
        self.expiry_interval.encode(buf)?;
        self.content_type.encode(buf)?;
        u8::from(self.format).encode(buf)?;
        self.response_topic.encode(buf)?;
        self.lifetime_id.encode(buf)?;
        self.will_id.encode(buf)?;
        self.correlation.encode(buf)?;
        let count = u16::try_from(self.properties.len()).map_err(|_| EncodeError::FieldTooLarge("properties"))?;
        count.encode(buf)?;
        for p in &self.properties {
            p.key.encode(buf)?;
            p.value.encode(buf)?;
        }
        encode_blob(&self.payload, buf)
    }
}

impl Decode for WillMessage {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        check_version(src)?;
        let topic = ByteString::decode(src)?;
        let delay = i32::decode(src)?;
        let qos = QoS::try_from(u8::decode(src)?)?;
        let flags = PublishFlags::from_bits_truncate(u8::decode(src)?);
        let expiry_interval = i32::decode(src)?;
        let content_type = Option::<ByteString>::decode(src)?;
        let format = PayloadFormat::try_from(u8::decode(src)?)?;
        let response_topic = Option::<ByteString>::decode(src)?;
        let lifetime_id = Option::<ByteString>::decode(src)?;
        let will_id = Option::<ByteString>::decode(src)?;
        let correlation = Option::<Bytes>::decode(src)?;
        let count = u16::decode(src)?;
        let mut properties = Vec::with_capacity(count as usize);
        for _ in 0..count {
            properties.push(UserProperty { key: ByteString::decode(src)?, value: ByteString::decode(src)? });
        }
        let payload = decode_blob(src)?;
        Ok(Self {
            topic,
            delay,
            qos,
            flags,
            expiry_interval,
            content_type,
            format,
            response_topic,
            lifetime_id,
            will_id,
            correlation,
            properties,
            payload,
        })
    }
}
