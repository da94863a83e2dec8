//! MQTT-facing stream extensions.

use bitflags::bitflags;
use bytes::Bytes;
use bytestring::ByteString;

/// Reason code sent when another connection takes the session over
pub const REASON_SESSION_TAKEN_OVER: u8 = 0x8E;

/// Session expiry or message expiry of "never"
pub const NO_EXPIRY: i32 = -1;

byte_enum! {
    #[derive(Default)]
    pub enum QoS {
        #[default]
        AtMostOnce = 0,
        AtLeastOnce = 1,
        ExactlyOnce = 2
    }
}

byte_enum! {
    #[derive(Default)]
    pub enum PayloadFormat {
        #[default]
        Binary = 0,
        Text = 1
    }
}

byte_enum! {
    pub enum SessionDataKind {
        State = 0,
        Will = 1
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PublishFlags: u8 {
        const RETAIN = 0b0000_0001;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubscribeOptions: u8 {
        const NO_LOCAL = 0b0000_0001;
        const RETAIN_AS_PUBLISHED = 0b0000_0010;
        const SEND_RETAINED = 0b0000_0100;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionFlags: u8 {
        const CLEAN_START = 0b0000_0010;
        const WILL = 0b0000_0100;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u8 {
        const RETAIN = 0b0000_0001;
        const WILDCARD = 0b0000_0010;
        const SUBSCRIPTION_IDS = 0b0000_0100;
        const SHARED_SUBSCRIPTIONS = 0b0000_1000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProperty {
    pub key: ByteString,
    pub value: ByteString,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub subscription_id: u32,
    pub qos: QoS,
    pub options: SubscribeOptions,
    pub pattern: ByteString,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishBeginEx {
    pub client_id: ByteString,
    pub topic: ByteString,
    pub flags: PublishFlags,
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeBeginEx {
    pub client_id: ByteString,
    pub qos: QoS,
    pub filters: Vec<TopicFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBeginEx {
    pub flags: SessionFlags,
    /// Session expiry interval in seconds
    pub expiry: i32,
    pub client_id: ByteString,
    pub server_ref: Option<ByteString>,
    pub qos_max: QoS,
    pub packet_size_max: u32,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttBeginEx {
    Publish(PublishBeginEx),
    Subscribe(SubscribeBeginEx),
    Session(SessionBeginEx),
}

impl MqttBeginEx {
    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            MqttBeginEx::Publish(_) => "publish",
            MqttBeginEx::Subscribe(_) => "subscribe",
            MqttBeginEx::Session(_) => "session",
        }
    }
}

/// Message metadata shared by publish and subscribe data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub expiry_interval: i32,
    pub content_type: Option<ByteString>,
    pub format: PayloadFormat,
    pub response_topic: Option<ByteString>,
    pub correlation: Option<Bytes>,
    pub user_properties: Vec<UserProperty>,
}

impl MessageProperties {
    #[inline]
    pub fn new() -> Self {
        Self { expiry_interval: NO_EXPIRY, ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishDataEx {
    pub deferred: i32,
    pub qos: QoS,
    pub flags: PublishFlags,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeDataEx {
    pub deferred: i32,
    pub topic: ByteString,
    pub qos: QoS,
    pub flags: PublishFlags,
    pub subscription_ids: Vec<u32>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDataEx {
    pub deferred: i32,
    pub kind: SessionDataKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttDataEx {
    Publish(PublishDataEx),
    Subscribe(SubscribeDataEx),
    Session(SessionDataEx),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttFlushEx {
    Subscribe { filters: Vec<TopicFilter> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttResetEx {
    pub server_ref: Option<ByteString>,
    pub reason_code: u8,
}
