//! MQTT message metadata carried as Kafka record headers.

use std::convert::TryFrom;

use bytes::Bytes;
use bytestring::ByteString;

use rmqtt_kafka_codec::kafka::KafkaHeader;
use rmqtt_kafka_codec::mqtt::{MessageProperties, PayloadFormat, QoS, UserProperty, NO_EXPIRY};
use rmqtt_kafka_codec::signal::WillMessage;

pub const HEADER_FILTER: &str = "mqtt:filter";
pub const HEADER_LOCAL: &str = "mqtt:local";
pub const HEADER_EXPIRY: &str = "mqtt:expiry";
pub const HEADER_CONTENT_TYPE: &str = "mqtt:content-type";
pub const HEADER_FORMAT: &str = "mqtt:format";
pub const HEADER_REPLY_TO: &str = "mqtt:reply-to";
pub const HEADER_CORRELATION_ID: &str = "mqtt:correlation-id";
pub const HEADER_QOS: &str = "mqtt:qos";

const FORMAT_TEXT: &str = "TEXT";
const FORMAT_BINARY: &str = "BINARY";

#[inline]
fn header(name: &'static str, value: Bytes) -> KafkaHeader {
    KafkaHeader::new(Bytes::from_static(name.as_bytes()), value)
}

#[inline]
fn text(s: &ByteString) -> Bytes {
    s.as_bytes().clone()
}

/// Headers of a record published on `topic` by `client_id`.
///
/// Every topic level becomes one `mqtt:filter` header, in order, so that
/// subscriptions can match them positionally.
pub fn produce_headers(topic: &str, client_id: &str, qos: QoS, props: &MessageProperties) -> Vec<KafkaHeader> {
    let mut headers = Vec::with_capacity(topic.split('/').count() + 8 + props.user_properties.len());
    for level in topic.split('/') {
        headers.push(header(HEADER_FILTER, Bytes::copy_from_slice(level.as_bytes())));
    }
    headers.push(header(HEADER_LOCAL, Bytes::copy_from_slice(client_id.as_bytes())));
    if props.expiry_interval != NO_EXPIRY {
        headers.push(header(HEADER_EXPIRY, Bytes::copy_from_slice(&props.expiry_interval.to_be_bytes())));
    }
    if let Some(content_type) = &props.content_type {
        headers.push(header(HEADER_CONTENT_TYPE, text(content_type)));
    }
    let format = match props.format {
        PayloadFormat::Text => FORMAT_TEXT,
        PayloadFormat::Binary => FORMAT_BINARY,
    };
    headers.push(header(HEADER_FORMAT, Bytes::from_static(format.as_bytes())));
    if let Some(reply_to) = &props.response_topic {
        headers.push(header(HEADER_REPLY_TO, text(reply_to)));
    }
    if let Some(correlation) = &props.correlation {
        headers.push(header(HEADER_CORRELATION_ID, correlation.clone()));
    }
    headers.push(header(HEADER_QOS, Bytes::from(vec![b'0' + u8::from(qos)])));
    for prop in &props.user_properties {
        headers.push(KafkaHeader::new(text(&prop.key), text(&prop.value)));
    }
    headers
}

/// Headers of a delivered will, published on behalf of `client_id`.
pub fn will_headers(will: &WillMessage, client_id: &str) -> Vec<KafkaHeader> {
    let props = MessageProperties {
        expiry_interval: will.expiry_interval,
        content_type: will.content_type.clone(),
        format: will.format,
        response_topic: will.response_topic.clone(),
        correlation: will.correlation.clone(),
        user_properties: will.properties.clone(),
    };
    produce_headers(&will.topic, client_id, will.qos, &props)
}

/// Recover the MQTT metadata from the headers of a fetched record.
///
/// Unrecognized values fall back to defaults, headers outside the
/// `mqtt:` namespace are user properties.
pub fn fetched_properties(headers: &[KafkaHeader]) -> (QoS, MessageProperties) {
    let mut qos = QoS::AtMostOnce;
    let mut props = MessageProperties::new();
    for h in headers {
        let value = h.value.clone().unwrap_or_default();
        match std::str::from_utf8(&h.name) {
            Ok(HEADER_FILTER) | Ok(HEADER_LOCAL) => {}
            Ok(HEADER_EXPIRY) => {
                if let Ok(raw) = <[u8; 4]>::try_from(value.as_ref()) {
                    props.expiry_interval = i32::from_be_bytes(raw);
                }
            }
            Ok(HEADER_CONTENT_TYPE) => props.content_type = ByteString::try_from(value).ok(),
            Ok(HEADER_FORMAT) => {
                props.format =
                    if value.as_ref() == FORMAT_TEXT.as_bytes() { PayloadFormat::Text } else { PayloadFormat::Binary }
            }
            Ok(HEADER_REPLY_TO) => props.response_topic = ByteString::try_from(value).ok(),
            Ok(HEADER_CORRELATION_ID) => props.correlation = Some(value),
            Ok(HEADER_QOS) => {
                if let [digit] = value.as_ref() {
                    qos = QoS::try_from(digit.wrapping_sub(b'0')).unwrap_or(QoS::AtMostOnce);
                }
            }
            Ok(key) => {
                if let Ok(value) = ByteString::try_from(value) {
                    props.user_properties.push(UserProperty { key: ByteString::from(key), value });
                }
            }
            Err(_) => log::debug!("skipping header with non utf8 name"),
        }
    }
    (qos, props)
}

/// Subscription ids whose filter bit is set in `mask`.
pub fn subscription_ids(filters: &[rmqtt_kafka_codec::mqtt::TopicFilter], mask: u64) -> Vec<u32> {
    filters
        .iter()
        .enumerate()
        .filter(|(i, f)| *i < 64 && mask & (1u64 << i) != 0 && f.subscription_id != 0)
        .map(|(_, f)| f.subscription_id)
        .collect()
}
