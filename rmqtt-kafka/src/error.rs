use rmqtt_kafka_codec::error::{DecodeError, EncodeError};

use crate::topic::TopicError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("unknown binding {0}")]
    UnknownBinding(u64),
    #[error("no route for `{0}`")]
    NoRoute(String),
    #[error("unexpected extension, expected {0}")]
    UnexpectedExtension(&'static str),
    #[error("flow control violation on stream {0}")]
    FlowControl(u64),
    #[error("buffer pool exhausted")]
    PoolExhausted,
    #[error("buffer slot {0} overflow")]
    SlotOverflow(usize),
    #[error("invalid topic, {0}")]
    Topic(#[from] TopicError),
    #[error("decode error, {0}")]
    Decode(#[from] DecodeError),
    #[error("encode error, {0}")]
    Encode(#[from] EncodeError),
}
