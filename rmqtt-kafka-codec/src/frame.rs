//! Frames of the flow-controlled stream primitive.
//!
//! Every stream is a pair of legs. The *initial* leg carries
//! Begin/Data/End/Abort/Flush from the client to the server, and the server
//! answers on the same id with Window/Reset. The *reply* leg mirrors it in
//! the other direction.

use bytes::Bytes;

use crate::kafka::{KafkaBeginEx, KafkaDataEx, KafkaFlushEx, KafkaResetEx};
use crate::mqtt::{MqttBeginEx, MqttDataEx, MqttFlushEx, MqttResetEx};

/// Last fragment of a message
pub const DATA_FLAG_FIN: u8 = 0x01;
/// First fragment of a message
pub const DATA_FLAG_INIT: u8 = 0x02;
/// Whole message in a single frame
pub const DATA_FLAG_COMPLETE: u8 = DATA_FLAG_INIT | DATA_FLAG_FIN;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub origin_id: u64,
    pub routed_id: u64,
    pub stream_id: u64,
    pub sequence: i64,
    pub acknowledge: i64,
    pub maximum: i32,
    pub trace_id: i64,
    pub authorization: i64,
}

impl FrameHeader {
    #[inline]
    pub fn new(origin_id: u64, routed_id: u64, stream_id: u64) -> Self {
        Self { origin_id, routed_id, stream_id, ..Default::default() }
    }

    #[inline]
    pub fn flow(mut self, sequence: i64, acknowledge: i64, maximum: i32) -> Self {
        self.sequence = sequence;
        self.acknowledge = acknowledge;
        self.maximum = maximum;
        self
    }

    #[inline]
    pub fn trace(mut self, trace_id: i64, authorization: i64) -> Self {
        self.trace_id = trace_id;
        self.authorization = authorization;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeginEx {
    Mqtt(MqttBeginEx),
    Kafka(KafkaBeginEx),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataEx {
    Mqtt(MqttDataEx),
    Kafka(KafkaDataEx),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushEx {
    Mqtt(MqttFlushEx),
    Kafka(KafkaFlushEx),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResetEx {
    Mqtt(MqttResetEx),
    Kafka(KafkaResetEx),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
    pub header: FrameHeader,
    pub affinity: i64,
    pub extension: Option<BeginEx>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub header: FrameHeader,
    pub budget_id: i64,
    pub flags: u8,
    pub reserved: i32,
    pub payload: Option<Bytes>,
    pub extension: Option<DataEx>,
}

impl Data {
    #[inline]
    pub fn is_init(&self) -> bool {
        self.flags & DATA_FLAG_INIT != 0
    }

    #[inline]
    pub fn is_fin(&self) -> bool {
        self.flags & DATA_FLAG_FIN != 0
    }

    /// A complete record without payload deletes its key.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none() && self.flags & DATA_FLAG_COMPLETE == DATA_FLAG_COMPLETE
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct End {
    pub header: FrameHeader,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Abort {
    pub header: FrameHeader,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flush {
    pub header: FrameHeader,
    pub budget_id: i64,
    pub reserved: i32,
    pub extension: Option<FlushEx>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub header: FrameHeader,
    pub budget_id: i64,
    pub padding: i32,
    pub minimum: i32,
    pub capabilities: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reset {
    pub header: FrameHeader,
    pub extension: Option<ResetEx>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Begin(Begin),
    Data(Data),
    End(End),
    Abort(Abort),
    Flush(Flush),
    Window(Window),
    Reset(Reset),
}

impl Frame {
    #[inline]
    pub fn header(&self) -> &FrameHeader {
        match self {
            Frame::Begin(f) => &f.header,
            Frame::Data(f) => &f.header,
            Frame::End(f) => &f.header,
            Frame::Abort(f) => &f.header,
            Frame::Flush(f) => &f.header,
            Frame::Window(f) => &f.header,
            Frame::Reset(f) => &f.header,
        }
    }

    #[inline]
    pub fn stream_id(&self) -> u64 {
        self.header().stream_id
    }

    #[inline]
    pub fn trace_id(&self) -> i64 {
        self.header().trace_id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Begin(_) => "BEGIN",
            Frame::Data(_) => "DATA",
            Frame::End(_) => "END",
            Frame::Abort(_) => "ABORT",
            Frame::Flush(_) => "FLUSH",
            Frame::Window(_) => "WINDOW",
            Frame::Reset(_) => "RESET",
        }
    }
}
