//! Per-leg lifecycle and credit bookkeeping, and the frame builders every
//! proxy uses to talk to its peers.

use bitflags::bitflags;
use bytes::Bytes;

use rmqtt_kafka_codec::frame::{
    Abort, Begin, BeginEx, Data, DataEx, End, Flush, FlushEx, Frame, FrameHeader, Reset, ResetEx, Window,
};
use rmqtt_kafka_codec::frame::DATA_FLAG_COMPLETE;
use rmqtt_kafka_codec::kafka::{
    KafkaBeginEx, KafkaCapabilities, KafkaDataEx, KafkaFilter, KafkaFlushEx, KafkaHeader, KafkaOffset,
    MergedBeginEx, MergedProduceDataEx, OFFSET_LIVE, PARTITION_ANY,
};
use rmqtt_kafka_utils::TimestampMillis;
use rmqtt_kafka_codec::mqtt::{MqttBeginEx, MqttDataEx, MqttResetEx};

use crate::context::{Cx, EngineContext, Owner, Trace};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct StreamState: u8 {
        const INITIAL_OPENING = 0x01;
        const INITIAL_OPENED = 0x02;
        const INITIAL_CLOSED = 0x08;
        const REPLY_OPENING = 0x10;
        const REPLY_OPENED = 0x20;
        const REPLY_CLOSED = 0x80;
    }
}

impl StreamState {
    #[inline]
    pub fn initial_opening(&self) -> bool {
        self.contains(Self::INITIAL_OPENING)
    }

    #[inline]
    pub fn initial_opened(&self) -> bool {
        self.contains(Self::INITIAL_OPENED)
    }

    #[inline]
    pub fn initial_closed(&self) -> bool {
        self.contains(Self::INITIAL_CLOSED)
    }

    #[inline]
    pub fn reply_opening(&self) -> bool {
        self.contains(Self::REPLY_OPENING)
    }

    #[inline]
    pub fn reply_opened(&self) -> bool {
        self.contains(Self::REPLY_OPENED)
    }

    #[inline]
    pub fn reply_closed(&self) -> bool {
        self.contains(Self::REPLY_CLOSED)
    }

    #[inline]
    pub fn closed(&self) -> bool {
        self.initial_closed() && self.reply_closed()
    }
}

/// Credit state of one direction: `acknowledge <= sequence <= acknowledge + maximum`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Flow {
    pub sequence: i64,
    pub acknowledge: i64,
    pub maximum: i32,
    pub padding: i32,
    pub budget_id: i64,
}

impl Flow {
    #[inline]
    pub fn credit(&self) -> i64 {
        self.acknowledge + self.maximum as i64 - self.sequence
    }

    #[inline]
    pub fn outstanding(&self) -> i64 {
        self.sequence - self.acknowledge
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.acknowledge <= self.sequence && self.sequence <= self.acknowledge + self.maximum as i64
    }

    /// Reserved size of a frame carrying `len` bytes.
    #[inline]
    pub fn reserved(&self, len: usize) -> i32 {
        len as i32 + self.padding
    }

    /// Account an outgoing frame. Exceeding the peer's window is a bug in the caller.
    #[inline]
    pub fn reserve(&mut self, reserved: i32) {
        self.sequence += reserved as i64;
        assert!(
            self.sequence <= self.acknowledge + self.maximum as i64,
            "window exceeded, sequence {} acknowledge {} maximum {}",
            self.sequence,
            self.acknowledge,
            self.maximum
        );
    }

    /// Account an incoming frame against the window granted to the peer.
    ///
    /// Returns false when the peer overran the window or its counters went backwards.
    #[inline]
    pub fn receive(&mut self, sequence: i64, acknowledge: i64, reserved: i32) -> bool {
        if sequence < self.sequence || acknowledge > sequence || reserved < 0 {
            return false;
        }
        self.sequence = sequence + reserved as i64;
        self.sequence <= self.acknowledge + self.maximum as i64
    }

    /// Apply a window from the peer, never moving `acknowledge` backwards or past `sequence`.
    #[inline]
    pub fn update(&mut self, acknowledge: i64, maximum: i32, padding: i32, budget_id: i64) {
        let clamped = acknowledge.clamp(self.acknowledge, self.sequence.max(self.acknowledge));
        if clamped != acknowledge {
            log::warn!(
                "window acknowledge {} out of range [{}, {}], clamped",
                acknowledge,
                self.acknowledge,
                self.sequence
            );
        }
        self.acknowledge = clamped;
        self.maximum = maximum.max(0);
        self.padding = padding;
        self.budget_id = budget_id;
    }

    /// Whichever of the two leaves less credit, padded for both.
    #[inline]
    pub fn narrower(&self, other: &Flow) -> Flow {
        let padding = self.padding.max(other.padding);
        let narrow = if other.credit() < self.credit() { other } else { self };
        Flow { padding, ..*narrow }
    }

    /// Window to grant on this leg so that its credit equals the credit of `downstream`.
    #[inline]
    pub fn mirror(&self, downstream: &Flow) -> (i64, i32) {
        let upper = self.sequence.max(self.acknowledge);
        let acknowledge = (self.sequence - downstream.outstanding()).clamp(self.acknowledge, upper);
        (acknowledge, downstream.maximum)
    }
}

/// Merged stream over every partition of `topic`, starting at `offset`.
pub(crate) fn merged_begin(
    capabilities: KafkaCapabilities,
    topic: &str,
    offset: i64,
    filters: Vec<KafkaFilter>,
) -> KafkaBeginEx {
    KafkaBeginEx::Merged(MergedBeginEx {
        capabilities,
        topic: topic.into(),
        group_id: None,
        partitions: vec![KafkaOffset::new(PARTITION_ANY, offset)],
        filters,
    })
}

/// Refuse a stream we never took ownership of.
pub(crate) fn reject(engine: &mut dyn EngineContext, begin: &Begin) {
    let h = &begin.header;
    let header = FrameHeader::new(h.origin_id, h.routed_id, h.stream_id)
        .flow(h.sequence, h.acknowledge, 0)
        .trace(h.trace_id, h.authorization);
    engine.accept(Frame::Reset(Reset { header, extension: None }));
}

#[inline]
fn header(origin_id: u64, routed_id: u64, stream_id: u64, flow: &Flow, trace: Trace) -> FrameHeader {
    FrameHeader::new(origin_id, routed_id, stream_id)
        .flow(flow.sequence, flow.acknowledge, flow.maximum)
        .trace(trace.trace_id, trace.authorization)
}

/// Client side of a Kafka-facing stream opened by a proxy.
#[derive(Debug)]
pub(crate) struct KafkaStream {
    pub origin_id: u64,
    pub routed_id: u64,
    pub initial_id: u64,
    pub reply_id: u64,
    pub state: StreamState,
    pub initial: Flow,
    pub reply: Flow,
}

impl KafkaStream {
    pub fn new(cx: &mut Cx<'_>, origin_id: u64, routed_id: u64, owner: Owner) -> Self {
        let initial_id = cx.engine.supply_initial_id(routed_id);
        let reply_id = cx.engine.supply_reply_id(initial_id);
        cx.routes.route(initial_id, reply_id, owner);
        Self {
            origin_id,
            routed_id,
            initial_id,
            reply_id,
            state: StreamState::empty(),
            initial: Flow::default(),
            reply: Flow::default(),
        }
    }

    #[inline]
    pub fn owns(&self, stream_id: u64) -> bool {
        stream_id == self.initial_id || stream_id == self.reply_id
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.closed()
    }

    /// Whether a frame of `reserved` bytes fits the current window.
    #[inline]
    pub fn can_send(&self, reserved: i32) -> bool {
        self.state.initial_opened() && !self.state.initial_closed() && self.initial.credit() >= reserved as i64
    }

    #[inline]
    fn initial_header(&self, trace: Trace) -> FrameHeader {
        header(self.origin_id, self.routed_id, self.initial_id, &self.initial, trace)
    }

    #[inline]
    fn reply_header(&self, trace: Trace) -> FrameHeader {
        header(self.origin_id, self.routed_id, self.reply_id, &self.reply, trace)
    }

    pub fn do_begin(&mut self, engine: &mut dyn EngineContext, trace: Trace, affinity: i64, ex: KafkaBeginEx) {
        self.state.insert(StreamState::INITIAL_OPENING);
        engine.accept(Frame::Begin(Begin {
            header: self.initial_header(trace),
            affinity,
            extension: Some(BeginEx::Kafka(ex)),
        }));
    }

    pub fn do_data(
        &mut self,
        engine: &mut dyn EngineContext,
        trace: Trace,
        flags: u8,
        reserved: i32,
        payload: Option<Bytes>,
        ex: Option<KafkaDataEx>,
    ) {
        let header = self.initial_header(trace);
        self.initial.reserve(reserved);
        engine.accept(Frame::Data(Data {
            header,
            budget_id: self.initial.budget_id,
            flags,
            reserved,
            payload,
            extension: ex.map(DataEx::Kafka),
        }));
    }

    /// Produce one complete record, false when the window cannot take it yet.
    pub fn do_produce(
        &mut self,
        engine: &mut dyn EngineContext,
        trace: Trace,
        timestamp: TimestampMillis,
        key: Bytes,
        payload: Option<Bytes>,
        headers: Vec<KafkaHeader>,
    ) -> bool {
        let reserved = self.initial.reserved(payload.as_ref().map(|p| p.len()).unwrap_or(0));
        if !self.can_send(reserved) {
            return false;
        }
        let ex = KafkaDataEx::MergedProduce(MergedProduceDataEx {
            deferred: 0,
            timestamp,
            partition: KafkaOffset::new(PARTITION_ANY, OFFSET_LIVE),
            key: Some(key),
            hash_key: None,
            headers,
        });
        self.do_data(engine, trace, DATA_FLAG_COMPLETE, reserved, payload, Some(ex));
        true
    }

    pub fn do_flush(&mut self, engine: &mut dyn EngineContext, trace: Trace, reserved: i32, ex: KafkaFlushEx) {
        let header = self.initial_header(trace);
        self.initial.reserve(reserved);
        engine.accept(Frame::Flush(Flush {
            header,
            budget_id: self.initial.budget_id,
            reserved,
            extension: Some(FlushEx::Kafka(ex)),
        }));
    }

    pub fn do_end(&mut self, engine: &mut dyn EngineContext, trace: Trace) {
        if self.state.initial_opening() && !self.state.initial_closed() {
            self.state.insert(StreamState::INITIAL_CLOSED);
            engine.accept(Frame::End(End { header: self.initial_header(trace) }));
        }
    }

    pub fn do_abort(&mut self, engine: &mut dyn EngineContext, trace: Trace) {
        if self.state.initial_opening() && !self.state.initial_closed() {
            self.state.insert(StreamState::INITIAL_CLOSED);
            engine.accept(Frame::Abort(Abort { header: self.initial_header(trace) }));
        }
    }

    pub fn do_window(&mut self, engine: &mut dyn EngineContext, trace: Trace, acknowledge: i64, maximum: i32) {
        self.reply.acknowledge = acknowledge;
        self.reply.maximum = maximum;
        engine.accept(Frame::Window(Window {
            header: self.reply_header(trace),
            budget_id: self.reply.budget_id,
            padding: self.reply.padding,
            minimum: 0,
            capabilities: 0,
        }));
    }

    /// Keep `window` bytes of credit open on the reply leg.
    pub fn do_grant(&mut self, engine: &mut dyn EngineContext, trace: Trace, window: i32) {
        let acknowledge = self.reply.sequence;
        if self.state.reply_opening()
            && !self.state.reply_closed()
            && (acknowledge > self.reply.acknowledge || window != self.reply.maximum)
        {
            self.do_window(engine, trace, acknowledge, window);
        }
    }

    /// Pass the credit of `downstream` on to the reply leg.
    pub fn do_mirror(&mut self, engine: &mut dyn EngineContext, trace: Trace, downstream: &Flow) {
        let (acknowledge, maximum) = self.reply.mirror(downstream);
        if self.state.reply_opening()
            && !self.state.reply_closed()
            && (acknowledge > self.reply.acknowledge || maximum != self.reply.maximum)
        {
            self.do_window(engine, trace, acknowledge, maximum);
        }
    }

    pub fn do_reset(&mut self, engine: &mut dyn EngineContext, trace: Trace) {
        if !self.state.reply_closed() {
            self.state.insert(StreamState::REPLY_CLOSED);
            engine.accept(Frame::Reset(Reset { header: self.reply_header(trace), extension: None }));
        }
    }

    /// Close whatever is still open.
    pub fn do_cleanup(&mut self, engine: &mut dyn EngineContext, trace: Trace) {
        self.do_abort(engine, trace);
        self.do_reset(engine, trace);
        self.state.insert(StreamState::INITIAL_CLOSED);
    }

    pub fn on_begin(&mut self, begin: &Begin) {
        self.state.insert(StreamState::REPLY_OPENING | StreamState::REPLY_OPENED);
        self.reply.sequence = begin.header.sequence;
        self.reply.acknowledge = begin.header.acknowledge;
    }

    #[inline]
    pub fn on_data(&mut self, data: &Data) -> bool {
        self.reply.receive(data.header.sequence, data.header.acknowledge, data.reserved)
    }

    #[inline]
    pub fn on_flush(&mut self, flush: &Flush) -> bool {
        self.reply.receive(flush.header.sequence, flush.header.acknowledge, flush.reserved)
    }

    #[inline]
    pub fn on_end(&mut self) {
        self.state.insert(StreamState::REPLY_CLOSED);
    }

    #[inline]
    pub fn on_abort(&mut self) {
        self.state.insert(StreamState::REPLY_CLOSED);
    }

    /// Returns true for the first window of the stream.
    pub fn on_window(&mut self, window: &Window) -> bool {
        let first = !self.state.initial_opened();
        self.initial.update(window.header.acknowledge, window.header.maximum, window.padding, window.budget_id);
        self.state.insert(StreamState::INITIAL_OPENED);
        first
    }

    #[inline]
    pub fn on_reset(&mut self) {
        self.state.insert(StreamState::INITIAL_CLOSED);
    }
}

/// Server side of the MQTT-facing stream a proxy was created for.
#[derive(Debug)]
pub(crate) struct MqttStream {
    pub origin_id: u64,
    pub routed_id: u64,
    pub initial_id: u64,
    pub reply_id: u64,
    pub affinity: i64,
    pub state: StreamState,
    pub initial: Flow,
    pub reply: Flow,
}

impl MqttStream {
    pub fn new(cx: &mut Cx<'_>, begin: &Begin, owner: Owner) -> Self {
        let initial_id = begin.header.stream_id;
        let reply_id = cx.engine.supply_reply_id(initial_id);
        cx.routes.route(initial_id, reply_id, owner);
        let initial =
            Flow { sequence: begin.header.sequence, acknowledge: begin.header.acknowledge, ..Default::default() };
        Self {
            origin_id: begin.header.origin_id,
            routed_id: begin.header.routed_id,
            initial_id,
            reply_id,
            affinity: begin.affinity,
            state: StreamState::INITIAL_OPENING,
            initial,
            reply: Flow::default(),
        }
    }

    #[inline]
    pub fn owns(&self, stream_id: u64) -> bool {
        stream_id == self.initial_id || stream_id == self.reply_id
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.closed()
    }

    #[inline]
    pub fn can_send(&self, reserved: i32) -> bool {
        self.state.reply_opened() && !self.state.reply_closed() && self.reply.credit() >= reserved as i64
    }

    #[inline]
    fn initial_header(&self, trace: Trace) -> FrameHeader {
        header(self.origin_id, self.routed_id, self.initial_id, &self.initial, trace)
    }

    #[inline]
    fn reply_header(&self, trace: Trace) -> FrameHeader {
        header(self.origin_id, self.routed_id, self.reply_id, &self.reply, trace)
    }

    pub fn do_window(
        &mut self,
        engine: &mut dyn EngineContext,
        trace: Trace,
        acknowledge: i64,
        maximum: i32,
        padding: i32,
    ) {
        self.initial.acknowledge = acknowledge;
        self.initial.maximum = maximum;
        self.initial.padding = padding;
        self.state.insert(StreamState::INITIAL_OPENED);
        engine.accept(Frame::Window(Window {
            header: self.initial_header(trace),
            budget_id: self.initial.budget_id,
            padding,
            minimum: 0,
            capabilities: 0,
        }));
    }

    /// Offer the credit of `downstream` to the client, plus `extra_padding` per frame.
    pub fn do_mirror(&mut self, engine: &mut dyn EngineContext, trace: Trace, downstream: &Flow, extra_padding: i32) {
        let (acknowledge, maximum) = self.initial.mirror(downstream);
        let padding = downstream.padding + extra_padding;
        if !self.state.initial_closed()
            && (!self.state.initial_opened()
                || acknowledge > self.initial.acknowledge
                || maximum != self.initial.maximum
                || padding != self.initial.padding)
        {
            self.do_window(engine, trace, acknowledge, maximum, padding);
        }
    }

    pub fn do_reset(&mut self, engine: &mut dyn EngineContext, trace: Trace, ex: Option<MqttResetEx>) {
        if !self.state.initial_closed() {
            self.state.insert(StreamState::INITIAL_CLOSED);
            engine.accept(Frame::Reset(Reset { header: self.initial_header(trace), extension: ex.map(ResetEx::Mqtt) }));
        }
    }

    pub fn do_begin(&mut self, engine: &mut dyn EngineContext, trace: Trace, ex: Option<MqttBeginEx>) {
        if !self.state.reply_opening() {
            self.state.insert(StreamState::REPLY_OPENING);
            engine.accept(Frame::Begin(Begin {
                header: self.reply_header(trace),
                affinity: self.affinity,
                extension: ex.map(BeginEx::Mqtt),
            }));
        }
    }

    pub fn do_data(
        &mut self,
        engine: &mut dyn EngineContext,
        trace: Trace,
        flags: u8,
        reserved: i32,
        payload: Option<Bytes>,
        ex: Option<MqttDataEx>,
    ) {
        let header = self.reply_header(trace);
        self.reply.reserve(reserved);
        engine.accept(Frame::Data(Data {
            header,
            budget_id: self.reply.budget_id,
            flags,
            reserved,
            payload,
            extension: ex.map(DataEx::Mqtt),
        }));
    }

    /// Ends the reply, a reply that never began is just marked closed.
    pub fn do_end(&mut self, engine: &mut dyn EngineContext, trace: Trace) {
        if !self.state.reply_closed() {
            self.state.insert(StreamState::REPLY_CLOSED);
            if self.state.reply_opening() {
                engine.accept(Frame::End(End { header: self.reply_header(trace) }));
            }
        }
    }

    pub fn do_abort(&mut self, engine: &mut dyn EngineContext, trace: Trace) {
        if !self.state.reply_closed() {
            self.state.insert(StreamState::REPLY_CLOSED);
            if self.state.reply_opening() {
                engine.accept(Frame::Abort(Abort { header: self.reply_header(trace) }));
            }
        }
    }

    #[inline]
    pub fn on_data(&mut self, data: &Data) -> bool {
        self.initial.receive(data.header.sequence, data.header.acknowledge, data.reserved)
    }

    #[inline]
    pub fn on_flush(&mut self, flush: &Flush) -> bool {
        self.initial.receive(flush.header.sequence, flush.header.acknowledge, flush.reserved)
    }

    #[inline]
    pub fn on_end(&mut self) {
        self.state.insert(StreamState::INITIAL_CLOSED);
    }

    #[inline]
    pub fn on_abort(&mut self) {
        self.state.insert(StreamState::INITIAL_CLOSED);
    }

    pub fn on_window(&mut self, window: &Window) -> bool {
        let first = !self.state.reply_opened();
        self.reply.update(window.header.acknowledge, window.header.maximum, window.padding, window.budget_id);
        self.state.insert(StreamState::REPLY_OPENED);
        first
    }

    #[inline]
    pub fn on_reset(&mut self) {
        self.state.insert(StreamState::REPLY_CLOSED);
    }
}
