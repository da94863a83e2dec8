//! Deterministic engine and frame builders shared by the proxy tests.

use std::sync::Arc;

use ahash::HashMap;
use bytes::Bytes;
use simple_logger::SimpleLogger;

use rmqtt_kafka_codec::frame::{
    Abort, Begin, BeginEx, Data, DataEx, End, Flush, FlushEx, Frame, FrameHeader, Reset, ResetEx, Window,
    DATA_FLAG_COMPLETE,
};
use rmqtt_kafka_codec::kafka::{
    GroupMembership, KafkaBeginEx, KafkaDataEx, KafkaFlushEx, KafkaHeader, KafkaOffset, KafkaResetEx,
    MergedFetchDataEx, MergedProduceDataEx, PARTITION_ANY,
};
use rmqtt_kafka_codec::mqtt::MqttBeginEx;
use rmqtt_kafka_conf::{BindingConfig, Options, PoolConfig, RouteConfig};
use rmqtt_kafka_utils::TimestampMillis;

use crate::context::{EngineContext, InstanceId, TimerId};
use crate::factory::MqttKafkaFactory;
use crate::stats::Stats;
use crate::timer::TimerQueue;

pub const BINDING_ID: u64 = 1;
pub const ROUTE_ID: u64 = 2;
pub const START: TimestampMillis = 1_000_000;

pub struct TestEngine {
    pub now: TimestampMillis,
    pub core: usize,
    pub timers: TimerQueue,
    pub frames: Vec<Frame>,
    next_id: u64,
    next_trace: i64,
}

impl TestEngine {
    pub fn new(core: usize) -> Self {
        Self { now: START, core, timers: TimerQueue::new(), frames: Vec::new(), next_id: 11, next_trace: 0 }
    }
}

impl EngineContext for TestEngine {
    fn supply_initial_id(&mut self, _routed_id: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 2;
        id
    }

    fn supply_reply_id(&self, initial_id: u64) -> u64 {
        initial_id - 1
    }

    fn supply_trace_id(&mut self) -> i64 {
        self.next_trace += 1;
        self.next_trace
    }

    fn supply_time(&self) -> TimestampMillis {
        self.now
    }

    fn accept(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    fn signal_at(&mut self, at: TimestampMillis, binding_id: u64, signal_id: i32, context: u32) -> TimerId {
        self.timers.schedule(at, binding_id, signal_id, context)
    }

    fn cancel(&mut self, timer_id: TimerId) -> bool {
        self.timers.cancel(timer_id)
    }

    fn core_index(&self) -> usize {
        self.core
    }
}

pub fn binding() -> BindingConfig {
    BindingConfig {
        id: BINDING_ID,
        options: Options::default(),
        routes: vec![RouteConfig { id: ROUTE_ID, when: vec![], with: None }],
    }
}

/// A record written by a produce stream.
#[derive(Debug, Clone)]
pub struct Produced {
    pub stream_id: u64,
    pub key: Bytes,
    pub payload: Option<Bytes>,
    pub headers: Vec<KafkaHeader>,
}

impl Produced {
    pub fn key_str(&self) -> &str {
        std::str::from_utf8(&self.key).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.iter().find(|h| h.is(name.as_bytes())).and_then(|h| h.value.as_deref())
    }
}

/// Factory plus engine, with per-stream sequence tracking for inbound frames.
pub struct Harness {
    pub engine: TestEngine,
    pub factory: MqttKafkaFactory,
    sequences: HashMap<u64, i64>,
}

impl Harness {
    pub fn new(core: usize) -> Self {
        Self::with_pool(core, PoolConfig::default())
    }

    pub fn with_pool(core: usize, pool: PoolConfig) -> Self {
        // already installed by an earlier test
        let _ = SimpleLogger::new().with_level(log::LevelFilter::Debug).init();
        let factory = MqttKafkaFactory::new(&pool, InstanceId::with("instance-a"), Arc::new(Stats::new()));
        Self { engine: TestEngine::new(core), factory, sequences: HashMap::default() }
    }

    pub fn attach(&mut self, binding: BindingConfig) {
        let id = binding.id;
        self.factory.attach(binding).unwrap();
        self.factory.on_attached(&mut self.engine, id);
    }

    pub fn stats(&self) -> &Stats {
        self.factory.stats()
    }

    pub fn take(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.engine.frames)
    }

    /// Open an MQTT stream on the binding.
    pub fn open(&mut self, stream_id: u64, ex: MqttBeginEx) {
        let begin = Begin {
            header: FrameHeader::new(BINDING_ID, BINDING_ID, stream_id),
            affinity: 0,
            extension: Some(BeginEx::Mqtt(ex)),
        };
        let _ = self.factory.new_stream(&mut self.engine, begin);
    }

    pub fn send(&mut self, frame: Frame) {
        self.factory.on_frame(&mut self.engine, frame);
    }

    /// Move the clock and fire whatever timers fell due.
    pub fn advance(&mut self, millis: i64) {
        self.engine.now += millis;
        for t in self.engine.timers.expired(self.engine.now) {
            self.factory.on_signal(&mut self.engine, t.binding_id, t.signal_id, t.context);
        }
    }

    fn header(&mut self, stream_id: u64, reserved: i32) -> FrameHeader {
        let sequence = self.sequences.entry(stream_id).or_insert(0);
        let header = FrameHeader::new(BINDING_ID, ROUTE_ID, stream_id).flow(*sequence, 0, 0);
        *sequence += reserved as i64;
        header
    }

    pub fn begin(&mut self, stream_id: u64) {
        let header = self.header(stream_id, 0);
        self.send(Frame::Begin(Begin { header, affinity: 0, extension: None }));
    }

    pub fn window(&mut self, stream_id: u64, acknowledge: i64, maximum: i32, padding: i32) {
        let header = FrameHeader::new(BINDING_ID, ROUTE_ID, stream_id).flow(0, acknowledge, maximum);
        self.send(Frame::Window(Window { header, budget_id: 0, padding, minimum: 0, capabilities: 0 }));
    }

    pub fn data(&mut self, stream_id: u64, flags: u8, payload: Option<Bytes>, extension: Option<DataEx>) {
        let reserved = payload.as_ref().map(|p| p.len()).unwrap_or(0) as i32;
        let header = self.header(stream_id, reserved);
        self.send(Frame::Data(Data { header, budget_id: 0, flags, reserved, payload, extension }));
    }

    /// One complete fetched record on a merged reply stream.
    pub fn fetched(
        &mut self,
        stream_id: u64,
        timestamp: TimestampMillis,
        key: Bytes,
        payload: Option<Bytes>,
        headers: Vec<KafkaHeader>,
    ) {
        let ex = MergedFetchDataEx {
            deferred: 0,
            timestamp,
            filters: 1,
            partition: KafkaOffset::new(0, 1),
            progress: vec![],
            key: Some(key),
            headers,
        };
        self.data(stream_id, DATA_FLAG_COMPLETE, payload, Some(DataEx::Kafka(KafkaDataEx::MergedFetch(ex))));
    }

    pub fn membership(&mut self, stream_id: u64, leader: &str, member: &str, members: i32) {
        let m = GroupMembership { leader_id: leader.into(), member_id: member.into(), members };
        self.data(stream_id, DATA_FLAG_COMPLETE, None, Some(DataEx::Kafka(KafkaDataEx::Group(m))));
    }

    pub fn flush(&mut self, stream_id: u64, extension: Option<FlushEx>) {
        let header = self.header(stream_id, 0);
        self.send(Frame::Flush(Flush { header, budget_id: 0, reserved: 0, extension }));
    }

    /// Flush reporting progress on `partitions` of a merged stream.
    pub fn progress(&mut self, stream_id: u64, partitions: &[i32]) {
        let progress = partitions.iter().map(|p| KafkaOffset::new(*p, 0)).collect();
        self.flush(stream_id, Some(FlushEx::Kafka(KafkaFlushEx::Merged { progress, filters: vec![] })));
    }

    pub fn end(&mut self, stream_id: u64) {
        let header = self.header(stream_id, 0);
        self.send(Frame::End(End { header }));
    }

    pub fn abort(&mut self, stream_id: u64) {
        let header = self.header(stream_id, 0);
        self.send(Frame::Abort(Abort { header }));
    }

    pub fn reset(&mut self, stream_id: u64, error: Option<i32>) {
        let header = self.header(stream_id, 0);
        let extension = error.map(|error| ResetEx::Kafka(KafkaResetEx { error }));
        self.send(Frame::Reset(Reset { header, extension }));
    }
}

/// Kafka begins sent by the proxies, by initial stream id.
pub fn kafka_begins(frames: &[Frame]) -> Vec<(u64, KafkaBeginEx)> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Begin(Begin { header, extension: Some(BeginEx::Kafka(ex)), .. }) => {
                Some((header.stream_id, ex.clone()))
            }
            _ => None,
        })
        .collect()
}

pub fn produced(frames: &[Frame]) -> Vec<Produced> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Data(Data { header, payload, extension: Some(DataEx::Kafka(ex)), .. }) => {
                let KafkaDataEx::MergedProduce(MergedProduceDataEx { key, headers, partition, .. }) = ex else {
                    return None;
                };
                assert_eq!(partition.partition_id, PARTITION_ANY);
                Some(Produced {
                    stream_id: header.stream_id,
                    key: key.clone().unwrap_or_default(),
                    payload: payload.clone(),
                    headers: headers.clone(),
                })
            }
            _ => None,
        })
        .collect()
}

/// Names and stream ids of every frame, for asserting the order of effects.
pub fn names(frames: &[Frame]) -> Vec<(&'static str, u64)> {
    frames.iter().map(|f| (f.name(), f.stream_id())).collect()
}

pub fn find<'a>(frames: &'a [Frame], name: &str, stream_id: u64) -> Option<&'a Frame> {
    frames.iter().find(|f| f.name() == name && f.stream_id() == stream_id)
}
