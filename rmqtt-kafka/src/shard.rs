//! One factory driven by a tokio task.
//!
//! Commands (bindings and inbound frames) arrive on an unbounded channel,
//! outbound frames leave on another one. Timers scheduled through
//! [`EngineContext::signal_at`] are fired from the same task, so the
//! factory never sees concurrent calls.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use rmqtt_kafka_codec::frame::Frame;
use rmqtt_kafka_conf::{BindingConfig, PoolConfig};
use rmqtt_kafka_utils::{timestamp_millis, TimestampMillis};

use crate::context::{EngineContext, InstanceId, TimerId};
use crate::factory::MqttKafkaFactory;
use crate::stats::Stats;
use crate::timer::TimerQueue;
use crate::Result;

#[derive(Debug)]
pub enum Command {
    Attach(BindingConfig),
    Detach(u64),
    /// Begin of a new MQTT stream or any frame of an existing one
    Frame(Frame),
}

pub struct ShardEngine {
    core_index: usize,
    next_id: u64,
    next_trace: i64,
    timers: TimerQueue,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl ShardEngine {
    pub fn new(core_index: usize, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self { core_index, next_id: 1, next_trace: 0, timers: TimerQueue::new(), outbound }
    }
}

impl EngineContext for ShardEngine {
    // odd initial ids, the reply id is the even one below
    fn supply_initial_id(&mut self, _routed_id: u64) -> u64 {
        self.next_id += 2;
        self.next_id
    }

    fn supply_reply_id(&self, initial_id: u64) -> u64 {
        initial_id - 1
    }

    fn supply_trace_id(&mut self) -> i64 {
        self.next_trace += 1;
        self.next_trace
    }

    fn supply_time(&self) -> TimestampMillis {
        timestamp_millis()
    }

    fn accept(&mut self, frame: Frame) {
        if let Err(e) = self.outbound.send(frame) {
            log::debug!("shard {} outbound closed, dropping {}", self.core_index, e.0.name());
        }
    }

    fn signal_at(&mut self, at: TimestampMillis, binding_id: u64, signal_id: i32, context: u32) -> TimerId {
        self.timers.schedule(at, binding_id, signal_id, context)
    }

    fn cancel(&mut self, timer_id: TimerId) -> bool {
        self.timers.cancel(timer_id)
    }

    fn core_index(&self) -> usize {
        self.core_index
    }
}

#[derive(Clone)]
pub struct ShardHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ShardHandle {
    #[inline]
    pub fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| anyhow!("shard closed"))
    }

    #[inline]
    pub fn attach(&self, binding: BindingConfig) -> Result<()> {
        self.send(Command::Attach(binding))
    }

    #[inline]
    pub fn detach(&self, binding_id: u64) -> Result<()> {
        self.send(Command::Detach(binding_id))
    }

    #[inline]
    pub fn frame(&self, frame: Frame) -> Result<()> {
        self.send(Command::Frame(frame))
    }
}

pub struct Shard {
    factory: MqttKafkaFactory,
    engine: ShardEngine,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Shard {
    pub fn new(
        core_index: usize,
        pool: &PoolConfig,
        instance: InstanceId,
        stats: Arc<Stats>,
    ) -> (Self, ShardHandle, mpsc::UnboundedReceiver<Frame>) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (outbound, frames) = mpsc::unbounded_channel();
        let shard = Self {
            factory: MqttKafkaFactory::new(pool, instance, stats),
            engine: ShardEngine::new(core_index, outbound),
            commands,
        };
        (shard, ShardHandle { tx }, frames)
    }

    /// Runs until every handle is dropped.
    pub async fn run(mut self) {
        loop {
            let deadline = self.engine.timers.next_deadline();
            let sleep = deadline
                .map(|at| Duration::from_millis((at - self.engine.supply_time()).max(0) as u64))
                .unwrap_or_default();
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.execute(cmd),
                    None => break,
                },
                _ = tokio::time::sleep(sleep), if deadline.is_some() => self.fire(),
            }
        }
        log::debug!("shard {} stopped", self.engine.core_index);
    }

    fn execute(&mut self, cmd: Command) {
        match cmd {
            Command::Attach(binding) => {
                let id = binding.id;
                match self.factory.attach(binding) {
                    Ok(()) => self.factory.on_attached(&mut self.engine, id),
                    Err(e) => log::error!("binding {} not attached, {}", id, e),
                }
            }
            Command::Detach(id) => {
                self.factory.detach(&mut self.engine, id);
                self.factory.on_detached(id);
            }
            Command::Frame(Frame::Begin(begin)) if !self.factory.is_routed(begin.header.stream_id) => {
                let _ = self.factory.new_stream(&mut self.engine, begin);
            }
            Command::Frame(frame) => self.factory.on_frame(&mut self.engine, frame),
        }
    }

    fn fire(&mut self) {
        let now = self.engine.supply_time();
        for t in self.engine.timers.expired(now) {
            self.factory.on_signal(&mut self.engine, t.binding_id, t.signal_id, t.context);
        }
    }
}

/// Spawn a shard on the current runtime.
pub fn spawn(
    core_index: usize,
    pool: &PoolConfig,
    instance: InstanceId,
    stats: Arc<Stats>,
) -> (ShardHandle, mpsc::UnboundedReceiver<Frame>, JoinHandle<()>) {
    let (shard, handle, frames) = Shard::new(core_index, pool, instance, stats);
    (handle, frames, tokio::spawn(shard.run()))
}

#[cfg(test)]
mod tests {
    use rmqtt_kafka_codec::frame::{Begin, BeginEx, FrameHeader, Reset, ResetEx};
    use rmqtt_kafka_codec::kafka::{KafkaBeginEx, KafkaResetEx};
    use rmqtt_kafka_codec::mqtt::{MqttBeginEx, PublishBeginEx, PublishFlags, QoS};

    use super::*;
    use crate::testing::{binding, BINDING_ID};

    async fn next(frames: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), frames.recv()).await.unwrap().unwrap()
    }

    /// Skip to the next Kafka begin.
    async fn kafka_begin(frames: &mut mpsc::UnboundedReceiver<Frame>) -> (u64, KafkaBeginEx) {
        loop {
            if let Frame::Begin(Begin { header, extension: Some(BeginEx::Kafka(ex)), .. }) = next(frames).await {
                return (header.stream_id, ex);
            }
        }
    }

    #[tokio::test]
    async fn test_shard() {
        let stats = Arc::new(Stats::new());
        let (handle, mut frames, join) =
            spawn(0, &PoolConfig::default(), InstanceId::with("instance-a"), stats.clone());

        handle.attach(binding()).unwrap();
        let (signal, ex) = kafka_begin(&mut frames).await;
        assert_eq!(ex.merged().unwrap().topic, "mqtt-sessions");

        // a transient reset is retried from the timer queue
        let header = FrameHeader::new(BINDING_ID, 2, signal);
        let extension = Some(ResetEx::Kafka(KafkaResetEx { error: 6 }));
        handle.frame(Frame::Reset(Reset { header, extension })).unwrap();
        let (reconnected, _) = kafka_begin(&mut frames).await;
        assert_ne!(reconnected, signal);
        assert_eq!(stats.signal_reconnects.count(), 1);

        let begin = Begin {
            header: FrameHeader::new(BINDING_ID, BINDING_ID, 101),
            affinity: 0,
            extension: Some(BeginEx::Mqtt(MqttBeginEx::Publish(PublishBeginEx {
                client_id: "dev0".into(),
                topic: "sensors/one".into(),
                flags: PublishFlags::empty(),
                qos: QoS::AtMostOnce,
            }))),
        };
        handle.frame(Frame::Begin(begin)).unwrap();
        let (_, ex) = kafka_begin(&mut frames).await;
        assert_eq!(ex.merged().unwrap().topic, "mqtt-messages");
        assert_eq!(stats.publishes.count(), 1);

        handle.detach(BINDING_ID).unwrap();
        drop(handle);
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_binding_rejected() {
        let (handle, mut frames, join) =
            spawn(1, &PoolConfig::default(), InstanceId::new(), Arc::new(Stats::new()));
        let begin = Begin {
            header: FrameHeader::new(9, 9, 101),
            affinity: 0,
            extension: Some(BeginEx::Mqtt(MqttBeginEx::Publish(PublishBeginEx {
                client_id: "dev0".into(),
                topic: "t".into(),
                flags: PublishFlags::empty(),
                qos: QoS::AtMostOnce,
            }))),
        };
        handle.frame(Frame::Begin(begin)).unwrap();
        match next(&mut frames).await {
            Frame::Reset(reset) => assert_eq!(reset.header.stream_id, 101),
            other => panic!("unexpected {:?}", other),
        }
        drop(handle);
        join.await.unwrap();
    }
}
