//! Optional bootstrap streams that keep the Kafka cache warm for the
//! messages and retained topics of a binding.

use std::sync::Arc;

use rmqtt_kafka_codec::frame::{Frame, ResetEx};
use rmqtt_kafka_codec::kafka::KafkaBeginEx;
use rmqtt_kafka_conf::BindingConfig;
use rmqtt_kafka_utils::TimestampMillis;

use crate::context::{Cx, Owner, TimerId, Trace};
use crate::reconnect::{ErrorClassifier, ReconnectBackoff};
use crate::signal::CONNECT_BOOTSTRAP;
use crate::stream::KafkaStream;

struct Slot {
    topic: String,
    stream: Option<KafkaStream>,
    backoff: ReconnectBackoff,
    timer: Option<TimerId>,
}

pub(crate) struct Bootstrap {
    binding_id: u64,
    route_id: u64,
    classifier: Arc<dyn ErrorClassifier>,
    slots: Vec<Slot>,
}

impl Bootstrap {
    pub fn new(binding: &BindingConfig, route_id: u64, classifier: Arc<dyn ErrorClassifier>) -> Self {
        let topics = &binding.options.topics;
        let slots = [&topics.messages, &topics.retained]
            .into_iter()
            .map(|topic| Slot {
                topic: topic.clone(),
                stream: None,
                backoff: ReconnectBackoff::new(binding.options.reconnect_delay),
                timer: None,
            })
            .collect();
        Self { binding_id: binding.id, route_id, classifier, slots }
    }

    #[cfg(test)]
    /// Topics with an open bootstrap stream.
    pub fn connected(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|s| s.stream.as_ref().map(|s| !s.is_closed()).unwrap_or(false))
            .map(|s| s.topic.as_str())
            .collect()
    }

    pub fn connect(&mut self, cx: &mut Cx<'_>) {
        for index in 0..self.slots.len() {
            self.connect_slot(cx, index);
        }
    }

    fn connect_slot(&mut self, cx: &mut Cx<'_>, index: usize) {
        let trace = cx.trace();
        let owner = Owner::Bootstrap(self.binding_id);
        let mut stream = KafkaStream::new(cx, self.binding_id, self.route_id, owner);
        let slot = &mut self.slots[index];
        let ex = KafkaBeginEx::Bootstrap { topic: slot.topic.as_str().into(), group_id: None };
        stream.do_begin(cx.engine, trace, 0, ex);
        log::debug!("binding {} bootstrapping {}", self.binding_id, slot.topic);
        slot.stream = Some(stream);
    }

    pub fn on_signal(&mut self, cx: &mut Cx<'_>, context: u32) {
        let index = context as usize;
        match self.slots.get_mut(index) {
            Some(slot) => {
                slot.timer = None;
                self.connect_slot(cx, index);
            }
            None => log::warn!("binding {} unknown bootstrap slot {}", self.binding_id, index),
        }
    }

    pub fn on_frame(&mut self, cx: &mut Cx<'_>, window: i32, frame: Frame) {
        let id = frame.stream_id();
        let Some(index) = self.slots.iter().position(|s| s.stream.as_ref().map(|s| s.owns(id)).unwrap_or(false))
        else {
            return;
        };
        let trace = Trace::of(&frame);
        let binding_id = self.binding_id;
        let slot = &mut self.slots[index];
        let Some(stream) = slot.stream.as_mut() else {
            return;
        };
        match frame {
            Frame::Begin(begin) => {
                stream.on_begin(&begin);
                stream.do_grant(cx.engine, trace, window);
                slot.backoff.reset();
            }
            Frame::Data(data) => {
                if stream.on_data(&data) {
                    stream.do_grant(cx.engine, trace, window);
                } else {
                    self.reconnect(cx, trace, index);
                }
            }
            Frame::Flush(flush) => {
                if stream.on_flush(&flush) {
                    stream.do_grant(cx.engine, trace, window);
                } else {
                    self.reconnect(cx, trace, index);
                }
            }
            Frame::Window(window) => {
                stream.on_window(&window);
            }
            Frame::End(_) | Frame::Abort(_) => {
                stream.on_end();
                self.reconnect(cx, trace, index);
            }
            Frame::Reset(reset) => {
                stream.on_reset();
                let error = match reset.extension {
                    Some(ResetEx::Kafka(ex)) => ex.error,
                    _ => 0,
                };
                if self.classifier.is_transient(error) {
                    self.reconnect(cx, trace, index);
                } else {
                    log::error!("binding {} bootstrap of {} failed, error {}", binding_id, slot.topic, error);
                    if let Some(mut stream) = slot.stream.take() {
                        stream.do_cleanup(cx.engine, trace);
                        cx.routes.unroute(stream.initial_id, stream.reply_id);
                    }
                }
            }
        }
    }

    fn reconnect(&mut self, cx: &mut Cx<'_>, trace: Trace, index: usize) {
        let slot = &mut self.slots[index];
        if let Some(mut stream) = slot.stream.take() {
            stream.do_cleanup(cx.engine, trace);
            cx.routes.unroute(stream.initial_id, stream.reply_id);
        }
        if slot.timer.is_none() {
            let delay = slot.backoff.next_delay();
            let at = cx.now() + delay.as_millis() as TimestampMillis;
            slot.timer = Some(cx.engine.signal_at(at, self.binding_id, CONNECT_BOOTSTRAP, index as u32));
            log::info!("binding {} bootstrap of {} reconnect in {:?}", self.binding_id, slot.topic, delay);
        }
    }

    pub fn detach(&mut self, cx: &mut Cx<'_>) {
        let trace = cx.trace();
        for slot in self.slots.iter_mut() {
            if let Some(mut stream) = slot.stream.take() {
                stream.do_end(cx.engine, trace);
                stream.do_reset(cx.engine, trace);
                cx.routes.unroute(stream.initial_id, stream.reply_id);
            }
            if let Some(timer) = slot.timer.take() {
                cx.engine.cancel(timer);
            }
        }
    }
}
