//! MQTT publish stream onto a merged Kafka produce stream.

use bytes::Bytes;
use bytestring::ByteString;

use rmqtt_kafka_codec::frame::{Begin, Data, DataEx, Frame};
use rmqtt_kafka_codec::kafka::{
    KafkaCapabilities, KafkaDataEx, KafkaOffset, MergedProduceDataEx, OFFSET_HISTORICAL, OFFSET_LIVE, PARTITION_ANY,
};
use rmqtt_kafka_codec::mqtt::{MqttDataEx, PublishBeginEx, PublishFlags};
use rmqtt_kafka_conf::BindingConfig;

use crate::context::{Cx, Owner, Trace};
use crate::error::ProxyError;
use crate::message::produce_headers;
use crate::stream::{merged_begin, KafkaStream, MqttStream};
use crate::topic::resolve;

pub(crate) struct PublishProxy {
    mqtt: MqttStream,
    client_id: ByteString,
    topic: ByteString,
    messages: KafkaStream,
    retained: Option<KafkaStream>,
    // current message is also written to the retained topic
    retaining: bool,
}

impl PublishProxy {
    pub fn new(
        cx: &mut Cx<'_>,
        binding: &BindingConfig,
        begin: &Begin,
        ex: PublishBeginEx,
    ) -> Result<Self, ProxyError> {
        let route = resolve(binding, &ex.topic).ok_or_else(|| ProxyError::NoRoute(ex.topic.to_string()))?;
        let options = &binding.options;
        let trace = Trace::from(&begin.header);

        let owner = Owner::Publish(begin.header.stream_id);
        let mqtt = MqttStream::new(cx, begin, owner);

        let topic = route.with.as_deref().unwrap_or(&options.topics.messages);
        let mut messages = KafkaStream::new(cx, mqtt.routed_id, route.id, owner);
        messages.do_begin(
            cx.engine,
            trace,
            mqtt.affinity,
            merged_begin(KafkaCapabilities::ProduceOnly, topic, OFFSET_HISTORICAL, vec![]),
        );

        let retained = if ex.flags.contains(PublishFlags::RETAIN) && options.capabilities.retain_available {
            let mut retained = KafkaStream::new(cx, mqtt.routed_id, route.id, owner);
            retained.do_begin(
                cx.engine,
                trace,
                mqtt.affinity,
                merged_begin(KafkaCapabilities::ProduceOnly, &options.topics.retained, OFFSET_HISTORICAL, vec![]),
            );
            Some(retained)
        } else {
            None
        };

        log::debug!("{} publish {} to {} retained: {}", ex.client_id, ex.topic, topic, retained.is_some());
        cx.stats.publishes.inc();
        Ok(Self { mqtt, client_id: ex.client_id, topic: ex.topic, messages, retained, retaining: false })
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.mqtt.is_closed()
    }

    pub fn cleanup(&mut self, cx: &mut Cx<'_>) {
        let trace = cx.trace();
        self.messages.do_cleanup(cx.engine, trace);
        if let Some(retained) = self.retained.as_mut() {
            retained.do_cleanup(cx.engine, trace);
        }
        cx.stats.publishes.dec();
    }

    pub fn on_frame(&mut self, cx: &mut Cx<'_>, frame: Frame) {
        let trace = Trace::of(&frame);
        let id = frame.stream_id();
        if self.mqtt.owns(id) {
            self.on_mqtt(cx, trace, frame);
        } else if self.messages.owns(id) {
            self.on_kafka(cx, trace, frame, false);
        } else if self.retained.as_ref().map(|r| r.owns(id)).unwrap_or(false) {
            self.on_kafka(cx, trace, frame, true);
        }
    }

    fn on_mqtt(&mut self, cx: &mut Cx<'_>, trace: Trace, frame: Frame) {
        match frame {
            Frame::Data(data) => self.on_mqtt_data(cx, trace, data),
            Frame::End(_) => {
                self.mqtt.on_end();
                self.messages.do_end(cx.engine, trace);
                if let Some(retained) = self.retained.as_mut() {
                    retained.do_end(cx.engine, trace);
                }
            }
            Frame::Abort(_) => {
                self.mqtt.on_abort();
                self.messages.do_abort(cx.engine, trace);
                if let Some(retained) = self.retained.as_mut() {
                    retained.do_abort(cx.engine, trace);
                }
            }
            Frame::Window(window) => {
                self.mqtt.on_window(&window);
                self.messages.do_mirror(cx.engine, trace, &self.mqtt.reply);
                if let Some(retained) = self.retained.as_mut() {
                    retained.do_mirror(cx.engine, trace, &self.mqtt.reply);
                }
            }
            Frame::Reset(_) => {
                self.mqtt.on_reset();
                self.messages.do_reset(cx.engine, trace);
                if let Some(retained) = self.retained.as_mut() {
                    retained.do_reset(cx.engine, trace);
                }
            }
            other => log::debug!("{} publish {} ignoring mqtt {}", self.client_id, self.topic, other.name()),
        }
    }

    fn on_mqtt_data(&mut self, cx: &mut Cx<'_>, trace: Trace, data: Data) {
        if !self.mqtt.on_data(&data) {
            log::warn!("{} publish {} window exceeded", self.client_id, self.topic);
            return self.violation(cx, trace);
        }

        let ex = match data.extension {
            Some(DataEx::Mqtt(MqttDataEx::Publish(ex))) => {
                self.retaining = ex.flags.contains(PublishFlags::RETAIN);
                let headers = produce_headers(&self.topic, &self.client_id, ex.qos, &ex.properties);
                Some(KafkaDataEx::MergedProduce(MergedProduceDataEx {
                    deferred: ex.deferred,
                    timestamp: cx.now(),
                    partition: KafkaOffset::new(PARTITION_ANY, OFFSET_LIVE),
                    key: Some(Bytes::copy_from_slice(self.topic.as_bytes())),
                    hash_key: None,
                    headers,
                }))
            }
            None if !data.is_init() => None,
            _ => {
                log::error!("{} publish {} {}", self.client_id, self.topic, ProxyError::UnexpectedExtension("publish"));
                return self.violation(cx, trace);
            }
        };

        let retaining = self.retaining && self.retained.is_some();
        let fits_retained =
            !retaining || self.retained.as_ref().map(|r| r.can_send(data.reserved)).unwrap_or(false);
        if !self.messages.can_send(data.reserved) || !fits_retained {
            let e = ProxyError::FlowControl(self.messages.initial_id);
            log::warn!("{} publish {} {}", self.client_id, self.topic, e);
            return self.violation(cx, trace);
        }

        if retaining {
            if let Some(retained) = self.retained.as_mut() {
                retained.do_data(cx.engine, trace, data.flags, data.reserved, data.payload.clone(), ex.clone());
            }
        }
        self.messages.do_data(cx.engine, trace, data.flags, data.reserved, data.payload, ex);
    }

    fn on_kafka(&mut self, cx: &mut Cx<'_>, trace: Trace, frame: Frame, retained: bool) {
        let kafka = if retained {
            match self.retained.as_mut() {
                Some(r) => r,
                None => return,
            }
        } else {
            &mut self.messages
        };
        match frame {
            Frame::Begin(begin) => {
                kafka.on_begin(&begin);
                if !retained {
                    self.mqtt.do_begin(cx.engine, trace, None);
                }
            }
            Frame::Data(data) => {
                // produce-only streams carry no reply records
                if !kafka.on_data(&data) {
                    log::warn!("{} publish {} kafka reply window exceeded", self.client_id, self.topic);
                    return self.violation(cx, trace);
                }
                kafka.do_mirror(cx.engine, trace, &self.mqtt.reply);
            }
            Frame::Window(window) => {
                kafka.on_window(&window);
                self.mirror_initial(cx, trace);
            }
            Frame::End(_) => {
                kafka.on_end();
                if !retained {
                    self.mqtt.do_end(cx.engine, trace);
                }
            }
            Frame::Abort(_) => {
                kafka.on_abort();
                if !retained {
                    self.mqtt.do_abort(cx.engine, trace);
                }
            }
            Frame::Reset(_) => {
                kafka.on_reset();
                self.mqtt.do_reset(cx.engine, trace, None);
                if retained {
                    self.messages.do_abort(cx.engine, trace);
                } else if let Some(r) = self.retained.as_mut() {
                    r.do_abort(cx.engine, trace);
                }
            }
            other => log::debug!("{} publish {} ignoring kafka {}", self.client_id, self.topic, other.name()),
        }
    }

    /// Offer the client the tightest of the backend windows once every leg has one.
    fn mirror_initial(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        if !self.messages.state.initial_opened() {
            return;
        }
        let flow = match self.retained.as_ref() {
            Some(r) if !r.state.initial_opened() => return,
            Some(r) => self.messages.initial.narrower(&r.initial),
            None => self.messages.initial,
        };
        self.mqtt.do_mirror(cx.engine, trace, &flow, 0);
    }

    fn violation(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        cx.stats.flow_violations.inc();
        self.mqtt.do_reset(cx.engine, trace, None);
        self.mqtt.do_abort(cx.engine, trace);
        self.messages.do_cleanup(cx.engine, trace);
        if let Some(retained) = self.retained.as_mut() {
            retained.do_cleanup(cx.engine, trace);
        }
    }
}
