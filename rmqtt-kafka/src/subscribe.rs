//! MQTT subscribe stream onto a filtered Kafka fetch.
//!
//! Filter `n` of the fetch is the compiled MQTT filter `n`, so the bitmask
//! on each fetched record maps straight back to subscription ids.

use bytestring::ByteString;

use rmqtt_kafka_codec::frame::{Begin, Data, DataEx, Flush, FlushEx, Frame};
use rmqtt_kafka_codec::kafka::{KafkaCapabilities, KafkaDataEx, KafkaFilter, KafkaFlushEx, OFFSET_LIVE};
use rmqtt_kafka_codec::mqtt::{MqttDataEx, MqttFlushEx, QoS, SubscribeBeginEx, SubscribeDataEx, TopicFilter};
use rmqtt_kafka_conf::{BindingConfig, Capabilities};

use crate::context::{Cx, Owner, Trace};
use crate::error::ProxyError;
use crate::message::{fetched_properties, subscription_ids};
use crate::stream::{merged_begin, KafkaStream, MqttStream};
use crate::topic::{compile_filter, resolve, Topic};

pub(crate) struct SubscribeProxy {
    mqtt: MqttStream,
    kafka: KafkaStream,
    client_id: ByteString,
    qos: QoS,
    filters: Vec<TopicFilter>,
    capabilities: Capabilities,
}

/// Compile the filters this binding can serve, dropping the rest.
fn compile(
    filters: Vec<TopicFilter>,
    client_id: &str,
    capabilities: &Capabilities,
) -> Result<(Vec<TopicFilter>, Vec<KafkaFilter>), ProxyError> {
    let mut accepted = Vec::with_capacity(filters.len());
    let mut compiled = Vec::with_capacity(filters.len());
    for f in filters {
        if !capabilities.wildcard_available && f.pattern.parse::<Topic>()?.has_wildcard() {
            log::warn!("{} wildcard subscription {} not available", client_id, f.pattern);
            continue;
        }
        compiled.push(compile_filter(&f, client_id)?);
        accepted.push(f);
    }
    if accepted.len() > 64 {
        log::warn!("{} more than 64 filters, subscription ids past 64 are not reported", client_id);
    }
    Ok((accepted, compiled))
}

impl SubscribeProxy {
    pub fn new(
        cx: &mut Cx<'_>,
        binding: &BindingConfig,
        begin: &Begin,
        ex: SubscribeBeginEx,
    ) -> Result<Self, ProxyError> {
        let route = ex
            .filters
            .first()
            .and_then(|f| resolve(binding, &f.pattern))
            .or_else(|| binding.default_route())
            .ok_or_else(|| ProxyError::NoRoute(ex.client_id.to_string()))?;
        let options = &binding.options;
        let (filters, compiled) = compile(ex.filters, &ex.client_id, &options.capabilities)?;
        let trace = Trace::from(&begin.header);

        let owner = Owner::Subscribe(begin.header.stream_id);
        let mqtt = MqttStream::new(cx, begin, owner);
        let topic = route.with.as_deref().unwrap_or(&options.topics.messages);
        let mut kafka = KafkaStream::new(cx, mqtt.routed_id, route.id, owner);
        kafka.do_begin(
            cx.engine,
            trace,
            mqtt.affinity,
            merged_begin(KafkaCapabilities::FetchOnly, topic, OFFSET_LIVE, compiled),
        );

        log::debug!("{} subscribe {} filters on {}", ex.client_id, filters.len(), topic);
        cx.stats.subscribes.inc();
        Ok(Self {
            mqtt,
            kafka,
            client_id: ex.client_id,
            qos: ex.qos,
            filters,
            capabilities: options.capabilities,
        })
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.mqtt.is_closed()
    }

    pub fn cleanup(&mut self, cx: &mut Cx<'_>) {
        let trace = cx.trace();
        self.kafka.do_cleanup(cx.engine, trace);
        cx.stats.subscribes.dec();
    }

    pub fn on_frame(&mut self, cx: &mut Cx<'_>, frame: Frame) {
        let trace = Trace::of(&frame);
        let id = frame.stream_id();
        if self.mqtt.owns(id) {
            match frame {
                Frame::Flush(flush) => self.on_mqtt_flush(cx, trace, flush),
                Frame::End(_) => {
                    self.mqtt.on_end();
                    self.kafka.do_end(cx.engine, trace);
                }
                Frame::Abort(_) => {
                    self.mqtt.on_abort();
                    self.kafka.do_abort(cx.engine, trace);
                }
                Frame::Window(window) => {
                    self.mqtt.on_window(&window);
                    self.kafka.do_mirror(cx.engine, trace, &self.mqtt.reply);
                }
                Frame::Reset(_) => {
                    self.mqtt.on_reset();
                    self.kafka.do_reset(cx.engine, trace);
                }
                other => log::debug!("{} subscribe ignoring mqtt {}", self.client_id, other.name()),
            }
        } else if self.kafka.owns(id) {
            match frame {
                Frame::Begin(begin) => {
                    self.kafka.on_begin(&begin);
                    self.mqtt.do_begin(cx.engine, trace, None);
                }
                Frame::Data(data) => self.on_kafka_data(cx, trace, data),
                Frame::Flush(flush) => {
                    if !self.kafka.on_flush(&flush) {
                        return self.violation(cx, trace);
                    }
                    self.kafka.do_mirror(cx.engine, trace, &self.mqtt.reply);
                }
                Frame::Window(window) => {
                    self.kafka.on_window(&window);
                    self.mqtt.do_mirror(cx.engine, trace, &self.kafka.initial, 0);
                }
                Frame::End(_) => {
                    self.kafka.on_end();
                    self.mqtt.do_end(cx.engine, trace);
                }
                Frame::Abort(_) => {
                    self.kafka.on_abort();
                    self.mqtt.do_abort(cx.engine, trace);
                }
                Frame::Reset(_) => {
                    self.kafka.on_reset();
                    self.mqtt.do_reset(cx.engine, trace, None);
                }
            }
        }
    }

    /// The client changed its subscriptions, refilter the live fetch.
    fn on_mqtt_flush(&mut self, cx: &mut Cx<'_>, trace: Trace, flush: Flush) {
        if !self.mqtt.on_flush(&flush) {
            return self.violation(cx, trace);
        }
        let filters = match flush.extension {
            Some(FlushEx::Mqtt(MqttFlushEx::Subscribe { filters })) => filters,
            _ => {
                log::error!("{} subscribe {}", self.client_id, ProxyError::UnexpectedExtension("subscribe flush"));
                return self.violation(cx, trace);
            }
        };
        match compile(filters, &self.client_id, &self.capabilities) {
            Ok((filters, compiled)) => {
                log::debug!("{} subscribe refiltered to {} filters", self.client_id, filters.len());
                self.filters = filters;
                if !self.kafka.can_send(flush.reserved) {
                    return self.violation(cx, trace);
                }
                self.kafka.do_flush(
                    cx.engine,
                    trace,
                    flush.reserved,
                    KafkaFlushEx::Merged { progress: vec![], filters: compiled },
                );
            }
            Err(e) => {
                log::error!("{} subscribe {}", self.client_id, e);
                self.violation(cx, trace)
            }
        }
    }

    fn on_kafka_data(&mut self, cx: &mut Cx<'_>, trace: Trace, data: Data) {
        if !self.kafka.on_data(&data) {
            log::warn!("{} subscribe kafka reply window exceeded", self.client_id);
            return self.violation(cx, trace);
        }

        let ex = match data.extension {
            Some(DataEx::Kafka(KafkaDataEx::MergedFetch(f))) => {
                let topic = match f.key.clone().map(ByteString::try_from) {
                    Some(Ok(topic)) => topic,
                    _ => {
                        log::debug!("{} subscribe skipping record without topic key", self.client_id);
                        self.kafka.do_mirror(cx.engine, trace, &self.mqtt.reply);
                        return;
                    }
                };
                let (qos, properties) = fetched_properties(&f.headers);
                let qos = if u8::from(qos) > u8::from(self.qos) { self.qos } else { qos };
                let subscription_ids = if self.capabilities.subscription_ids_available {
                    subscription_ids(&self.filters, f.filters)
                } else {
                    Vec::new()
                };
                Some(MqttDataEx::Subscribe(SubscribeDataEx {
                    deferred: f.deferred,
                    topic,
                    qos,
                    flags: Default::default(),
                    subscription_ids,
                    properties,
                }))
            }
            None if !data.is_init() => None,
            _ => {
                log::error!("{} subscribe {}", self.client_id, ProxyError::UnexpectedExtension("merged fetch"));
                return self.violation(cx, trace);
            }
        };

        if !self.mqtt.can_send(data.reserved) {
            log::warn!("{} subscribe {}", self.client_id, ProxyError::FlowControl(self.mqtt.reply_id));
            return self.violation(cx, trace);
        }
        self.mqtt.do_data(cx.engine, trace, data.flags, data.reserved, data.payload, ex);
    }

    fn violation(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        cx.stats.flow_violations.inc();
        self.mqtt.do_reset(cx.engine, trace, None);
        self.mqtt.do_abort(cx.engine, trace);
        self.kafka.do_cleanup(cx.engine, trace);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use rmqtt_kafka_codec::frame::DATA_FLAG_COMPLETE;
    use rmqtt_kafka_codec::kafka::{KafkaCondition, KafkaOffset, MergedFetchDataEx};
    use rmqtt_kafka_codec::mqtt::{MessageProperties, MqttBeginEx, SubscribeOptions};

    use super::*;
    use crate::message::produce_headers;
    use crate::testing::{binding, find, kafka_begins, Harness};

    const MQTT: u64 = 1001;
    const MQTT_REPLY: u64 = 1000;

    fn filter(id: u32, pattern: &str, options: SubscribeOptions) -> TopicFilter {
        TopicFilter { subscription_id: id, qos: QoS::AtLeastOnce, options, pattern: pattern.into() }
    }

    fn subscribe(filters: Vec<TopicFilter>) -> MqttBeginEx {
        MqttBeginEx::Subscribe(SubscribeBeginEx { client_id: "dev0".into(), qos: QoS::AtLeastOnce, filters })
    }

    fn filters_of(h: &mut Harness) -> (u64, Vec<KafkaFilter>) {
        let begins = kafka_begins(&h.take());
        let (id, ex) = &begins[0];
        let merged = ex.merged().unwrap();
        assert_eq!(merged.capabilities, KafkaCapabilities::FetchOnly);
        assert_eq!(merged.partitions[0].partition_offset, OFFSET_LIVE);
        (*id, merged.filters.clone())
    }

    #[test]
    fn test_subscribe() {
        let mut h = Harness::new(1);
        h.attach(binding());
        h.open(
            MQTT,
            subscribe(vec![
                filter(1, "sensors/+", SubscribeOptions::empty()),
                filter(2, "alerts/#", SubscribeOptions::NO_LOCAL),
            ]),
        );
        let (kafka, filters) = filters_of(&mut h);
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].conditions.len(), 1);
        assert!(matches!(filters[1].conditions[1], KafkaCondition::Not(_)));
        assert_eq!(h.stats().subscribes.count(), 1);

        h.begin(kafka - 1);
        assert!(find(&h.take(), "BEGIN", MQTT_REPLY).is_some());
        h.window(MQTT_REPLY, 0, 8192, 0);
        match find(&h.take(), "WINDOW", kafka - 1) {
            Some(Frame::Window(w)) => assert_eq!(w.header.maximum, 8192),
            other => panic!("unexpected {:?}", other),
        }

        let headers = produce_headers("sensors/1", "dev9", QoS::ExactlyOnce, &MessageProperties::new());
        h.fetched(kafka - 1, 0, Bytes::from_static(b"sensors/1"), Some(Bytes::from_static(b"22.5")), headers);
        match find(&h.take(), "DATA", MQTT_REPLY) {
            Some(Frame::Data(d)) => match &d.extension {
                Some(DataEx::Mqtt(MqttDataEx::Subscribe(ex))) => {
                    assert_eq!(ex.topic, "sensors/1");
                    assert_eq!(ex.qos, QoS::AtLeastOnce);
                    assert_eq!(ex.subscription_ids, vec![1]);
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_skips_record_without_key() {
        let mut h = Harness::new(1);
        h.attach(binding());
        h.open(MQTT, subscribe(vec![filter(1, "sensors/+", SubscribeOptions::empty())]));
        let (kafka, _) = filters_of(&mut h);
        h.begin(kafka - 1);
        h.window(MQTT_REPLY, 0, 8192, 0);
        h.take();

        let ex = MergedFetchDataEx {
            deferred: 0,
            timestamp: 0,
            filters: 1,
            partition: KafkaOffset::new(0, 7),
            progress: vec![],
            key: None,
            headers: vec![],
        };
        h.data(
            kafka - 1,
            DATA_FLAG_COMPLETE,
            Some(Bytes::from_static(b"x")),
            Some(DataEx::Kafka(KafkaDataEx::MergedFetch(ex))),
        );
        let frames = h.take();
        assert!(find(&frames, "DATA", MQTT_REPLY).is_none());
        assert!(find(&frames, "WINDOW", kafka - 1).is_some());
    }

    #[test]
    fn test_subscribe_refilter() {
        let mut h = Harness::new(1);
        h.attach(binding());
        h.open(MQTT, subscribe(vec![filter(1, "sensors/+", SubscribeOptions::empty())]));
        let (kafka, _) = filters_of(&mut h);
        h.begin(kafka - 1);
        h.window(kafka, 0, 4096, 0);
        h.take();

        let filters = vec![
            filter(1, "sensors/+", SubscribeOptions::empty()),
            filter(3, "alerts/fire", SubscribeOptions::empty()),
        ];
        h.flush(MQTT, Some(FlushEx::Mqtt(MqttFlushEx::Subscribe { filters })));
        match find(&h.take(), "FLUSH", kafka) {
            Some(Frame::Flush(f)) => match &f.extension {
                Some(FlushEx::Kafka(KafkaFlushEx::Merged { progress, filters })) => {
                    assert!(progress.is_empty());
                    assert_eq!(filters.len(), 2);
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_without_wildcards() {
        let mut h = Harness::new(1);
        let mut b = binding();
        b.options.capabilities.wildcard_available = false;
        h.attach(b);
        h.open(
            MQTT,
            subscribe(vec![
                filter(1, "sensors/+", SubscribeOptions::empty()),
                filter(2, "alerts/fire", SubscribeOptions::empty()),
            ]),
        );
        let (_, filters) = filters_of(&mut h);
        assert_eq!(filters.len(), 1);
    }

    #[test]
    fn test_subscribe_end() {
        let mut h = Harness::new(1);
        h.attach(binding());
        h.open(MQTT, subscribe(vec![filter(1, "sensors/+", SubscribeOptions::empty())]));
        let (kafka, _) = filters_of(&mut h);
        h.begin(kafka - 1);
        h.end(MQTT);
        assert!(find(&h.take(), "END", kafka).is_some());
        h.end(kafka - 1);
        assert!(find(&h.take(), "END", MQTT_REPLY).is_some());
        assert_eq!(h.factory.proxies(), 0);
        assert_eq!(h.stats().subscribes.count(), 0);
    }
}
