//! Per-binding consumer of will and expiry signals.
//!
//! A single merged stream over the sessions topic (opened on core 0) feeds
//! will-signals and expiry-signals into timers. Wills due for delivery are
//! fetched into a pool slot and produced once their timer fires; expired
//! sessions get their state tombstoned.

mod will;

use std::sync::Arc;

use ahash::HashMap;
use bytes::Bytes;
use itertools::Itertools;

use rmqtt_kafka_codec::frame::{DataEx, FlushEx, Frame, ResetEx};
use rmqtt_kafka_codec::kafka::{
    KafkaBeginEx, KafkaCapabilities, KafkaDataEx, KafkaFlushEx, MergedFetchDataEx, OFFSET_HISTORICAL,
};
use rmqtt_kafka_codec::signal::{ExpirySignal, WillSignal, UNKNOWN};
use rmqtt_kafka_codec::Decode;
use rmqtt_kafka_conf::BindingConfig;
use rmqtt_kafka_utils::TimestampMillis;

use crate::context::{Cx, Owner, TimerId, Trace};
use crate::keys::{
    parse_signal_key, type_filter, type_header, ClientId, SignalKey, HEADER_TYPE, TYPE_EXPIRY_SIGNAL,
    TYPE_WILL_SIGNAL,
};
use crate::reconnect::{ErrorClassifier, ReconnectBackoff};
use crate::stream::{merged_begin, KafkaStream};

use self::will::{WillDelivery, WillEvent};

pub const DELIVER_WILL: i32 = 1;
pub const CONNECT_WILL_STREAM: i32 = 2;
pub const EXPIRE_SESSION: i32 = 3;
pub const CONNECT_BOOTSTRAP: i32 = 4;

/// Hands out the `u32` timer contexts that identify a client.
#[derive(Debug, Default)]
pub(crate) struct CorrelationIds {
    next: u32,
    ids: HashMap<u32, ClientId>,
}

impl CorrelationIds {
    pub fn supply(&mut self, client_id: ClientId) -> u32 {
        loop {
            self.next = self.next.wrapping_add(1);
            if self.next != 0 && !self.ids.contains_key(&self.next) {
                break;
            }
        }
        self.ids.insert(self.next, client_id);
        self.next
    }

    #[inline]
    pub fn get(&self, id: u32) -> Option<&ClientId> {
        self.ids.get(&id)
    }

    #[inline]
    pub fn release(&mut self, id: u32) -> Option<ClientId> {
        self.ids.remove(&id)
    }

    #[cfg(test)]
    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

#[derive(Debug)]
struct Expiry {
    timer: TimerId,
    correlation: u32,
}

pub(crate) struct SignalFanout {
    binding_id: u64,
    route_id: u64,
    stream: Option<KafkaStream>,
    classifier: Arc<dyn ErrorClassifier>,
    backoff: ReconnectBackoff,
    reconnect_timer: Option<TimerId>,
    partitions: Vec<i32>,
    correlations: CorrelationIds,
    wills: HashMap<ClientId, WillDelivery>,
    expiries: HashMap<ClientId, Expiry>,
    // will delivery stream id -> client
    delivering: HashMap<u64, ClientId>,
}

impl SignalFanout {
    pub fn new(binding: &BindingConfig, route_id: u64, classifier: Arc<dyn ErrorClassifier>) -> Self {
        Self {
            binding_id: binding.id,
            route_id,
            stream: None,
            classifier,
            backoff: ReconnectBackoff::new(binding.options.reconnect_delay),
            reconnect_timer: None,
            partitions: Vec::new(),
            correlations: CorrelationIds::default(),
            wills: HashMap::default(),
            expiries: HashMap::default(),
            delivering: HashMap::default(),
        }
    }

    #[cfg(test)]
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.stream.as_ref().map(|s| !s.is_closed()).unwrap_or(false)
    }

    #[cfg(test)]
    #[inline]
    pub fn pending_wills(&self) -> usize {
        self.wills.len()
    }

    #[cfg(test)]
    #[inline]
    pub fn pending_expiries(&self) -> usize {
        self.expiries.len()
    }

    pub fn connect(&mut self, cx: &mut Cx<'_>, binding: &BindingConfig) {
        let trace = cx.trace();
        let options = &binding.options;
        let mut ex = merged_begin(
            KafkaCapabilities::ProduceAndFetch,
            &options.topics.sessions,
            OFFSET_HISTORICAL,
            vec![type_filter(TYPE_WILL_SIGNAL), type_filter(TYPE_EXPIRY_SIGNAL)],
        );
        // each client's signals are handled by the instance assigned its partition
        if let KafkaBeginEx::Merged(merged) = &mut ex {
            merged.group_id = Some(options.signal_group.as_str().into());
        }
        let mut stream = KafkaStream::new(cx, self.binding_id, self.route_id, Owner::Signal(self.binding_id));
        stream.do_begin(cx.engine, trace, 0, ex);
        log::debug!(
            "binding {} connecting signal stream {} in group {}",
            self.binding_id,
            stream.initial_id,
            options.signal_group
        );
        self.stream = Some(stream);
    }

    pub fn on_frame(&mut self, cx: &mut Cx<'_>, binding: &BindingConfig, frame: Frame) {
        let id = frame.stream_id();
        if self.stream.as_ref().map(|s| s.owns(id)).unwrap_or(false) {
            self.on_stream(cx, binding, frame);
        } else if let Some(client_id) = self.delivering.get(&id).cloned() {
            self.on_delivery(cx, binding, client_id, frame);
        } else {
            log::debug!("binding {} dropping {} for unknown signal stream {}", self.binding_id, frame.name(), id);
        }
    }

    pub fn on_signal(&mut self, cx: &mut Cx<'_>, binding: &BindingConfig, signal_id: i32, context: u32) {
        match signal_id {
            CONNECT_WILL_STREAM => {
                self.reconnect_timer = None;
                self.connect(cx, binding);
            }
            DELIVER_WILL => self.on_deliver(cx, binding, context),
            EXPIRE_SESSION => self.on_expire(cx, context),
            _ => log::warn!("binding {} unexpected signal {}", self.binding_id, signal_id),
        }
    }

    /// End the stream and forget every pending will and expiry.
    pub fn detach(&mut self, cx: &mut Cx<'_>) {
        let trace = cx.trace();
        if let Some(mut stream) = self.stream.take() {
            stream.do_end(cx.engine, trace);
            stream.do_reset(cx.engine, trace);
            cx.routes.unroute(stream.initial_id, stream.reply_id);
        }
        self.clear(cx, false);
    }

    fn clear(&mut self, cx: &mut Cx<'_>, abort: bool) {
        if let Some(timer) = self.reconnect_timer.take() {
            cx.engine.cancel(timer);
        }
        for (_, mut delivery) in self.wills.drain() {
            delivery.close(cx, abort);
        }
        for (_, expiry) in self.expiries.drain() {
            cx.engine.cancel(expiry.timer);
        }
        self.delivering.clear();
        self.correlations = CorrelationIds::default();
    }

    fn on_stream(&mut self, cx: &mut Cx<'_>, binding: &BindingConfig, frame: Frame) {
        let trace = Trace::of(&frame);
        let window = binding.options.reply_window;
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match frame {
            Frame::Begin(begin) => {
                stream.on_begin(&begin);
                stream.do_grant(cx.engine, trace, window);
                self.backoff.reset();
                log::info!("binding {} signal stream connected", self.binding_id);
            }
            Frame::Data(data) => {
                if !stream.on_data(&data) {
                    log::warn!("binding {} signal stream window exceeded", self.binding_id);
                    cx.stats.flow_violations.inc();
                    return self.reconnect(cx, trace);
                }
                stream.do_grant(cx.engine, trace, window);
                if let Some(DataEx::Kafka(KafkaDataEx::MergedFetch(fetch))) = data.extension {
                    self.on_record(cx, binding, fetch, data.payload);
                }
            }
            Frame::Flush(flush) => {
                if !stream.on_flush(&flush) {
                    cx.stats.flow_violations.inc();
                    return self.reconnect(cx, trace);
                }
                stream.do_grant(cx.engine, trace, window);
                if let Some(FlushEx::Kafka(KafkaFlushEx::Merged { progress, .. })) = flush.extension {
                    self.on_partitions(cx, progress.iter().map(|p| p.partition_id).sorted().dedup().collect());
                }
            }
            Frame::Window(window) => {
                stream.on_window(&window);
            }
            Frame::End(_) | Frame::Abort(_) => {
                stream.on_end();
                log::warn!("binding {} signal stream closed by kafka", self.binding_id);
                self.reconnect(cx, trace);
            }
            Frame::Reset(reset) => {
                stream.on_reset();
                let error = match reset.extension {
                    Some(ResetEx::Kafka(ex)) => ex.error,
                    _ => 0,
                };
                if self.classifier.is_transient(error) {
                    log::warn!("binding {} signal stream reset, error {}, reconnecting", self.binding_id, error);
                    self.reconnect(cx, trace);
                } else {
                    log::error!("binding {} signal stream failed, error {}", self.binding_id, error);
                    if let Some(mut stream) = self.stream.take() {
                        stream.do_cleanup(cx.engine, trace);
                        cx.routes.unroute(stream.initial_id, stream.reply_id);
                    }
                    self.clear(cx, true);
                }
            }
        }
    }

    fn reconnect(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        if let Some(mut stream) = self.stream.take() {
            stream.do_cleanup(cx.engine, trace);
            cx.routes.unroute(stream.initial_id, stream.reply_id);
        }
        if self.reconnect_timer.is_some() {
            return;
        }
        let delay = self.backoff.next_delay();
        let at = cx.now() + delay.as_millis() as TimestampMillis;
        self.reconnect_timer = Some(cx.engine.signal_at(at, self.binding_id, CONNECT_WILL_STREAM, 0));
        cx.stats.signal_reconnects.inc();
        log::info!("binding {} signal stream reconnect in {:?}", self.binding_id, delay);
    }

    /// A changed partition assignment means another instance may share our id.
    fn on_partitions(&mut self, cx: &mut Cx<'_>, partitions: Vec<i32>) {
        if partitions.is_empty() {
            return;
        }
        if !self.partitions.is_empty() && self.partitions != partitions {
            let id = cx.instance.regenerate();
            log::info!(
                "binding {} partitions {:?} -> {:?}, instance id now {}",
                self.binding_id,
                self.partitions,
                partitions,
                id
            );
        }
        self.partitions = partitions;
    }

    fn on_record(
        &mut self,
        cx: &mut Cx<'_>,
        binding: &BindingConfig,
        fetch: MergedFetchDataEx,
        payload: Option<Bytes>,
    ) {
        let Some(payload) = payload else {
            match fetch.key.as_deref().and_then(parse_signal_key) {
                Some(SignalKey::Will(client_id)) => {
                    if self.cancel_will(cx, &client_id) {
                        log::debug!("{} will cancelled", client_id);
                    }
                }
                Some(SignalKey::Expiry(client_id)) => {
                    if self.cancel_expiry(cx, &client_id) {
                        log::debug!("{} expiry cancelled", client_id);
                    }
                }
                None => {}
            }
            return;
        };

        match fetch.header(HEADER_TYPE.as_bytes()).map(|t| t.as_ref()) {
            Some(t) if t == TYPE_WILL_SIGNAL.as_bytes() => match WillSignal::decode_from(payload) {
                Ok(signal) => self.on_will_signal(cx, binding, signal),
                Err(e) => log::warn!("binding {} skipping invalid will-signal, {}", self.binding_id, e),
            },
            Some(t) if t == TYPE_EXPIRY_SIGNAL.as_bytes() => match ExpirySignal::decode_from(payload) {
                Ok(signal) => self.on_expiry_signal(cx, signal),
                Err(e) => log::warn!("binding {} skipping invalid expiry-signal, {}", self.binding_id, e),
            },
            t => log::debug!("binding {} ignoring record of type {:?}", self.binding_id, t),
        }
    }

    /// Concrete deadline of a signal, None when the owning session is still
    /// connected to this instance.
    fn deadline(&self, cx: &Cx<'_>, at: TimestampMillis, delay: i32, instance_id: &str) -> Option<TimestampMillis> {
        if at != UNKNOWN {
            Some(at)
        } else if *cx.instance.get() == *instance_id {
            None
        } else {
            Some(cx.now() + delay as TimestampMillis)
        }
    }

    fn on_will_signal(&mut self, cx: &mut Cx<'_>, binding: &BindingConfig, signal: WillSignal) {
        let client_id = ClientId::new(signal.client_id.clone());
        self.cancel_will(cx, &client_id);
        let Some(deliver_at) = self.deadline(cx, signal.deliver_at, signal.delay, &signal.instance_id) else {
            log::debug!("{} will {} held by this instance", client_id, signal.will_id);
            return;
        };

        let correlation = self.correlations.supply(client_id.clone());
        let mut delivery = WillDelivery::open(cx, binding, self.route_id, client_id.clone(), signal, correlation);
        delivery.timer = Some(cx.engine.signal_at(deliver_at, self.binding_id, DELIVER_WILL, correlation));
        for (initial_id, reply_id) in delivery.stream_ids() {
            self.delivering.insert(initial_id, client_id.clone());
            self.delivering.insert(reply_id, client_id.clone());
        }
        log::debug!("{} will {} due at {}", client_id, delivery.signal.will_id, deliver_at);
        self.wills.insert(client_id, delivery);
    }

    fn on_expiry_signal(&mut self, cx: &mut Cx<'_>, signal: ExpirySignal) {
        let client_id = ClientId::new(signal.client_id.clone());
        self.cancel_expiry(cx, &client_id);
        let Some(expire_at) = self.deadline(cx, signal.expire_at, signal.delay, &signal.instance_id) else {
            log::debug!("{} session held by this instance", client_id);
            return;
        };
        let correlation = self.correlations.supply(client_id.clone());
        let timer = cx.engine.signal_at(expire_at, self.binding_id, EXPIRE_SESSION, correlation);
        log::debug!("{} session expires at {}", client_id, expire_at);
        self.expiries.insert(client_id, Expiry { timer, correlation });
    }

    fn cancel_will(&mut self, cx: &mut Cx<'_>, client_id: &ClientId) -> bool {
        match self.wills.remove(client_id) {
            Some(mut delivery) => {
                self.forget(&delivery);
                delivery.close(cx, true);
                true
            }
            None => false,
        }
    }

    fn cancel_expiry(&mut self, cx: &mut Cx<'_>, client_id: &ClientId) -> bool {
        match self.expiries.remove(client_id) {
            Some(expiry) => {
                cx.engine.cancel(expiry.timer);
                self.correlations.release(expiry.correlation);
                true
            }
            None => false,
        }
    }

    fn forget(&mut self, delivery: &WillDelivery) {
        for (initial_id, reply_id) in delivery.stream_ids() {
            self.delivering.remove(&initial_id);
            self.delivering.remove(&reply_id);
        }
        self.correlations.release(delivery.correlation);
    }

    fn on_deliver(&mut self, cx: &mut Cx<'_>, binding: &BindingConfig, correlation: u32) {
        let Some(client_id) = self.correlations.get(correlation).cloned() else {
            return;
        };
        let Some(delivery) = self.wills.get_mut(&client_id) else {
            return;
        };
        delivery.timer = None;
        delivery.due = true;
        if delivery.is_fetched() {
            self.start(cx, binding, client_id);
        } else {
            log::debug!("{} will due before its payload was fetched", client_id);
        }
    }

    fn start(&mut self, cx: &mut Cx<'_>, binding: &BindingConfig, client_id: ClientId) {
        let Some(delivery) = self.wills.get_mut(&client_id) else {
            return;
        };
        match delivery.start(cx, binding) {
            Ok(()) => {
                for (initial_id, reply_id) in delivery.stream_ids() {
                    self.delivering.insert(initial_id, client_id.clone());
                    self.delivering.insert(reply_id, client_id.clone());
                }
            }
            Err(e) => {
                log::warn!("{} will not delivered, {}", client_id, e);
                self.cancel_will(cx, &client_id);
            }
        }
    }

    fn on_delivery(&mut self, cx: &mut Cx<'_>, binding: &BindingConfig, client_id: ClientId, frame: Frame) {
        let Some(delivery) = self.wills.get_mut(&client_id) else {
            return;
        };
        match delivery.on_frame(cx, binding.options.reply_window, frame) {
            WillEvent::None => {}
            WillEvent::Fetched => {
                if delivery.due {
                    self.start(cx, binding, client_id);
                }
            }
            WillEvent::Delivered => self.delivered(cx, client_id),
            WillEvent::Failed => {
                self.cancel_will(cx, &client_id);
            }
        }
    }

    /// Tombstone the will and its signal once every produce acknowledged.
    fn delivered(&mut self, cx: &mut Cx<'_>, client_id: ClientId) {
        let Some(mut delivery) = self.wills.remove(&client_id) else {
            return;
        };
        let trace = cx.trace();
        let now = cx.now();
        let will_key = client_id.will_key(&delivery.signal.lifetime_id);
        match self.stream.as_mut() {
            Some(stream) if stream.can_send(stream.initial.reserved(0) * 2) => {
                stream.do_produce(cx.engine, trace, now, will_key, None, vec![]);
                stream.do_produce(
                    cx.engine,
                    trace,
                    now,
                    client_id.will_signal_key(),
                    None,
                    vec![type_header(TYPE_WILL_SIGNAL)],
                );
            }
            _ => log::warn!("{} will delivered, tombstones dropped", client_id),
        }
        self.forget(&delivery);
        delivery.close(cx, false);
        cx.stats.wills_delivered.inc();
        log::info!("{} will {} delivered", client_id, delivery.signal.will_id);
    }

    fn on_expire(&mut self, cx: &mut Cx<'_>, correlation: u32) {
        let Some(client_id) = self.correlations.release(correlation) else {
            return;
        };
        if self.expiries.remove(&client_id).is_none() {
            return;
        }
        let trace = cx.trace();
        let now = cx.now();
        match self.stream.as_mut() {
            Some(stream) if stream.can_send(stream.initial.reserved(0) * 2) => {
                stream.do_produce(cx.engine, trace, now, client_id.state_key(), None, vec![]);
                stream.do_produce(
                    cx.engine,
                    trace,
                    now,
                    client_id.expiry_signal_key(),
                    None,
                    vec![type_header(TYPE_EXPIRY_SIGNAL)],
                );
                cx.stats.sessions_expired.inc();
                log::info!("{} session expired", client_id);
            }
            _ => log::warn!("{} session expired, tombstones dropped", client_id),
        }
    }
}
