//! Stream factory: owns the bindings, the proxies created for them and the
//! stream-id routing table of one shard.

use std::sync::Arc;

use ahash::HashMap;
use bytestring::ByteString;

use rmqtt_kafka_codec::frame::{Begin, BeginEx, Frame};
use rmqtt_kafka_codec::mqtt::MqttBeginEx;
use rmqtt_kafka_conf::{BindingConfig, PoolConfig};

use crate::bootstrap::Bootstrap;
use crate::context::{generate_id, Cx, EngineContext, InstanceId, Owner, Routes};
use crate::error::ProxyError;
use crate::pool::BufferPool;
use crate::publish::PublishProxy;
use crate::reconnect::{ErrorClassifier, KafkaErrorClassifier};
use crate::session::SessionProxy;
use crate::signal::{SignalFanout, CONNECT_BOOTSTRAP};
use crate::stats::Stats;
use crate::stream::reject;
use crate::subscribe::SubscribeProxy;

struct Binding {
    config: BindingConfig,
    /// identifies this shard's sessions in `#migrate` records
    session_id: ByteString,
    classifier: Arc<dyn ErrorClassifier>,
    fanout: Option<SignalFanout>,
    bootstrap: Option<Bootstrap>,
}

struct Shared {
    routes: Routes,
    pool: BufferPool,
    stats: Arc<Stats>,
    instance: InstanceId,
}

impl Shared {
    #[inline]
    fn cx<'a>(&'a mut self, engine: &'a mut dyn EngineContext) -> Cx<'a> {
        Cx { engine, routes: &mut self.routes, pool: &mut self.pool, stats: &self.stats, instance: &self.instance }
    }
}

pub struct MqttKafkaFactory {
    bindings: HashMap<u64, Binding>,
    shared: Shared,
    publishes: HashMap<u64, PublishProxy>,
    subscribes: HashMap<u64, SubscribeProxy>,
    sessions: HashMap<u64, SessionProxy>,
}

impl MqttKafkaFactory {
    pub fn new(pool: &PoolConfig, instance: InstanceId, stats: Arc<Stats>) -> Self {
        Self {
            bindings: HashMap::default(),
            shared: Shared {
                routes: Routes::default(),
                pool: BufferPool::new(pool.slot_count, pool.slot_capacity.as_usize()),
                stats,
                instance,
            },
            publishes: HashMap::default(),
            subscribes: HashMap::default(),
            sessions: HashMap::default(),
        }
    }

    #[inline]
    pub fn stats(&self) -> &Arc<Stats> {
        &self.shared.stats
    }

    #[inline]
    pub fn instance(&self) -> &InstanceId {
        &self.shared.instance
    }

    /// Streams currently routed to a proxy or an internal stream.
    #[inline]
    pub fn routed(&self) -> usize {
        self.shared.routes.len()
    }

    #[inline]
    pub fn is_routed(&self, stream_id: u64) -> bool {
        self.shared.routes.owner(stream_id).is_some()
    }

    #[inline]
    pub fn proxies(&self) -> usize {
        self.publishes.len() + self.subscribes.len() + self.sessions.len()
    }

    pub fn attach(&mut self, config: BindingConfig) -> Result<(), ProxyError> {
        if config.default_route().is_none() {
            return Err(ProxyError::NoRoute(format!("binding {}", config.id)));
        }
        let classifier: Arc<dyn ErrorClassifier> =
            Arc::new(KafkaErrorClassifier::new(config.options.transient_error_codes.clone()));
        log::info!("binding {} attached", config.id);
        self.bindings.insert(
            config.id,
            Binding { config, session_id: generate_id(), classifier, fanout: None, bootstrap: None },
        );
        Ok(())
    }

    /// Start the binding's internal streams, owned by core 0 only.
    pub fn on_attached(&mut self, engine: &mut dyn EngineContext, binding_id: u64) {
        if engine.core_index() != 0 {
            return;
        }
        let Some(binding) = self.bindings.get_mut(&binding_id) else {
            log::warn!("{}", ProxyError::UnknownBinding(binding_id));
            return;
        };
        let Some(route_id) = binding.config.default_route().map(|r| r.id) else {
            return;
        };
        let mut cx = self.shared.cx(engine);
        let mut fanout = SignalFanout::new(&binding.config, route_id, binding.classifier.clone());
        fanout.connect(&mut cx, &binding.config);
        binding.fanout = Some(fanout);
        if binding.config.options.bootstrap {
            let mut bootstrap = Bootstrap::new(&binding.config, route_id, binding.classifier.clone());
            bootstrap.connect(&mut cx);
            binding.bootstrap = Some(bootstrap);
        }
    }

    pub fn detach(&mut self, engine: &mut dyn EngineContext, binding_id: u64) {
        let Some(binding) = self.bindings.get_mut(&binding_id) else {
            return;
        };
        let mut cx = self.shared.cx(engine);
        if let Some(mut fanout) = binding.fanout.take() {
            fanout.detach(&mut cx);
            cx.routes.release(Owner::Signal(binding_id));
        }
        if let Some(mut bootstrap) = binding.bootstrap.take() {
            bootstrap.detach(&mut cx);
            cx.routes.release(Owner::Bootstrap(binding_id));
        }
    }

    pub fn on_detached(&mut self, binding_id: u64) {
        if self.bindings.remove(&binding_id).is_some() {
            log::info!("binding {} detached", binding_id);
        }
    }

    /// Create the proxy for an MQTT stream, refusing it on error.
    pub fn new_stream(&mut self, engine: &mut dyn EngineContext, begin: Begin) -> Result<(), ProxyError> {
        let result = self.create(engine, &begin);
        if let Err(e) = result.as_ref() {
            log::warn!("stream {} of binding {} refused, {}", begin.header.stream_id, begin.header.routed_id, e);
            reject(engine, &begin);
        }
        result
    }

    fn create(&mut self, engine: &mut dyn EngineContext, begin: &Begin) -> Result<(), ProxyError> {
        let binding_id = begin.header.routed_id;
        let binding = self.bindings.get(&binding_id).ok_or(ProxyError::UnknownBinding(binding_id))?;
        let ex = match begin.extension.as_ref() {
            Some(BeginEx::Mqtt(ex)) => ex.clone(),
            _ => return Err(ProxyError::UnexpectedExtension("mqtt begin")),
        };
        let mut cx = self.shared.cx(engine);
        let stream_id = begin.header.stream_id;
        match ex {
            MqttBeginEx::Publish(ex) => {
                let proxy = PublishProxy::new(&mut cx, &binding.config, begin, ex)?;
                self.publishes.insert(stream_id, proxy);
            }
            MqttBeginEx::Subscribe(ex) => {
                let proxy = SubscribeProxy::new(&mut cx, &binding.config, begin, ex)?;
                self.subscribes.insert(stream_id, proxy);
            }
            MqttBeginEx::Session(ex) => {
                let proxy = SessionProxy::new(&mut cx, &binding.config, &binding.session_id, begin, ex)?;
                self.sessions.insert(stream_id, proxy);
            }
        }
        Ok(())
    }

    pub fn on_frame(&mut self, engine: &mut dyn EngineContext, frame: Frame) {
        let stream_id = frame.stream_id();
        let Some(owner) = self.shared.routes.owner(stream_id) else {
            log::debug!("dropping {} for unknown stream {}", frame.name(), stream_id);
            return;
        };
        let mut cx = self.shared.cx(engine);
        match owner {
            Owner::Publish(id) => {
                if let Some(proxy) = self.publishes.get_mut(&id) {
                    proxy.on_frame(&mut cx, frame);
                    if proxy.is_closed() {
                        proxy.cleanup(&mut cx);
                        self.publishes.remove(&id);
                        cx.routes.release(owner);
                    }
                }
            }
            Owner::Subscribe(id) => {
                if let Some(proxy) = self.subscribes.get_mut(&id) {
                    proxy.on_frame(&mut cx, frame);
                    if proxy.is_closed() {
                        proxy.cleanup(&mut cx);
                        self.subscribes.remove(&id);
                        cx.routes.release(owner);
                    }
                }
            }
            Owner::Session(id) => {
                if let Some(proxy) = self.sessions.get_mut(&id) {
                    proxy.on_frame(&mut cx, frame);
                    if proxy.is_closed() {
                        proxy.cleanup(&mut cx);
                        self.sessions.remove(&id);
                        cx.routes.release(owner);
                    }
                }
            }
            Owner::Signal(binding_id) => {
                if let Some(binding) = self.bindings.get_mut(&binding_id) {
                    if let Some(fanout) = binding.fanout.as_mut() {
                        fanout.on_frame(&mut cx, &binding.config, frame);
                    }
                }
            }
            Owner::Bootstrap(binding_id) => {
                if let Some(binding) = self.bindings.get_mut(&binding_id) {
                    if let Some(bootstrap) = binding.bootstrap.as_mut() {
                        bootstrap.on_frame(&mut cx, binding.config.options.reply_window, frame);
                    }
                }
            }
        }
    }

    /// Timer callback scheduled through `EngineContext::signal_at`.
    pub fn on_signal(&mut self, engine: &mut dyn EngineContext, binding_id: u64, signal_id: i32, context: u32) {
        let Some(binding) = self.bindings.get_mut(&binding_id) else {
            log::debug!("signal {} for detached binding {}", signal_id, binding_id);
            return;
        };
        let mut cx = self.shared.cx(engine);
        if signal_id == CONNECT_BOOTSTRAP {
            if let Some(bootstrap) = binding.bootstrap.as_mut() {
                bootstrap.on_signal(&mut cx, context);
            }
        } else if let Some(fanout) = binding.fanout.as_mut() {
            fanout.on_signal(&mut cx, &binding.config, signal_id, context);
        }
    }

    #[cfg(test)]
    /// Phase of the session proxy created for MQTT stream `stream_id`.
    pub(crate) fn session_phase(&self, stream_id: u64) -> Option<crate::session::PhaseKind> {
        self.sessions.get(&stream_id).map(|s| s.phase())
    }

    #[cfg(test)]
    pub(crate) fn fanout(&self, binding_id: u64) -> Option<&SignalFanout> {
        self.bindings.get(&binding_id).and_then(|b| b.fanout.as_ref())
    }

    #[cfg(test)]
    pub(crate) fn bootstrap(&self, binding_id: u64) -> Option<&Bootstrap> {
        self.bindings.get(&binding_id).and_then(|b| b.bootstrap.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use rmqtt_kafka_codec::frame::FrameHeader;
    use rmqtt_kafka_codec::mqtt::{PublishBeginEx, PublishFlags, QoS};
    use rmqtt_kafka_conf::{Options, PoolConfig, RouteConfig};

    use super::*;
    use crate::testing::{binding, find, kafka_begins, Harness, TestEngine, BINDING_ID};

    fn publish() -> MqttBeginEx {
        MqttBeginEx::Publish(PublishBeginEx {
            client_id: "dev0".into(),
            topic: "sensors/one".into(),
            flags: PublishFlags::empty(),
            qos: QoS::AtMostOnce,
        })
    }

    #[test]
    fn test_attach_requires_default_route() {
        let mut factory = MqttKafkaFactory::new(&PoolConfig::default(), InstanceId::new(), Arc::new(Stats::new()));
        let config = BindingConfig {
            id: 7,
            options: Options::default(),
            routes: vec![RouteConfig { id: 3, when: vec!["a/#".into()], with: Some("a".into()) }],
        };
        assert!(matches!(factory.attach(config), Err(ProxyError::NoRoute(_))));
        let mut engine = TestEngine::new(0);
        factory.on_attached(&mut engine, 7);
        assert!(engine.frames.is_empty());
    }

    #[test]
    fn test_unknown_binding() {
        let mut h = Harness::new(1);
        h.open(101, publish());
        let frames = h.take();
        assert_eq!(frames.len(), 1);
        assert!(find(&frames, "RESET", 101).is_some());
        assert_eq!(h.factory.proxies(), 0);
    }

    #[test]
    fn test_unexpected_extension() {
        let mut h = Harness::new(1);
        h.attach(binding());
        let begin = Begin { header: FrameHeader::new(BINDING_ID, BINDING_ID, 101), affinity: 0, extension: None };
        let result = h.factory.new_stream(&mut h.engine, begin);
        assert!(matches!(result, Err(ProxyError::UnexpectedExtension(_))));
        assert!(find(&h.take(), "RESET", 101).is_some());
    }

    #[test]
    fn test_proxy_removed_when_closed() {
        let mut h = Harness::new(1);
        h.attach(binding());
        h.open(101, publish());
        let kafka = kafka_begins(&h.take())[0].0;
        assert_eq!(h.factory.proxies(), 1);
        assert!(h.factory.is_routed(101) && h.factory.is_routed(kafka));

        h.begin(kafka - 1);
        h.window(kafka, 0, 65536, 0);
        h.end(101);
        h.end(kafka - 1);
        assert_eq!(h.factory.proxies(), 0);
        assert_eq!(h.factory.routed(), 0);

        // late frames for the closed streams are dropped
        h.take();
        h.window(kafka, 0, 1024, 0);
        assert!(h.take().is_empty());
    }

    #[test]
    fn test_detach() {
        let mut h = Harness::new(0);
        h.attach(binding());
        h.factory.detach(&mut h.engine, BINDING_ID);
        h.factory.on_detached(BINDING_ID);
        assert_eq!(h.factory.routed(), 0);
        assert!(h.factory.fanout(BINDING_ID).is_none());

        h.take();
        h.open(101, publish());
        assert!(find(&h.take(), "RESET", 101).is_some());
    }
}
