//! Selection and instantiation of the analyzer for a new flow.
//!
//! Candidates are tried in a fixed order of precedence:
//!
//! 1. the analyzer explicitly requested for the flow by the analyzer tree,
//! 2. the analyzer bound to the flow's well-known port (responder port first),
//! 3. the first analyzer, in registration order, whose signature matches the payload prefix.
//!
//! Finding nothing is the normal outcome for most traffic.

use std::sync::Arc;

use nt_analyzer::{Analyzer, AnalyzerTag};
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, warn};

use crate::{
    error::{DispatchError, FactoryFailureSnafu, NotFrozenSnafu, RegistryError, UnknownTagSnafu},
    flow::{Binding, FlowContext},
    registry::{LookupKey, Registry},
};

/// Dispatcher over a frozen registry. Cheap to clone, one per worker.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    /// Create a dispatcher. The registry must have left the load phase.
    pub fn new(registry: Arc<Registry>) -> Result<Self, RegistryError> {
        ensure!(registry.is_frozen(), NotFrozenSnafu);
        Ok(Self { registry })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Choose the analyzer for a flow.
    ///
    /// # Arguments
    ///
    /// * `flow` - The flow context, carrying the explicit request if there is one.
    /// * `payload` - The payload prefix of the flow, used for signature matching.
    pub fn select(&self, flow: &FlowContext, payload: &[u8]) -> Option<AnalyzerTag> {
        if let Some(name) = flow.requested() {
            match self.registry.tag(name) {
                Some(tag) if self.registry.is_enabled(&tag) => return Some(tag),
                Some(_) => warn!(
                    "Analyzer {} requested for flow {} is disabled",
                    name,
                    flow.info()
                ),
                None => warn!(
                    "Analyzer {} requested for flow {} is not registered",
                    name,
                    flow.info()
                ),
            }
        }

        let info = flow.info();
        for port in [info.dst_port, info.src_port] {
            if let Some(descriptor) = self
                .registry
                .lookup(LookupKey::Port(info.transport, port))
            {
                if self.registry.is_enabled(descriptor.tag()) {
                    return Some(descriptor.tag().clone());
                }
            }
        }

        self.registry.signature_matches(payload).next().cloned()
    }

    /// Build an analyzer instance for a flow and bind it to the flow's identity.
    pub fn instantiate(
        &self,
        tag: &AnalyzerTag,
        flow: &FlowContext,
    ) -> Result<Box<dyn Analyzer>, DispatchError> {
        let descriptor = self
            .registry
            .descriptor(tag)
            .context(UnknownTagSnafu { tag: tag.clone() })?;
        let mut analyzer = descriptor
            .instantiate()
            .context(FactoryFailureSnafu { tag: tag.clone() })?;
        analyzer.on_init(flow.info());
        Ok(analyzer)
    }

    /// Select and bind an analyzer for the flow unless dispatch already decided.
    ///
    /// Payload is buffered on the flow until it is long enough for every signature. A flow
    /// with no match stays pending until then, so that a signature split over several
    /// segments is still found. Factory failures leave the flow unanalyzed.
    ///
    /// # Returns
    ///
    /// The flow's binding after dispatch.
    pub fn dispatch<'a>(&self, flow: &'a mut FlowContext, payload: &[u8]) -> &'a Binding {
        if *flow.binding() != Binding::Pending {
            return flow.binding();
        }

        let max_len = self.registry.max_signature_len();
        flow.extend_prefix(payload, max_len);

        match self.select(flow, flow.prefix()) {
            Some(tag) => match self.instantiate(&tag, flow) {
                Ok(analyzer) => {
                    debug!("Bound analyzer {} to flow {}", tag, flow.info());
                    flow.bind(tag, analyzer);
                }
                Err(e) => {
                    warn!("Flow {} proceeds unanalyzed: {}", flow.info(), e);
                    flow.mark_unanalyzed();
                }
            },
            None if flow.prefix().len() < max_len => {}
            None => flow.mark_unanalyzed(),
        }

        flow.binding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::initialize_with;
    use nt_analyzer::{
        component::ConstructSnafu, udp::UDPAnalyzer, ComponentDescriptor, FlowInfo, Plugin,
        PluginConfiguration, PropUpdate, Signature, Transport,
    };
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Named {
        bound_to: Option<i64>,
    }

    impl Analyzer for Named {
        fn name(&self) -> &str {
            "named"
        }

        fn limit(&self) -> u32 {
            0
        }

        fn on_init(&mut self, info: &FlowInfo) {
            self.bound_to = Some(info.uid);
        }

        fn feed(&mut self, _rev: bool, _data: &[u8]) -> (Option<PropUpdate>, bool) {
            (None, false)
        }

        fn close(&mut self, _limited: bool) -> Option<PropUpdate> {
            None
        }
    }

    struct TestPlugin {
        instantiated: Arc<AtomicUsize>,
    }

    impl Plugin for TestPlugin {
        fn configure(&self) -> PluginConfiguration {
            let counter = self.instantiated.clone();
            PluginConfiguration::new("Test::Dispatch", "dispatch test analyzers")
                .component(
                    ComponentDescriptor::of::<UDPAnalyzer>("UDP")
                        .with_port(Transport::UDP, 17),
                )
                .component(
                    ComponentDescriptor::new("PORTED", move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(Box::new(Named::default()) as Box<dyn Analyzer>)
                    })
                    .with_port(Transport::UDP, 5000),
                )
                .component(
                    ComponentDescriptor::of::<Named>("SIG_A")
                        .with_signature(Signature::new(0, b"AB".to_vec()).unwrap()),
                )
                .component(
                    ComponentDescriptor::of::<Named>("SIG_B")
                        .with_signature(Signature::new(0, b"A".to_vec()).unwrap()),
                )
                .component(
                    ComponentDescriptor::new("BROKEN", || {
                        ConstructSnafu {
                            analyzer: "BROKEN",
                            message: "resource exhausted",
                        }
                        .fail()
                    })
                    .with_port(Transport::UDP, 6666),
                )
                .component(
                    ComponentDescriptor::of::<Named>("OFF")
                        .with_port(Transport::UDP, 7777),
                )
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<AtomicUsize>) {
        let instantiated = Arc::new(AtomicUsize::new(0));
        let plugins: Vec<Box<dyn Plugin>> = vec![Box::new(TestPlugin {
            instantiated: instantiated.clone(),
        })];
        let registry = initialize_with(&plugins, |registry| registry.disable("OFF")).unwrap();
        (Dispatcher::new(registry).unwrap(), instantiated)
    }

    fn flow(dst_port: u16, requested: Option<&str>) -> FlowContext {
        FlowContext::new(
            FlowInfo {
                uid: 99,
                transport: Transport::UDP,
                src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                src_port: 40000,
                dst_port,
            },
            requested.map(str::to_string),
        )
    }

    #[test]
    fn test_requires_frozen_registry() {
        assert!(matches!(
            Dispatcher::new(Arc::new(Registry::new())),
            Err(RegistryError::NotFrozen)
        ));
    }

    #[test]
    fn test_port_dispatch() {
        let (dispatcher, _) = dispatcher();
        let mut ctx = flow(17, None);
        let tag = dispatcher.select(&ctx, b"").unwrap();
        assert_eq!(tag.name(), "UDP");

        let analyzer = dispatcher.instantiate(&tag, &ctx).unwrap();
        assert_eq!(analyzer.name(), "UDP");

        assert_eq!(
            dispatcher.dispatch(&mut ctx, b""),
            &Binding::Bound(AnalyzerTag::new("UDP"))
        );
        assert!(ctx.is_analyzing());
    }

    #[test]
    fn test_source_port_dispatch() {
        let (dispatcher, _) = dispatcher();
        // The well-known port is on the originator side.
        let mut info = flow(40001, None).info().clone();
        info.src_port = 17;
        let ctx = FlowContext::new(info, None);
        assert_eq!(dispatcher.select(&ctx, b"").unwrap().name(), "UDP");
    }

    #[test]
    fn test_explicit_request_outranks_port() {
        let (dispatcher, _) = dispatcher();
        let ctx = flow(17, Some("SIG_B"));
        assert_eq!(dispatcher.select(&ctx, b"AB").unwrap().name(), "SIG_B");
    }

    #[test]
    fn test_port_outranks_signature() {
        let (dispatcher, _) = dispatcher();
        let ctx = flow(5000, None);
        assert_eq!(dispatcher.select(&ctx, b"AB").unwrap().name(), "PORTED");
    }

    #[test]
    fn test_signature_in_registration_order() {
        let (dispatcher, _) = dispatcher();
        let ctx = flow(40002, None);
        assert_eq!(dispatcher.select(&ctx, b"ABC").unwrap().name(), "SIG_A");
        assert_eq!(dispatcher.select(&ctx, b"AC").unwrap().name(), "SIG_B");
    }

    #[test]
    fn test_unknown_or_disabled_request_falls_through() {
        let (dispatcher, _) = dispatcher();
        let ctx = flow(17, Some("NOPE"));
        assert_eq!(dispatcher.select(&ctx, b"").unwrap().name(), "UDP");
        let ctx = flow(17, Some("OFF"));
        assert_eq!(dispatcher.select(&ctx, b"").unwrap().name(), "UDP");
        // A disabled analyzer is not chosen through its port either.
        let ctx = flow(7777, None);
        assert!(dispatcher.select(&ctx, b"zz").is_none());
    }

    #[test]
    fn test_no_match() {
        let (dispatcher, instantiated) = dispatcher();
        let mut ctx = flow(40003, None);
        assert!(dispatcher.select(&ctx, b"zzz").is_none());

        // An empty payload keeps the decision open.
        assert_eq!(dispatcher.dispatch(&mut ctx, b""), &Binding::Pending);
        assert_eq!(dispatcher.dispatch(&mut ctx, b"zzz"), &Binding::Unanalyzed);
        // Decided: a later matching payload does not re-select.
        assert_eq!(dispatcher.dispatch(&mut ctx, b"AB"), &Binding::Unanalyzed);
        assert!(!ctx.is_analyzing());
        assert_eq!(instantiated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_short_prefix_stays_pending() {
        let (dispatcher, _) = dispatcher();
        let mut ctx = flow(40004, None);
        // SIG_A needs two bytes: one unknown byte cannot rule it out yet.
        assert_eq!(dispatcher.dispatch(&mut ctx, b"z"), &Binding::Pending);
        assert_eq!(ctx.prefix(), b"z");
        assert_eq!(dispatcher.dispatch(&mut ctx, b"B"), &Binding::Unanalyzed);
        assert!(ctx.prefix().is_empty());

        let mut ctx = flow(40005, None);
        assert_eq!(
            dispatcher.dispatch(&mut ctx, b"A"),
            &Binding::Bound(AnalyzerTag::new("SIG_B"))
        );
    }

    #[test]
    fn test_split_signature_longer_than_segments() {
        struct Split;

        impl Plugin for Split {
            fn configure(&self) -> PluginConfiguration {
                PluginConfiguration::new("Test::Split", "split signature").component(
                    ComponentDescriptor::of::<Named>("ABCD")
                        .with_signature(Signature::new(0, b"ABCD".to_vec()).unwrap()),
                )
            }
        }

        let plugins: Vec<Box<dyn Plugin>> = vec![Box::new(Split)];
        let dispatcher = Dispatcher::new(crate::registry::initialize(&plugins).unwrap()).unwrap();
        let mut ctx = flow(40006, None);
        assert_eq!(dispatcher.dispatch(&mut ctx, b"AB"), &Binding::Pending);
        assert_eq!(
            dispatcher.dispatch(&mut ctx, b"CD"),
            &Binding::Bound(AnalyzerTag::new("ABCD"))
        );
    }

    #[test]
    fn test_binding_is_idempotent() {
        let (dispatcher, instantiated) = dispatcher();
        let mut ctx = flow(5000, None);
        for payload in [&b"AB"[..], b"", b"xyz"] {
            assert_eq!(
                dispatcher.dispatch(&mut ctx, payload),
                &Binding::Bound(AnalyzerTag::new("PORTED"))
            );
        }
        assert_eq!(instantiated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_factory_failure_leaves_flow_unanalyzed() {
        let (dispatcher, _) = dispatcher();
        let mut ctx = flow(6666, None);
        let tag = dispatcher.select(&ctx, b"").unwrap();
        assert!(matches!(
            dispatcher.instantiate(&tag, &ctx),
            Err(DispatchError::FactoryFailure { .. })
        ));
        assert_eq!(dispatcher.dispatch(&mut ctx, b""), &Binding::Unanalyzed);
    }

    #[test]
    fn test_instantiate_unknown_tag() {
        let (dispatcher, _) = dispatcher();
        let ctx = flow(1, None);
        assert!(matches!(
            dispatcher.instantiate(&AnalyzerTag::new("udp"), &ctx),
            Err(DispatchError::UnknownTag { .. })
        ));
    }

    #[test]
    fn test_instances_are_bound_to_their_flow() {
        let (dispatcher, _) = dispatcher();
        let tag = AnalyzerTag::new("SIG_A");
        let ctx = flow(1, None);
        let analyzer = dispatcher.instantiate(&tag, &ctx).unwrap();
        assert_eq!(format!("{:?}", analyzer), "Named { bound_to: Some(99) }");
    }

    #[test]
    fn test_concurrent_dispatch() {
        let (dispatcher, instantiated) = dispatcher();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                std::thread::spawn(move || {
                    let mut ctx = flow(5000, None);
                    dispatcher.dispatch(&mut ctx, b"").clone()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(
                handle.join().unwrap(),
                Binding::Bound(AnalyzerTag::new("PORTED"))
            );
        }
        assert_eq!(instantiated.load(Ordering::SeqCst), 4);
    }
}
