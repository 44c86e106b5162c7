//! The built-in UDP plugin.
//!
//! It contributes one component, `UDP`. The analyzer behind it does not interpret the
//! datagrams; it only keeps per-direction datagram and byte counters which are reported
//! when the flow is closed.

use std::sync::Arc;

use tracing::debug;

use crate::{
    Analyzer, ComponentDescriptor, FlowInfo, Plugin, PluginConfiguration, PropMap, PropUpdate,
    PropUpdateType,
};

/// The name the UDP analyzer is registered under.
pub const UDP_ANALYZER_NAME: &str = "UDP";

/// `UDPPlugin` declares the UDP analyzer.
#[derive(Debug, Default)]
pub struct UDPPlugin;

impl UDPPlugin {
    /// Construct the plugin.
    pub fn new() -> Self {
        Self
    }
}

impl Plugin for UDPPlugin {
    fn configure(&self) -> PluginConfiguration {
        PluginConfiguration::new("Zeek::UDP", "UDP Analyzer")
            .version(0, 1)
            .component(ComponentDescriptor::of::<UDPAnalyzer>(UDP_ANALYZER_NAME))
    }
}

/// Per-direction counters.
#[derive(Debug, Default, Clone, Copy)]
struct Endpoint {
    pkts: u64,
    bytes: u64,
}

impl Endpoint {
    fn to_prop_map(self) -> PropMap {
        let mut map = PropMap::new();
        map.insert("pkts".to_string(), Arc::new(self.pkts));
        map.insert("bytes".to_string(), Arc::new(self.bytes));
        map
    }
}

/// `UDPAnalyzer` implements `Analyzer` for UDP flows.
#[derive(Debug, Default)]
pub struct UDPAnalyzer {
    uid: Option<i64>,
    orig: Endpoint,
    resp: Endpoint,
}

impl Analyzer for UDPAnalyzer {
    fn name(&self) -> &str {
        UDP_ANALYZER_NAME
    }

    /// Datagram counting never needs to stop early.
    fn limit(&self) -> u32 {
        0
    }

    fn on_init(&mut self, info: &FlowInfo) {
        debug!("UDP analyzer bound to flow {}", info);
        self.uid = Some(info.uid);
    }

    fn feed(&mut self, rev: bool, data: &[u8]) -> (Option<PropUpdate>, bool) {
        let endpoint = if rev { &mut self.resp } else { &mut self.orig };
        endpoint.pkts += 1;
        endpoint.bytes += data.len() as u64;
        (None, false)
    }

    fn close(&mut self, limited: bool) -> Option<PropUpdate> {
        debug!(
            "UDP analyzer closed: uid = {:?}, limited = {}",
            self.uid, limited
        );

        let mut map = PropMap::new();
        map.insert("orig".to_string(), Arc::new(self.orig.to_prop_map()));
        map.insert("resp".to_string(), Arc::new(self.resp.to_prop_map()));

        Some(PropUpdate {
            update_type: PropUpdateType::Replace,
            map,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(update: &PropUpdate, side: &str, key: &str) -> u64 {
        *update
            .map
            .get(side)
            .unwrap()
            .downcast_ref::<PropMap>()
            .unwrap()
            .get(key)
            .unwrap()
            .downcast_ref::<u64>()
            .unwrap()
    }

    #[test]
    fn test_udp_plugin_configuration() {
        let config = UDPPlugin::new().configure();
        assert_eq!(config.name, "Zeek::UDP");
        assert_eq!(config.description, "UDP Analyzer");
        assert_eq!(config.components.len(), 1);
        assert_eq!(config.components[0].name(), "UDP");
        assert!(config.components[0].ports().is_empty());
    }

    #[test]
    fn test_udp_analyzer_counts() {
        let mut analyzer = UDPAnalyzer::default();
        assert_eq!(analyzer.name(), "UDP");
        assert_eq!(analyzer.limit(), 0);

        assert_eq!(analyzer.feed(false, b"hello").1, false);
        analyzer.feed(false, b"hi");
        analyzer.feed(true, b"world!");

        let update = analyzer.close(false).unwrap();
        assert_eq!(update.update_type, PropUpdateType::Replace);
        assert_eq!(counter(&update, "orig", "pkts"), 2);
        assert_eq!(counter(&update, "orig", "bytes"), 7);
        assert_eq!(counter(&update, "resp", "pkts"), 1);
        assert_eq!(counter(&update, "resp", "bytes"), 6);
    }

    #[test]
    fn test_udp_descriptor_instantiates() {
        let config = UDPPlugin::new().configure();
        let instance = config.components[0].instantiate().unwrap();
        assert_eq!(instance.name(), "UDP");
    }
}
